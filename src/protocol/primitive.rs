// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Big-endian PLC-data codec.
//!
//! Every `encode_*` produces exactly `DataType::byte_len()` bytes;
//! `decode_*` fails with `S7Error::MalformedPayload`-equivalent
//! (`BadType`) when the input length or variant doesn't match.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use crate::{
    error::S7Error,
    protocol::value::{DataType, Value},
};

fn need(buf: &[u8], len: usize, what: &str) -> Result<(), S7Error> {
    if buf.len() != len {
        return Err(S7Error::BadType(format!(
            "{what}: expected {len} bytes, got {}",
            buf.len()
        )));
    }
    Ok(())
}

/// Encodes `value` against `ty`, returning exactly `ty.byte_len()` bytes.
pub fn encode(ty: &DataType, value: &Value) -> Result<Vec<u8>, S7Error> {
    value.check_type(ty)?;
    match (ty, value) {
        (DataType::Bool, Value::Bool(b)) => Ok(vec![if *b { 1 } else { 0 }]),
        (DataType::Byte, Value::Byte(b)) => Ok(vec![*b]),
        (DataType::Word, Value::U16(v)) => Ok(v.to_be_bytes().to_vec()),
        (DataType::Int, Value::I16(v)) => Ok(v.to_be_bytes().to_vec()),
        (DataType::Dword, Value::U32(v)) => Ok(v.to_be_bytes().to_vec()),
        (DataType::Udint, Value::U32(v)) => Ok(v.to_be_bytes().to_vec()),
        (DataType::Dint, Value::I32(v)) => Ok(v.to_be_bytes().to_vec()),
        (DataType::Real, Value::F32(v)) => Ok(v.to_be_bytes().to_vec()),
        (DataType::Lreal, Value::F64(v)) => Ok(v.to_be_bytes().to_vec()),
        (DataType::Counter, Value::U16(v)) => Ok(v.to_be_bytes().to_vec()),
        (DataType::Timer, Value::U16(v)) => Ok(encode_timer(*v)),
        (DataType::Char, Value::Byte(b)) => Ok(vec![*b]),
        (DataType::StringReserved { reserved }, Value::String(s)) => {
            encode_s7_string(s, *reserved)
        },
        (DataType::WstringReserved { reserved }, Value::String(s)) => {
            encode_s7_wstring(s, *reserved)
        },
        (DataType::Time, Value::Time(ms)) => Ok(ms.to_be_bytes().to_vec()),
        (DataType::DateTime, Value::Date(dt)) => encode_date_and_time(*dt),
        (DataType::Dtl, Value::Dtl(dt)) => Ok(encode_dtl(*dt)),
        (DataType::Bytes { len }, Value::Bytes(b)) => {
            if b.len() as u32 != *len {
                return Err(S7Error::BadType(format!(
                    "BYTES: expected {len} bytes, got {}",
                    b.len()
                )));
            }
            Ok(b.clone())
        },
        (DataType::Array { element, len }, Value::Array(items)) => {
            if items.len() as u32 != *len {
                return Err(S7Error::BadType(format!(
                    "ARRAY: expected {len} elements, got {}",
                    items.len()
                )));
            }
            let mut out = Vec::with_capacity((element.byte_len() * len) as usize);
            for item in items {
                out.extend(encode(element, item)?);
            }
            Ok(out)
        },
        _ => unreachable!("check_type already rejected mismatched (type, value) pairs"),
    }
}

/// Decodes `buf` (exactly `ty.byte_len()` bytes) against `ty`.
pub fn decode(ty: &DataType, buf: &[u8]) -> Result<Value, S7Error> {
    match ty {
        DataType::Bool => {
            need(buf, 1, "BOOL")?;
            Ok(Value::Bool(buf[0] != 0))
        },
        DataType::Byte => {
            need(buf, 1, "BYTE")?;
            Ok(Value::Byte(buf[0]))
        },
        DataType::Char => {
            need(buf, 1, "CHAR")?;
            Ok(Value::Byte(buf[0]))
        },
        DataType::Word => {
            need(buf, 2, "WORD")?;
            Ok(Value::U16(u16::from_be_bytes([buf[0], buf[1]])))
        },
        DataType::Int => {
            need(buf, 2, "INT")?;
            Ok(Value::I16(i16::from_be_bytes([buf[0], buf[1]])))
        },
        DataType::Counter => {
            need(buf, 2, "COUNTER")?;
            // Plain unsigned big-endian; see design notes on the BCD
            // Open Question.
            Ok(Value::U16(u16::from_be_bytes([buf[0], buf[1]])))
        },
        DataType::Timer => {
            need(buf, 2, "TIMER")?;
            Ok(Value::U16(decode_timer(u16::from_be_bytes([
                buf[0], buf[1],
            ]))?))
        },
        DataType::Dword => {
            need(buf, 4, "DWORD")?;
            Ok(Value::U32(u32::from_be_bytes(buf.try_into().unwrap())))
        },
        DataType::Udint => {
            need(buf, 4, "UDINT")?;
            Ok(Value::U32(u32::from_be_bytes(buf.try_into().unwrap())))
        },
        DataType::Dint => {
            need(buf, 4, "DINT")?;
            Ok(Value::I32(i32::from_be_bytes(buf.try_into().unwrap())))
        },
        DataType::Real => {
            need(buf, 4, "REAL")?;
            Ok(Value::F32(f32::from_be_bytes(buf.try_into().unwrap())))
        },
        DataType::Lreal => {
            need(buf, 8, "LREAL")?;
            Ok(Value::F64(f64::from_be_bytes(buf.try_into().unwrap())))
        },
        DataType::Time => {
            need(buf, 4, "TIME")?;
            Ok(Value::Time(i32::from_be_bytes(buf.try_into().unwrap())))
        },
        DataType::StringReserved { .. } => Ok(Value::String(decode_s7_string(buf)?)),
        DataType::WstringReserved { .. } => Ok(Value::String(decode_s7_wstring(buf)?)),
        DataType::DateTime => {
            need(buf, 8, "DATE_AND_TIME")?;
            Ok(Value::Date(decode_date_and_time(buf)?))
        },
        DataType::Dtl => {
            need(buf, 12, "DTL")?;
            Ok(Value::Dtl(decode_dtl(buf)?))
        },
        DataType::Bytes { len } => {
            need(buf, *len as usize, "BYTES")?;
            Ok(Value::Bytes(buf.to_vec()))
        },
        DataType::Array { element, len } => {
            let elem_len = element.byte_len() as usize;
            need(buf, elem_len * (*len as usize), "ARRAY")?;
            let mut items = Vec::with_capacity(*len as usize);
            for chunk in buf.chunks_exact(elem_len) {
                items.push(decode(element, chunk)?);
            }
            Ok(Value::Array(items))
        },
    }
}

/// Encodes a BOOL as the single byte written for a bit-addressed write:
/// the target bit set, all other bits zero.
pub fn encode_bool_bit(value: bool) -> u8 {
    if value { 1 } else { 0 }
}

/// Reads back the bit at `bit_offset` from a byte read for a bit-addressed
/// read.
pub fn decode_bool_bit(byte: u8, bit_offset: u8) -> bool {
    (byte >> bit_offset) & 1 != 0
}

const S7_STRING_HEADER_LEN: usize = 2;
const S7_WSTRING_HEADER_LEN: usize = 4;

fn encode_s7_string(s: &str, reserved: u8) -> Result<Vec<u8>, S7Error> {
    let bytes = s.as_bytes();
    if bytes.len() > reserved as usize {
        return Err(S7Error::BadType(format!(
            "S7String: {} bytes exceeds reserved capacity {reserved}",
            bytes.len()
        )));
    }
    let mut out = Vec::with_capacity(S7_STRING_HEADER_LEN + reserved as usize);
    out.push(reserved);
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
    out.resize(S7_STRING_HEADER_LEN + reserved as usize, 0);
    Ok(out)
}

fn decode_s7_string(buf: &[u8]) -> Result<String, S7Error> {
    if buf.len() < S7_STRING_HEADER_LEN {
        return Err(S7Error::BadType("S7String: header truncated".into()));
    }
    let reserved = buf[0];
    let actual = buf[1];
    if actual > reserved {
        return Err(S7Error::BadType(format!(
            "S7String: actual length {actual} exceeds reserved {reserved}"
        )));
    }
    let start = S7_STRING_HEADER_LEN;
    let end = start + actual as usize;
    let slice = buf
        .get(start..end)
        .ok_or_else(|| S7Error::BadType("S7String: payload shorter than actual length".into()))?;
    Ok(String::from_utf8_lossy(slice).into_owned())
}

fn encode_s7_wstring(s: &str, reserved: u16) -> Result<Vec<u8>, S7Error> {
    let units: Vec<u16> = s.encode_utf16().collect();
    if units.len() > reserved as usize {
        return Err(S7Error::BadType(format!(
            "S7WString: {} units exceeds reserved capacity {reserved}",
            units.len()
        )));
    }
    let mut out = Vec::with_capacity(S7_WSTRING_HEADER_LEN + 2 * reserved as usize);
    out.extend_from_slice(&reserved.to_be_bytes());
    out.extend_from_slice(&(units.len() as u16).to_be_bytes());
    for u in &units {
        out.extend_from_slice(&u.to_be_bytes());
    }
    out.resize(S7_WSTRING_HEADER_LEN + 2 * reserved as usize, 0);
    Ok(out)
}

fn decode_s7_wstring(buf: &[u8]) -> Result<String, S7Error> {
    if buf.len() < S7_WSTRING_HEADER_LEN {
        return Err(S7Error::BadType("S7WString: header truncated".into()));
    }
    let reserved = u16::from_be_bytes([buf[0], buf[1]]);
    let actual = u16::from_be_bytes([buf[2], buf[3]]);
    if actual > reserved {
        return Err(S7Error::BadType(format!(
            "S7WString: actual length {actual} exceeds reserved {reserved}"
        )));
    }
    let start = S7_WSTRING_HEADER_LEN;
    let end = start + 2 * actual as usize;
    let slice = buf.get(start..end).ok_or_else(|| {
        S7Error::BadType("S7WString: payload shorter than actual length".into())
    })?;
    let units: Vec<u16> = slice
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units)
        .map_err(|e| S7Error::BadType(format!("S7WString: invalid UTF-16: {e}")))
}

/// TIMER word layout (S5TIME): bits 15-14 reserved, bits 13-12 the time
/// base {10ms, 100ms, 1s, 10s}, bits 11-0 three BCD digits (0..999).
fn decode_timer(word: u16) -> Result<u16, S7Error> {
    let base_code = (word >> 12) & 0b11;
    let base_ms: u32 = match base_code {
        0b00 => 10,
        0b01 => 100,
        0b10 => 1000,
        0b11 => 10_000,
        _ => unreachable!(),
    };
    let bcd = word & 0x0FFF;
    let digits = bcd_to_u16(bcd)?;
    let total_ms = u32::from(digits) * base_ms;
    u16::try_from(total_ms)
        .map_err(|_| S7Error::BadType(format!("TIMER: decoded value {total_ms}ms overflows u16")))
}

fn encode_timer(total_ms: u16) -> Vec<u8> {
    // Pick the coarsest base that represents `total_ms` exactly with a
    // 3-digit BCD count, falling back to the finest base otherwise.
    let (base_code, base_ms): (u16, u32) = if total_ms % 10_000 == 0 && total_ms / 10_000 <= 999 {
        (0b11, 10_000)
    } else if total_ms % 1000 == 0 && u32::from(total_ms) / 1000 <= 999 {
        (0b10, 1000)
    } else if total_ms % 100 == 0 && u32::from(total_ms) / 100 <= 999 {
        (0b01, 100)
    } else {
        (0b00, 10)
    };
    let digits = (u32::from(total_ms) / base_ms).min(999) as u16;
    let word = (base_code << 12) | u16_to_bcd(digits);
    word.to_be_bytes().to_vec()
}

fn bcd_to_u16(bcd: u16) -> Result<u16, S7Error> {
    let d0 = (bcd >> 8) & 0xF;
    let d1 = (bcd >> 4) & 0xF;
    let d2 = bcd & 0xF;
    if d0 > 9 || d1 > 9 || d2 > 9 {
        return Err(S7Error::BadType(format!("invalid BCD nibble in 0x{bcd:03x}")));
    }
    Ok(d0 * 100 + d1 * 10 + d2)
}

fn u16_to_bcd(v: u16) -> u16 {
    let v = v.min(999);
    let d0 = v / 100;
    let d1 = (v / 10) % 10;
    let d2 = v % 10;
    (d0 << 8) | (d1 << 4) | d2
}

fn bcd_byte_to_u8(b: u8) -> Result<u8, S7Error> {
    let hi = b >> 4;
    let lo = b & 0xF;
    if hi > 9 || lo > 9 {
        return Err(S7Error::BadType(format!("invalid BCD byte 0x{b:02x}")));
    }
    Ok(hi * 10 + lo)
}

fn u8_to_bcd_byte(v: u8) -> u8 {
    let v = v.min(99);
    ((v / 10) << 4) | (v % 10)
}

/// DATE_AND_TIME: YY MM DD HH MI SS MSEC(hi,mid) MSEC(lo)/DOW.
fn decode_date_and_time(buf: &[u8]) -> Result<NaiveDateTime, S7Error> {
    let yy = bcd_byte_to_u8(buf[0])? as i32;
    let year = if yy <= 89 { 2000 + yy } else { 1900 + yy };
    let month = bcd_byte_to_u8(buf[1])?;
    let day = bcd_byte_to_u8(buf[2])?;
    let hour = bcd_byte_to_u8(buf[3])?;
    let minute = bcd_byte_to_u8(buf[4])?;
    let second = bcd_byte_to_u8(buf[5])?;
    let ms_hi = bcd_byte_to_u8(buf[6])? as u32;
    let ms_lo = (buf[7] >> 4) as u32;
    let ms = ms_hi * 10 + ms_lo;

    let date = NaiveDate::from_ymd_opt(year, u32::from(month), u32::from(day))
        .ok_or_else(|| S7Error::BadType("DATE_AND_TIME: invalid calendar date".into()))?;
    let time = NaiveTime::from_hms_milli_opt(u32::from(hour), u32::from(minute), u32::from(second), ms)
        .ok_or_else(|| S7Error::BadType("DATE_AND_TIME: invalid time of day".into()))?;
    Ok(NaiveDateTime::new(date, time))
}

fn encode_date_and_time(dt: NaiveDateTime) -> Result<Vec<u8>, S7Error> {
    let year = dt.year();
    let yy = if (2000..=2089).contains(&year) {
        (year - 2000) as u8
    } else if (1990..=1999).contains(&year) {
        (year - 1900) as u8
    } else {
        return Err(S7Error::BadType(format!(
            "DATE_AND_TIME: year {year} outside representable 1990..2089 range"
        )));
    };
    let ms = dt.and_utc().timestamp_subsec_millis();
    let dow = dt.weekday().num_days_from_sunday() as u8 + 1; // Sun=1..Sat=7

    Ok(vec![
        u8_to_bcd_byte(yy),
        u8_to_bcd_byte(dt.month() as u8),
        u8_to_bcd_byte(dt.day() as u8),
        u8_to_bcd_byte(dt.hour() as u8),
        u8_to_bcd_byte(dt.minute() as u8),
        u8_to_bcd_byte(dt.second() as u8),
        u8_to_bcd_byte((ms / 10) as u8),
        (((ms % 10) as u8) << 4) | dow,
    ])
}

/// DTL: year(2B BE), month, day, weekday(Sun=1..Sat=7, informational),
/// hour, minute, second, nanoseconds(4B BE).
fn decode_dtl(buf: &[u8]) -> Result<NaiveDateTime, S7Error> {
    let year = i32::from(u16::from_be_bytes([buf[0], buf[1]]));
    let month = buf[2];
    let day = buf[3];
    // buf[4] is the weekday; derivable from the date, not authoritative.
    let hour = buf[5];
    let minute = buf[6];
    let second = buf[7];
    let nanos = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

    let date = NaiveDate::from_ymd_opt(year, u32::from(month), u32::from(day))
        .ok_or_else(|| S7Error::BadType("DTL: invalid calendar date".into()))?;
    let time = NaiveTime::from_hms_nano_opt(u32::from(hour), u32::from(minute), u32::from(second), nanos)
        .ok_or_else(|| S7Error::BadType("DTL: invalid time of day".into()))?;
    Ok(NaiveDateTime::new(date, time))
}

fn encode_dtl(dt: NaiveDateTime) -> Vec<u8> {
    let year = (dt.year() as u16).to_be_bytes();
    let dow = dt.weekday().num_days_from_sunday() as u8 + 1;
    let nanos = dt.and_utc().timestamp_subsec_nanos();
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&year);
    out.push(dt.month() as u8);
    out.push(dt.day() as u8);
    out.push(dow);
    out.push(dt.hour() as u8);
    out.push(dt.minute() as u8);
    out.push(dt.second() as u8);
    out.extend_from_slice(&nanos.to_be_bytes());
    out
}
