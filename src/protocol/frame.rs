// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! TPKT/COTP/S7-Comm frame codec.
//!
//! Fixed-layout headers (TPKT, the S7 Job/Ack-Data headers) are modeled
//! as `#[repr(C)]` zerocopy structs so the header fields can be read back
//! safely after a response is received; the variable-length item/data
//! lists are built and parsed by hand since their shape depends on the
//! item count.

use zerocopy::{BigEndian, FromBytes, Immutable, IntoBytes, KnownLayout, U16};

use crate::{
    error::S7Error,
    protocol::{
        location::Location,
        value::{DataType, TransportSize},
    },
};

/// `function` byte identifying ReadVar requests/responses.
pub const FUNC_READ_VAR: u8 = 0x04;
/// `function` byte identifying WriteVar requests/responses.
pub const FUNC_WRITE_VAR: u8 = 0x05;
/// `function` byte identifying Setup Communication.
pub const FUNC_SETUP_COMM: u8 = 0xF0;

/// Variable-spec type byte fixed at `0x12` for every S7 item.
const VAR_SPEC_TYPE: u8 = 0x12;
/// Length of the remaining item-spec bytes after `VAR_SPEC_TYPE` and this
/// byte itself — always 10 for the addressing mode this crate builds.
const VAR_SPEC_LEN: u8 = 0x0A;
/// Syntax ID for "any" addressing, the only one this crate emits.
const SYNTAX_ID_ANY: u8 = 0x10;

/// Item return code meaning success.
pub const ITEM_RETURN_OK: u8 = 0xFF;

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct TpktHeader {
    version: u8,
    reserved: u8,
    length: U16<BigEndian>,
}

const TPKT_LEN: usize = 4;
const COTP_DT_LEN: usize = 3;
const S7_JOB_HEADER_LEN: usize = 10;
const S7_ACK_HEADER_LEN: usize = 12;

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct S7JobHeader {
    protocol_id: u8,
    pdu_type: u8,
    reserved: U16<BigEndian>,
    pdu_ref: U16<BigEndian>,
    param_len: U16<BigEndian>,
    data_len: U16<BigEndian>,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct S7AckHeader {
    protocol_id: u8,
    pdu_type: u8,
    reserved: U16<BigEndian>,
    pdu_ref: U16<BigEndian>,
    param_len: U16<BigEndian>,
    data_len: U16<BigEndian>,
    err_class: u8,
    err_code: u8,
}

const PDU_TYPE_JOB: u8 = 0x01;
const PDU_TYPE_ACK_DATA: u8 = 0x03;

/// One address to read, carried through a batch until its response is
/// decoded. `data_type` picks the transport size (bit/byte-word/octet-
/// string) the item spec is built with — it is not necessarily the tag's
/// full type, since a split range read carries a `DataType::Bytes` chunk
/// instead.
#[derive(Debug, Clone)]
pub struct ReadItem {
    pub location: Location,
    pub data_type: DataType,
}

/// One address/value pair to write. `data_type` drives the same transport
/// selection `ReadItem` uses.
#[derive(Debug, Clone)]
pub struct WriteItem {
    pub location: Location,
    pub data_type: DataType,
    pub data: Vec<u8>,
}

/// One item's result from a ReadVar response.
#[derive(Debug, Clone)]
pub struct ItemResult {
    pub return_code: u8,
    pub payload: Vec<u8>,
}

fn push_tpkt_cotp(buf: &mut Vec<u8>) {
    // Placeholder TPKT header; patched in `finalize_tpkt_length`.
    buf.extend_from_slice(&[0x03, 0x00, 0x00, 0x00]);
    buf.extend_from_slice(&[0x02, 0xF0, 0x80]);
}

fn finalize_tpkt_length(buf: &mut [u8]) {
    let len = buf.len() as u16;
    let hdr = TpktHeader::mut_from_bytes(&mut buf[..TPKT_LEN]).expect("buffer holds a TPKT header");
    hdr.version = 3;
    hdr.reserved = 0;
    hdr.length.set(len);
}

fn push_job_header(buf: &mut Vec<u8>, pdu_ref: u16, param_len: u16, data_len: u16) {
    let hdr = S7JobHeader {
        protocol_id: 0x32,
        pdu_type: PDU_TYPE_JOB,
        reserved: U16::new(0),
        pdu_ref: U16::new(pdu_ref),
        param_len: U16::new(param_len),
        data_len: U16::new(data_len),
    };
    buf.extend_from_slice(hdr.as_bytes());
}

fn item_spec_bytes(loc: &Location, transport: TransportSize, width_bits: u32) -> [u8; 12] {
    let addr = (loc.start_byte << 3) | u32::from(loc.bit_offset);
    let length_field: u16 = match transport {
        TransportSize::OctetString => width_bits.div_ceil(8) as u16,
        _ => width_bits as u16,
    };
    let len_be = length_field.to_be_bytes();
    let db_be = loc.db_number.to_be_bytes();
    let addr_be = addr.to_be_bytes(); // 4 bytes, we take the low 3
    [
        VAR_SPEC_TYPE,
        VAR_SPEC_LEN,
        SYNTAX_ID_ANY,
        transport.wire_code(),
        len_be[0],
        len_be[1],
        db_be[0],
        db_be[1],
        loc.area.wire_code(),
        addr_be[1],
        addr_be[2],
        addr_be[3],
    ]
}

/// Builds a complete ReadVar request (TPKT+COTP+S7-Job), function 0x04.
pub fn build_read_var_request(pdu_ref: u16, items: &[ReadItem]) -> Result<Vec<u8>, S7Error> {
    if items.len() > 255 {
        return Err(S7Error::TooManyItems(items.len()));
    }
    let mut buf = Vec::with_capacity(19 + 12 * items.len());
    push_tpkt_cotp(&mut buf);

    let param_len = 2 + 12 * items.len() as u16;
    push_job_header(&mut buf, pdu_ref, param_len, 0);

    buf.push(FUNC_READ_VAR);
    buf.push(items.len() as u8);
    for item in items {
        let transport = item.data_type.transport_size();
        let width_bits = item_spec_width_bits(&item.location, &item.data_type, transport);
        buf.extend_from_slice(&item_spec_bytes(&item.location, transport, width_bits));
    }

    finalize_tpkt_length(&mut buf);
    Ok(buf)
}

/// Builds a complete WriteVar request (TPKT+COTP+S7-Job), function 0x05.
pub fn build_write_var_request(pdu_ref: u16, items: &[WriteItem]) -> Result<Vec<u8>, S7Error> {
    if items.len() > 255 {
        return Err(S7Error::TooManyItems(items.len()));
    }
    let mut buf = Vec::with_capacity(19 + 16 * items.len());
    push_tpkt_cotp(&mut buf);

    let param_len = 2 + 12 * items.len() as u16;

    let mut data_section = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        let transport = item.data_type.transport_size();
        let length_field: u16 = match transport {
            TransportSize::OctetString => item.data.len() as u16,
            _ => item.location.width_bits as u16,
        };
        data_section.push(ITEM_RETURN_OK); // return-code placeholder
        data_section.push(transport.wire_code());
        data_section.extend_from_slice(&length_field.to_be_bytes());
        data_section.extend_from_slice(&item.data);
        let is_last = idx + 1 == items.len();
        if !is_last && item.data.len() % 2 == 1 {
            data_section.push(0x00);
        }
    }

    push_job_header(&mut buf, pdu_ref, param_len, data_section.len() as u16);

    buf.push(FUNC_WRITE_VAR);
    buf.push(items.len() as u8);
    for item in items {
        let transport = item.data_type.transport_size();
        let width_bits = item_spec_width_bits(&item.location, &item.data_type, transport);
        buf.extend_from_slice(&item_spec_bytes(&item.location, transport, width_bits));
    }
    buf.extend_from_slice(&data_section);

    finalize_tpkt_length(&mut buf);
    Ok(buf)
}

/// Width fed into the item spec's length field. Bit/byte-word items are
/// sized off the address's own width (the S5-style "length in bits"
/// convention `item_spec_bytes` expects); octet-string items (STRING,
/// WSTRING, BYTES, ARRAY, and split byte-range chunks) are sized off the
/// data type's actual byte length instead, since `Location::width_bits`
/// is not generally kept in sync with a variable-length type.
fn item_spec_width_bits(loc: &Location, data_type: &DataType, transport: TransportSize) -> u32 {
    match transport {
        TransportSize::OctetString => data_type.byte_len() * 8,
        _ => loc.width_bits,
    }
}

const RESPONSE_MIN_LEN: usize = 21;

/// Parses a ReadVar response. Per contract, a buffer shorter than the
/// minimal header+ack length yields an empty list rather than an error —
/// callers treat that as "nothing decodable yet" while reassembling a
/// split TCP read.
pub fn parse_read_var_response(bytes: &[u8], n_items_expected: usize) -> Vec<ItemResult> {
    if bytes.len() < RESPONSE_MIN_LEN {
        return Vec::new();
    }

    let ack_start = TPKT_LEN + COTP_DT_LEN;
    let Some(ack_hdr) = S7AckHeader::ref_from_bytes(&bytes[ack_start..ack_start + S7_ACK_HEADER_LEN]).ok()
    else {
        return Vec::new();
    };
    if ack_hdr.pdu_type != PDU_TYPE_ACK_DATA {
        return Vec::new();
    }
    // A PDU-level error class faults the whole batch even if items follow
    // (design decision recorded alongside the Counter/Timer ones).
    if ack_hdr.err_class != 0 || ack_hdr.err_code != 0 {
        return Vec::new();
    }

    let param_start = ack_start + S7_ACK_HEADER_LEN;
    if bytes.len() < param_start + 2 {
        return Vec::new();
    }
    let n_items = bytes[param_start + 1] as usize;

    let mut cursor = param_start + 2;
    let mut out = Vec::with_capacity(n_items);
    for i in 0..n_items {
        if cursor + 4 > bytes.len() {
            break;
        }
        let return_code = bytes[cursor];
        let transport_byte = bytes[cursor + 1];
        let length_field = u16::from_be_bytes([bytes[cursor + 2], bytes[cursor + 3]]);
        cursor += 4;

        let payload_len = if transport_byte == TransportSize::OctetString.wire_code() {
            length_field as usize
        } else {
            (length_field as usize).div_ceil(8)
        };
        if cursor + payload_len > bytes.len() {
            break;
        }
        let payload = bytes[cursor..cursor + payload_len].to_vec();
        cursor += payload_len;

        let is_last = i + 1 == n_items;
        if !is_last && payload_len % 2 == 1 {
            cursor += 1;
        }
        out.push(ItemResult { return_code, payload });
    }
    let _ = n_items_expected;
    out
}

/// Parses a WriteVar response data section: `n` single-byte return codes.
pub fn parse_write_var_response(bytes: &[u8], n: usize) -> Vec<u8> {
    if bytes.len() < RESPONSE_MIN_LEN {
        return Vec::new();
    }
    let ack_start = TPKT_LEN + COTP_DT_LEN;
    let data_start = ack_start + S7_ACK_HEADER_LEN + 2; // +2: func byte + n_items byte in param section
    if bytes.len() < data_start + n {
        return Vec::new();
    }
    bytes[data_start..data_start + n].to_vec()
}

/// Builds the Setup Communication request, the first PDU sent after the
/// COTP connection is established.
pub fn build_setup_communication_request(
    pdu_ref: u16,
    max_amq_caller: u16,
    max_amq_callee: u16,
    proposed_pdu_length: u16,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(25);
    push_tpkt_cotp(&mut buf);
    push_job_header(&mut buf, pdu_ref, 8, 0);
    buf.push(FUNC_SETUP_COMM);
    buf.push(0x00); // reserved
    buf.extend_from_slice(&max_amq_caller.to_be_bytes());
    buf.extend_from_slice(&max_amq_callee.to_be_bytes());
    buf.extend_from_slice(&proposed_pdu_length.to_be_bytes());
    finalize_tpkt_length(&mut buf);
    buf
}

/// Negotiated Setup Communication parameters.
#[derive(Debug, Clone, Copy)]
pub struct SetupCommResult {
    pub max_amq_caller: u16,
    pub max_amq_callee: u16,
    pub pdu_length: u16,
}

/// Parses a Setup Communication response, failing with `SetupRejected`
/// when the Ack header reports a PDU-level error or the buffer is too
/// short to contain the negotiated parameters.
pub fn parse_setup_communication_response(bytes: &[u8]) -> Result<SetupCommResult, S7Error> {
    let ack_start = TPKT_LEN + COTP_DT_LEN;
    if bytes.len() < ack_start + S7_ACK_HEADER_LEN + 8 {
        return Err(S7Error::PduTooShort {
            got: bytes.len(),
            need: ack_start + S7_ACK_HEADER_LEN + 8,
        });
    }
    let ack_hdr = S7AckHeader::ref_from_bytes(&bytes[ack_start..ack_start + S7_ACK_HEADER_LEN])
        .map_err(|_| S7Error::MalformedFrame("setup communication ack header".into()))?;
    if ack_hdr.err_class != 0 || ack_hdr.err_code != 0 {
        return Err(S7Error::SetupRejected(format!(
            "err_class=0x{:02x} err_code=0x{:02x}",
            ack_hdr.err_class, ack_hdr.err_code
        )));
    }

    let param_start = ack_start + S7_ACK_HEADER_LEN;
    if bytes[param_start] != FUNC_SETUP_COMM {
        return Err(S7Error::MalformedFrame(format!(
            "expected Setup Communication function 0x{FUNC_SETUP_COMM:02x}, got 0x{:02x}",
            bytes[param_start]
        )));
    }
    let max_amq_caller = u16::from_be_bytes([bytes[param_start + 2], bytes[param_start + 3]]);
    let max_amq_callee = u16::from_be_bytes([bytes[param_start + 4], bytes[param_start + 5]]);
    let pdu_length = u16::from_be_bytes([bytes[param_start + 6], bytes[param_start + 7]]);

    Ok(SetupCommResult {
        max_amq_caller,
        max_amq_callee,
        pdu_length,
    })
}

/// Reads the TPKT length field of a frame header, so a reassembly loop
/// knows how many more bytes to read before a full frame is available.
pub fn peek_tpkt_length(buf: &[u8]) -> Option<u16> {
    let hdr = TpktHeader::ref_from_bytes(buf.get(..TPKT_LEN)?).ok()?;
    Some(hdr.length.get())
}

/// Builds the ISO-on-TCP COTP Connection Request telegram.
///
/// `src_tsap`/`dst_tsap` are the two-byte Transport Service Access Point
/// identifiers; for a PG/OP connection `dst_tsap` is conventionally
/// `[0x01, rack << 5 | slot]` after the `0x01` connection-type prefix used
/// by `rack_slot_tsap`.
pub fn build_cotp_connection_request(src_tsap: [u8; 2], dst_tsap: [u8; 2]) -> Vec<u8> {
    vec![
        0x03,
        0x00,
        0x00,
        0x16,
        0x11, // PDU size length
        0xE0, // CR - connection request
        0x00,
        0x00, // dst reference
        0x00,
        0x01, // src reference
        0x00, // class + options
        0xC0,
        0x01,
        0x0A, // PDU max length proposal
        0xC1,
        0x02,
        src_tsap[0],
        src_tsap[1],
        0xC2,
        0x02,
        dst_tsap[0],
        dst_tsap[1],
    ]
}

/// Conventional PG-connection destination TSAP for the given rack/slot.
pub fn rack_slot_tsap(rack: u8, slot: u8) -> [u8; 2] {
    [0x01, (rack << 5) | (slot & 0x1F)]
}

/// Checks whether a COTP Connection Confirm (`0xD0`) was received.
pub fn is_cotp_connection_confirm(bytes: &[u8]) -> bool {
    bytes.len() > TPKT_LEN + 1 && bytes[TPKT_LEN + 1] == 0xD0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::location::Location;

    fn item(addr: &str) -> ReadItem {
        item_typed(addr, DataType::Word)
    }

    fn item_typed(addr: &str, data_type: DataType) -> ReadItem {
        ReadItem {
            location: Location::parse(addr).unwrap(),
            data_type,
        }
    }

    #[test]
    fn read_var_request_well_formed() {
        let items = vec![item("DB1.DBW0")];
        let bytes = build_read_var_request(1, &items).unwrap();
        assert_eq!(bytes[0], 0x03);
        let tpkt_len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        assert_eq!(tpkt_len, bytes.len());
        assert_eq!(bytes[17], FUNC_READ_VAR);
        assert_eq!(bytes[18], items.len() as u8);
        assert!(bytes.len() >= 19 + 12 * items.len());
    }

    #[test]
    fn write_var_request_has_nonzero_data_len() {
        let items = vec![WriteItem {
            location: Location::parse("DB1.DBW0").unwrap(),
            data_type: DataType::Word,
            data: vec![0x12, 0x34],
        }];
        let bytes = build_write_var_request(1, &items).unwrap();
        let data_len = u16::from_be_bytes([bytes[15], bytes[16]]);
        assert!(data_len > 0);
        // function byte + item count + 12-byte item spec, then data section
        let item_spec_end = 19 + 12;
        assert_eq!(
            &bytes[item_spec_end..item_spec_end + 6],
            &[0xFF, 0x04, 0x00, 0x10, 0x12, 0x34][..]
        );
    }

    #[test]
    fn read_var_request_uses_octet_string_transport_for_strings() {
        let items = vec![item_typed("DB1.DBB0", DataType::s7_string(254))];
        let bytes = build_read_var_request(1, &items).unwrap();
        let item_spec_start = 19;
        // transport size byte
        assert_eq!(bytes[item_spec_start + 3], TransportSize::OctetString.wire_code());
        let length_field = u16::from_be_bytes([bytes[item_spec_start + 4], bytes[item_spec_start + 5]]);
        assert_eq!(length_field, DataType::s7_string(254).byte_len() as u16);
    }

    #[test]
    fn write_var_request_uses_octet_string_transport_for_bytes() {
        let data = vec![0xAA; 10];
        let items = vec![WriteItem {
            location: Location::byte(crate::protocol::area::Area::DataBlock, 1, 0, 80),
            data_type: DataType::Bytes { len: 10 },
            data: data.clone(),
        }];
        let bytes = build_write_var_request(1, &items).unwrap();
        let item_spec_start = 19;
        assert_eq!(bytes[item_spec_start + 3], TransportSize::OctetString.wire_code());
        let data_section_start = item_spec_start + 12;
        assert_eq!(bytes[data_section_start + 1], TransportSize::OctetString.wire_code());
        let length_field =
            u16::from_be_bytes([bytes[data_section_start + 2], bytes[data_section_start + 3]]);
        assert_eq!(length_field, data.len() as u16);
    }

    #[test]
    fn item_cap_rejected() {
        let items: Vec<ReadItem> = (0..256).map(|_| item("DB1.DBB0")).collect();
        assert!(matches!(
            build_read_var_request(1, &items),
            Err(S7Error::TooManyItems(256))
        ));
    }

    #[test]
    fn odd_payload_padding_is_skipped_between_items_only() {
        // Synthesize a minimal ack + two BYTE items: AA, pad, BB.
        let ack_start = TPKT_LEN + COTP_DT_LEN;
        let param_start = ack_start + S7_ACK_HEADER_LEN;
        let mut bytes = vec![0u8; param_start];
        bytes[ack_start + 1] = PDU_TYPE_ACK_DATA;
        bytes.push(FUNC_READ_VAR);
        bytes.push(2);
        // item0: BYTE, return ok, length=8 bits, payload 0xAA, pad 0x00
        bytes.extend_from_slice(&[ITEM_RETURN_OK, 0x04, 0x00, 0x08, 0xAA, 0x00]);
        // item1: BYTE, return ok, length=8 bits, payload 0xBB, no pad (last item)
        bytes.extend_from_slice(&[ITEM_RETURN_OK, 0x04, 0x00, 0x08, 0xBB]);

        let results = parse_read_var_response(&bytes, 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].payload, vec![0xAA]);
        assert_eq!(results[1].payload, vec![0xBB]);
    }

    #[test]
    fn write_response_returns_n_codes() {
        let ack_start = TPKT_LEN + COTP_DT_LEN;
        let mut bytes = vec![0u8; ack_start + S7_ACK_HEADER_LEN];
        bytes[ack_start + 1] = PDU_TYPE_ACK_DATA;
        bytes.push(FUNC_WRITE_VAR);
        bytes.push(3);
        bytes.extend_from_slice(&[0xFF, 0x0A, 0xFF]);
        let codes = parse_write_var_response(&bytes, 3);
        assert_eq!(codes, vec![0xFF, 0x0A, 0xFF]);
    }

    #[test]
    fn setup_communication_round_trip() {
        let req = build_setup_communication_request(1, 1, 1, 960);
        assert_eq!(req.len(), 25);
        assert_eq!(req[17], FUNC_SETUP_COMM);
    }

}
