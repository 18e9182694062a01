// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Batching planner: groups tags into ReadVar/WriteVar batches that stay
//! within the 255-item protocol cap and the negotiated PDU size.
//!
//! Byte-budget estimation follows the same request/response overhead
//! numbers `protocol::frame` actually encodes/decodes, so a batch the
//! planner approves never bounces off the wire as `TooManyItems` or a
//! PDU-too-short condition.

use crate::{
    protocol::{location::Location, value::DataType},
    registry::Tag,
};

/// Fixed overhead of a ReadVar/WriteVar request PDU before any item specs
/// are appended: TPKT(4) + COTP(3) + Job header(10) + parameter header(2).
const REQUEST_OVERHEAD: usize = 19;
/// Per-item request overhead: the 12-byte item spec.
const REQUEST_ITEM_BYTES: usize = 12;

/// Fixed overhead of a ReadVar response PDU before any item payloads:
/// TPKT(4) + COTP(3) + Ack header(12) + item count byte(1) + padding(1).
const READ_RESPONSE_OVERHEAD: usize = 21;
/// Per-item read response header: return code(1) + transport size(1) +
/// length(2).
const READ_ITEM_HEADER_BYTES: usize = 4;

/// Fixed overhead of a WriteVar response PDU: TPKT(4) + COTP(3) +
/// Ack header(12) + parameter byte(1) + padding(1).
const WRITE_RESPONSE_OVERHEAD: usize = 21;
/// Per-item write response: a single return-code byte.
const WRITE_ITEM_HEADER_BYTES: usize = 1;

fn padded_len(payload_bytes: usize) -> usize {
    payload_bytes.div_ceil(2) * 2
}

/// One item queued for a read batch. Ordinarily `split_index == 0` and
/// `split_total == 1`, and `location` is just `tag.location`. When the
/// tag's own payload is too wide for a single item, it is split into
/// several `PlannedRead`s sharing the same `name`, each `location` a
/// byte range of the original tag, numbered `split_index` of
/// `split_total`; the scheduler stitches their payloads back together
/// with `stitch_split_reads` before decoding.
#[derive(Debug, Clone)]
pub struct PlannedRead {
    pub name: std::sync::Arc<str>,
    pub tag: Tag,
    pub location: Location,
    pub split_index: u32,
    pub split_total: u32,
}

impl PlannedRead {
    /// The data type the wire item itself should be built with: the
    /// tag's own type for an unsplit read, or a raw byte chunk sized to
    /// this item's range for one leg of a split read.
    pub fn item_data_type(&self) -> DataType {
        if self.split_total <= 1 {
            self.tag.data_type.clone()
        } else {
            DataType::Bytes { len: self.location.width_bytes() }
        }
    }
}

/// One item queued for a write batch.
#[derive(Debug, Clone)]
pub struct PlannedWrite {
    pub name: std::sync::Arc<str>,
    pub tag: Tag,
    pub encoded: Vec<u8>,
}

/// A batch of reads or writes sized to fit one PDU.
#[derive(Debug, Clone, Default)]
pub struct ReadBatch {
    pub items: Vec<PlannedRead>,
}

#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub items: Vec<PlannedWrite>,
}

/// Splits a single large tag into sequential byte-range reads, each no
/// wider than `max_item_bytes`. Used when one tag's own width would blow
/// the PDU budget on its own (e.g. a large `DataType::Bytes`/`Array`).
pub fn split_large_read(tag: &Tag, max_item_bytes: u32) -> Vec<(u32, u32)> {
    let total = tag.data_type.byte_len();
    if total <= max_item_bytes {
        return vec![(tag.location.start_byte, total)];
    }
    let mut ranges = Vec::new();
    let mut offset = 0u32;
    while offset < total {
        let chunk = (total - offset).min(max_item_bytes);
        ranges.push((tag.location.start_byte + offset, chunk));
        offset += chunk;
    }
    ranges
}

/// The widest a single read item's payload may be while still leaving
/// room for the rest of the read-response envelope within one PDU.
fn max_split_chunk_bytes(pdu_size: u16) -> u32 {
    let reserved = READ_RESPONSE_OVERHEAD as u32 + READ_ITEM_HEADER_BYTES as u32 + 1;
    (pdu_size as u32).saturating_sub(reserved).max(1)
}

/// Expands `tags` into individual read items, splitting any tag whose own
/// payload would blow the PDU budget (per `needs_split`) into sequential
/// byte-range `PlannedRead`s via `split_large_read`.
fn expand_reads(tags: &[Tag], pdu_size: u16) -> Vec<PlannedRead> {
    let mut planned = Vec::new();
    for tag in tags {
        if needs_split(&tag.data_type, pdu_size) {
            let max_chunk = max_split_chunk_bytes(pdu_size);
            let ranges = split_large_read(tag, max_chunk);
            let split_total = ranges.len() as u32;
            for (idx, (start, len)) in ranges.into_iter().enumerate() {
                planned.push(PlannedRead {
                    name: tag.name.clone(),
                    tag: tag.clone(),
                    location: Location::byte(tag.location.area, tag.location.db_number, start, len * 8),
                    split_index: idx as u32,
                    split_total,
                });
            }
        } else {
            planned.push(PlannedRead {
                name: tag.name.clone(),
                tag: tag.clone(),
                location: tag.location,
                split_index: 0,
                split_total: 1,
            });
        }
    }
    planned
}

/// Greedily fills read batches: each item is appended to the current
/// batch if doing so keeps both the request and the anticipated response
/// under `pdu_size`, and the item count under 255; otherwise a new batch
/// starts. A tag too wide to fit one item at all is expanded into several
/// items first (see `expand_reads`), which may themselves land in
/// different batches — `stitch_split_reads` reassembles them afterward.
pub fn plan_reads(tags: &[Tag], pdu_size: u16) -> Vec<ReadBatch> {
    let items = expand_reads(tags, pdu_size);
    let pdu_size = pdu_size as usize;
    let mut batches = Vec::new();
    let mut current = ReadBatch::default();
    let mut request_len = REQUEST_OVERHEAD;
    let mut response_len = READ_RESPONSE_OVERHEAD;

    for item in items {
        let item_width = item.location.width_bytes() as usize;
        let item_request = REQUEST_ITEM_BYTES;
        let item_response = READ_ITEM_HEADER_BYTES + padded_len(item_width);

        let would_overflow_count = current.items.len() + 1 > 255;
        let would_overflow_request = request_len + item_request > pdu_size;
        let would_overflow_response = response_len + item_response > pdu_size;

        if !current.items.is_empty()
            && (would_overflow_count || would_overflow_request || would_overflow_response)
        {
            batches.push(std::mem::take(&mut current));
            request_len = REQUEST_OVERHEAD;
            response_len = READ_RESPONSE_OVERHEAD;
        }

        request_len += item_request;
        response_len += item_response;
        current.items.push(item);
    }

    if !current.items.is_empty() {
        batches.push(current);
    }
    batches
}

/// Greedily fills write batches the same way `plan_reads` does, but the
/// per-item request cost also includes the encoded payload (item spec +
/// data section), and the response cost is a single return-code byte.
pub fn plan_writes(tags: &[(Tag, Vec<u8>)], pdu_size: u16) -> Vec<WriteBatch> {
    let pdu_size = pdu_size as usize;
    let mut batches = Vec::new();
    let mut current = WriteBatch::default();
    let mut request_len = REQUEST_OVERHEAD;
    let mut response_len = WRITE_RESPONSE_OVERHEAD;

    for (tag, encoded) in tags {
        let item_request = REQUEST_ITEM_BYTES + 4 + padded_len(encoded.len());
        let item_response = WRITE_ITEM_HEADER_BYTES;

        let would_overflow_count = current.items.len() + 1 > 255;
        let would_overflow_request = request_len + item_request > pdu_size;
        let would_overflow_response = response_len + item_response > pdu_size;

        if !current.items.is_empty()
            && (would_overflow_count || would_overflow_request || would_overflow_response)
        {
            batches.push(std::mem::take(&mut current));
            request_len = REQUEST_OVERHEAD;
            response_len = WRITE_RESPONSE_OVERHEAD;
        }

        current.items.push(PlannedWrite {
            name: tag.name.clone(),
            tag: tag.clone(),
            encoded: encoded.clone(),
        });
        request_len += item_request;
        response_len += item_response;
    }

    if !current.items.is_empty() {
        batches.push(current);
    }
    batches
}

/// Whether `ty` is wide enough that a single instance might need
/// `split_large_read` against the given PDU size.
pub fn needs_split(ty: &DataType, pdu_size: u16) -> bool {
    let budget = pdu_size as u32;
    ty.byte_len() + READ_RESPONSE_OVERHEAD as u32 + READ_ITEM_HEADER_BYTES as u32 > budget
}

/// Reassembles a split tag's sub-range read payloads — already ordered by
/// `split_index` — into the single contiguous buffer `primitive::decode`
/// expects.
pub fn stitch_split_reads(payloads: Vec<Vec<u8>>) -> Vec<u8> {
    payloads.concat()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::protocol::{area::Area, location::Location};

    fn make_tag(name: &str, byte: u32, ty: DataType) -> Tag {
        Tag {
            name: Arc::from(name),
            location: Location::byte(Area::DataBlock, 1, byte, ty.byte_len() * 8),
            data_type: ty,
            poll_enabled: true,
            last_raw: None,
            last_value: None,
            pending_write: None,
            last_error: None,
        }
    }

    #[test]
    fn small_batch_fits_in_one_pdu() {
        let tags = vec![
            make_tag("a", 0, DataType::Word),
            make_tag("b", 2, DataType::Dword),
        ];
        let batches = plan_reads(&tags, 960);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].items.len(), 2);
    }

    #[test]
    fn item_count_cap_splits_batches() {
        let tags: Vec<Tag> = (0..300)
            .map(|i| make_tag(&format!("t{i}"), i * 2, DataType::Word))
            .collect();
        let batches = plan_reads(&tags, u16::MAX);
        assert!(batches.len() >= 2);
        assert!(batches.iter().all(|b| b.items.len() <= 255));
    }

    #[test]
    fn tight_pdu_size_forces_small_batches() {
        let tags: Vec<Tag> = (0..10)
            .map(|i| make_tag(&format!("t{i}"), i * 2, DataType::Word))
            .collect();
        let batches = plan_reads(&tags, 40);
        assert!(batches.len() > 1);
    }

    #[test]
    fn split_large_read_chunks_big_tag() {
        let tag = make_tag("big", 0, DataType::Bytes { len: 500 });
        let ranges = split_large_read(&tag, 200);
        assert_eq!(ranges, vec![(0, 200), (200, 200), (400, 100)]);
    }

    #[test]
    fn split_large_read_is_noop_when_small() {
        let tag = make_tag("small", 0, DataType::Word);
        assert_eq!(split_large_read(&tag, 200), vec![(0, 2)]);
    }

    #[test]
    fn plan_reads_splits_an_oversized_tag_into_several_items() {
        let tag = make_tag("big", 0, DataType::Bytes { len: 2000 });
        let batches = plan_reads(std::slice::from_ref(&tag), 240);
        let total_items: usize = batches.iter().map(|b| b.items.len()).sum();
        assert!(total_items > 1, "expected the oversized tag to split into multiple items");
        for batch in &batches {
            for item in &batch.items {
                assert_eq!(&*item.name, "big");
                assert_eq!(item.split_total, total_items as u32);
            }
        }
        let total_bytes: u32 = batches
            .iter()
            .flat_map(|b| &b.items)
            .map(|p| p.location.width_bytes())
            .sum();
        assert_eq!(total_bytes, 2000);
    }

    #[test]
    fn plan_reads_leaves_a_small_tag_unsplit() {
        let tag = make_tag("small", 0, DataType::Word);
        let batches = plan_reads(std::slice::from_ref(&tag), 960);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].items.len(), 1);
        assert_eq!(batches[0].items[0].split_total, 1);
        assert_eq!(batches[0].items[0].location, tag.location);
    }

    #[test]
    fn stitch_split_reads_concatenates_in_order() {
        let stitched = stitch_split_reads(vec![vec![0xAA, 0xBB], vec![0xCC], vec![0xDD, 0xEE]]);
        assert_eq!(stitched, vec![0xAA, 0xBB, 0xCC, 0xDD, 0xEE]);
    }
}
