//! Log segments and segment image parsing
//!
//! A segment is the fixed-size append unit of the log and the unit of
//! replication and cleaning. For replication and recovery a segment is
//! serialized into an *image*: a header record, every appended record in
//! order, and a footer record carrying a CRC32 of all preceding bytes.
//! Each record in an image is framed as `u8 type | u32 len | payload`,
//! little-endian.

use super::entry::EntryType;
use crate::{EmberError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::ops::Range;

/// Bytes of framing per record in a segment image.
pub const FRAME_HEADER_LEN: usize = 1 + 4;

const HEADER_PAYLOAD_LEN: usize = 8;
const FOOTER_PAYLOAD_LEN: usize = 4;

/// Framed size of the segment header record.
pub const HEADER_FRAME_LEN: usize = FRAME_HEADER_LEN + HEADER_PAYLOAD_LEN;
/// Framed size of the segment footer record.
pub const FOOTER_FRAME_LEN: usize = FRAME_HEADER_LEN + FOOTER_PAYLOAD_LEN;

/// One record stored in an in-memory segment.
#[derive(Debug, Clone)]
pub struct SegmentEntry {
    pub entry_type: EntryType,
    pub data: Bytes,
    pub live: bool,
}

/// An in-memory log segment.
///
/// Entries are retained (dead ones included) until the cleaner reclaims
/// the whole segment; replication ships the full image.
pub struct Segment {
    id: u64,
    capacity: usize,
    bytes_used: usize,
    live_bytes: usize,
    sealed: bool,
    entries: Vec<SegmentEntry>,
}

impl Segment {
    /// Create an empty open segment.
    pub fn new(id: u64, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            // Header now, footer reserved for when the image is built.
            bytes_used: HEADER_FRAME_LEN + FOOTER_FRAME_LEN,
            live_bytes: 0,
            sealed: false,
            entries: Vec::new(),
        }
    }

    /// Segment id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the segment no longer accepts appends.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Stop accepting appends.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Whether a payload of `len` bytes fits.
    pub fn fits(&self, len: usize) -> bool {
        !self.sealed && self.bytes_used + FRAME_HEADER_LEN + len <= self.capacity
    }

    /// Append a record, returning its slot.
    pub fn append(&mut self, entry_type: EntryType, data: Bytes) -> u32 {
        debug_assert!(self.fits(data.len()));
        let framed = FRAME_HEADER_LEN + data.len();
        self.bytes_used += framed;
        self.live_bytes += framed;
        self.entries.push(SegmentEntry {
            entry_type,
            data,
            live: true,
        });
        (self.entries.len() - 1) as u32
    }

    /// Mark a slot dead. Idempotent per slot.
    pub fn free(&mut self, slot: u32) {
        if let Some(entry) = self.entries.get_mut(slot as usize) {
            if entry.live {
                entry.live = false;
                self.live_bytes -= FRAME_HEADER_LEN + entry.data.len();
            }
        }
    }

    /// Fetch a slot.
    pub fn get(&self, slot: u32) -> Option<&SegmentEntry> {
        self.entries.get(slot as usize)
    }

    /// Visit the live slots.
    pub fn live_slots(&self) -> impl Iterator<Item = (u32, &SegmentEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.live)
            .map(|(i, e)| (i as u32, e))
    }

    /// Bytes consumed by live records (framing included).
    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    /// Bytes consumed by all records plus header/footer framing.
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Fraction of the used bytes that is still live.
    pub fn live_ratio(&self) -> f64 {
        let payload = self.bytes_used - HEADER_FRAME_LEN - FOOTER_FRAME_LEN;
        if payload == 0 {
            0.0
        } else {
            self.live_bytes as f64 / payload as f64
        }
    }

    /// Serialize the segment into an image for replication.
    pub fn image(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.bytes_used);
        buf.put_u8(EntryType::SegmentHeader as u8);
        buf.put_u32_le(HEADER_PAYLOAD_LEN as u32);
        buf.put_u64_le(self.id);
        for entry in &self.entries {
            buf.put_u8(entry.entry_type as u8);
            buf.put_u32_le(entry.data.len() as u32);
            buf.put_slice(&entry.data);
        }
        let checksum = crc32fast::hash(&buf);
        buf.put_u8(EntryType::SegmentFooter as u8);
        buf.put_u32_le(FOOTER_PAYLOAD_LEN as u32);
        buf.put_u32_le(checksum);
        buf.freeze()
    }
}

/// Validating cursor over a serialized segment image.
///
/// Construction walks the whole image once: framing, record type tags and
/// the footer checksum are verified up front, so iteration is infallible.
#[derive(Debug)]
pub struct SegmentIterator<'a> {
    image: &'a [u8],
    segment_id: u64,
    records: Vec<(EntryType, Range<usize>)>,
    next: usize,
}

impl<'a> SegmentIterator<'a> {
    /// Validate an image and position a cursor at its first record.
    pub fn new(image: &'a [u8]) -> Result<Self> {
        let mut pos = 0usize;
        let mut records = Vec::new();
        let mut segment_id = None;
        let mut footer_seen = false;

        while pos < image.len() {
            if footer_seen {
                return Err(EmberError::Corruption(
                    "segment image has data after the footer".into(),
                ));
            }
            if image.len() - pos < FRAME_HEADER_LEN {
                return Err(EmberError::Corruption(
                    "segment image ends inside a record frame".into(),
                ));
            }
            let entry_type = EntryType::try_from(image[pos])?;
            let len = (&image[pos + 1..pos + 5]).get_u32_le() as usize;
            let start = pos + FRAME_HEADER_LEN;
            if image.len() - start < len {
                return Err(EmberError::Corruption(
                    "segment image ends inside a record payload".into(),
                ));
            }
            let payload = start..start + len;

            match entry_type {
                EntryType::SegmentHeader => {
                    if pos != 0 || len != HEADER_PAYLOAD_LEN {
                        return Err(EmberError::Corruption(
                            "malformed segment header record".into(),
                        ));
                    }
                    segment_id = Some((&image[payload.clone()]).get_u64_le());
                }
                EntryType::SegmentFooter => {
                    if len != FOOTER_PAYLOAD_LEN {
                        return Err(EmberError::Corruption(
                            "malformed segment footer record".into(),
                        ));
                    }
                    let expected = (&image[payload.clone()]).get_u32_le();
                    let actual = crc32fast::hash(&image[..pos]);
                    if expected != actual {
                        return Err(EmberError::ChecksumMismatch { expected, actual });
                    }
                    footer_seen = true;
                }
                _ => {}
            }
            records.push((entry_type, payload.clone()));
            pos = payload.end;
        }

        let segment_id = segment_id
            .ok_or_else(|| EmberError::Corruption("segment image missing header".into()))?;
        if !footer_seen {
            return Err(EmberError::Corruption("segment image missing footer".into()));
        }

        Ok(Self {
            image,
            segment_id,
            records,
            next: 0,
        })
    }

    /// Segment id declared by the image header.
    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    /// Advance and return the next record, or `None` at the end.
    pub fn next(&mut self) -> Option<(EntryType, &'a [u8])> {
        let (entry_type, range) = self.records.get(self.next)?;
        self.next += 1;
        Some((*entry_type, &self.image[range.clone()]))
    }

    /// Whether the cursor is past the last record.
    pub fn is_done(&self) -> bool {
        self.next >= self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_segment() -> Segment {
        let mut segment = Segment::new(9, 4096);
        segment.append(EntryType::Object, Bytes::from_static(b"first"));
        segment.append(EntryType::ObjectTombstone, Bytes::from_static(b"second!!"));
        segment
    }

    #[test]
    fn test_image_roundtrip() {
        let segment = sample_segment();
        let image = segment.image();

        let mut iter = SegmentIterator::new(&image).unwrap();
        assert_eq!(iter.segment_id(), 9);

        let (ty, payload) = iter.next().unwrap();
        assert_eq!(ty, EntryType::SegmentHeader);
        assert_eq!(payload.len(), 8);

        let (ty, payload) = iter.next().unwrap();
        assert_eq!(ty, EntryType::Object);
        assert_eq!(payload, b"first");

        let (ty, payload) = iter.next().unwrap();
        assert_eq!(ty, EntryType::ObjectTombstone);
        assert_eq!(payload, b"second!!");

        let (ty, _) = iter.next().unwrap();
        assert_eq!(ty, EntryType::SegmentFooter);
        assert!(iter.is_done());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_dead_entries_still_replicated() {
        let mut segment = sample_segment();
        segment.free(0);
        let image = segment.image();
        let mut iter = SegmentIterator::new(&image).unwrap();
        let mut objects = 0;
        while let Some((ty, _)) = iter.next() {
            if ty == EntryType::Object {
                objects += 1;
            }
        }
        assert_eq!(objects, 1);
    }

    #[test]
    fn test_corrupt_image_fails_checksum() {
        let image = sample_segment().image();
        let mut corrupt = image.to_vec();
        let flip = HEADER_FRAME_LEN + FRAME_HEADER_LEN + 1;
        corrupt[flip] ^= 0xFF;
        let err = SegmentIterator::new(&corrupt).unwrap_err();
        assert!(matches!(err, EmberError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_truncated_image() {
        let image = sample_segment().image();
        let err = SegmentIterator::new(&image[..image.len() - 3]).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_free_is_idempotent() {
        let mut segment = sample_segment();
        let live_before = segment.live_bytes();
        segment.free(0);
        let live_after = segment.live_bytes();
        assert!(live_after < live_before);
        segment.free(0);
        assert_eq!(segment.live_bytes(), live_after);
    }

    #[test]
    fn test_fits_accounts_for_framing() {
        let mut segment = Segment::new(1, HEADER_FRAME_LEN + FOOTER_FRAME_LEN + 20);
        assert!(segment.fits(15));
        assert!(!segment.fits(16));
        segment.seal();
        assert!(!segment.fits(1));
    }
}
