//! Log record types and serialization
//!
//! Record layouts are little-endian and packed. The object checksum field
//! is reserved at 64 bits and currently carries a constant sentinel.

use crate::{EmberError, ObjectId, Result, TableId};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Placeholder written into the 64-bit object checksum field.
pub const CHECKSUM_SENTINEL: u64 = 0x0BE7_0BE7_0BE7_0BE7;

/// Type tag of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryType {
    /// A live object record
    Object = 1,
    /// A tombstone superseding a deleted object
    ObjectTombstone = 2,
    /// Segment image header
    SegmentHeader = 3,
    /// Segment image footer with checksum
    SegmentFooter = 4,
}

impl TryFrom<u8> for EntryType {
    type Error = EmberError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(EntryType::Object),
            2 => Ok(EntryType::ObjectTombstone),
            3 => Ok(EntryType::SegmentHeader),
            4 => Ok(EntryType::SegmentFooter),
            _ => Err(EmberError::Corruption(format!(
                "unknown log entry type: {}",
                value
            ))),
        }
    }
}

/// An object record as stored in the log.
///
/// Layout: `u64 table_id | u64 object_id | u64 version | u64 checksum |
/// u32 data_len | bytes[data_len]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRecord {
    pub table_id: TableId,
    pub object_id: ObjectId,
    pub version: u64,
    pub checksum: u64,
    pub data: Bytes,
}

/// Fixed size of the object record header preceding the data bytes.
pub const OBJECT_HEADER_LEN: usize = 8 * 4 + 4;

impl ObjectRecord {
    /// Build a record for new data at a given version.
    pub fn new(table_id: TableId, object_id: ObjectId, version: u64, data: Bytes) -> Self {
        Self {
            table_id,
            object_id,
            version,
            checksum: CHECKSUM_SENTINEL,
            data,
        }
    }

    /// Serialized size of the record.
    pub fn serialized_len(&self) -> usize {
        OBJECT_HEADER_LEN + self.data.len()
    }

    /// Serialize the record.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        buf.put_u64_le(self.table_id);
        buf.put_u64_le(self.object_id);
        buf.put_u64_le(self.version);
        buf.put_u64_le(self.checksum);
        buf.put_u32_le(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Deserialize a record, verifying the self-described length.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < OBJECT_HEADER_LEN {
            return Err(EmberError::Corruption("object record too short".into()));
        }
        let mut cursor = data;
        let table_id = cursor.get_u64_le();
        let object_id = cursor.get_u64_le();
        let version = cursor.get_u64_le();
        let checksum = cursor.get_u64_le();
        let data_len = cursor.get_u32_le() as usize;
        if cursor.remaining() < data_len {
            return Err(EmberError::Corruption(format!(
                "object record truncated: {} data bytes, {} expected",
                cursor.remaining(),
                data_len
            )));
        }
        Ok(Self {
            table_id,
            object_id,
            version,
            checksum,
            data: Bytes::copy_from_slice(&cursor[..data_len]),
        })
    }
}

/// A tombstone record marking the deletion of one object version.
///
/// Layout: `u64 table_id | u64 object_id | u64 object_version |
/// u64 segment_id`, where `segment_id` is the segment that held the object
/// this tombstone supersedes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TombstoneRecord {
    pub table_id: TableId,
    pub object_id: ObjectId,
    pub object_version: u64,
    pub segment_id: u64,
}

/// Fixed serialized size of a tombstone record.
pub const TOMBSTONE_LEN: usize = 8 * 4;

impl TombstoneRecord {
    /// Serialize the record.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(TOMBSTONE_LEN);
        buf.put_u64_le(self.table_id);
        buf.put_u64_le(self.object_id);
        buf.put_u64_le(self.object_version);
        buf.put_u64_le(self.segment_id);
        buf.freeze()
    }

    /// Deserialize a record.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < TOMBSTONE_LEN {
            return Err(EmberError::Corruption("tombstone record too short".into()));
        }
        let mut cursor = data;
        Ok(Self {
            table_id: cursor.get_u64_le(),
            object_id: cursor.get_u64_le(),
            object_version: cursor.get_u64_le(),
            segment_id: cursor.get_u64_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_roundtrip() {
        let record = ObjectRecord::new(7, 42, 3, Bytes::from_static(b"hello"));
        let encoded = record.encode();
        assert_eq!(encoded.len(), OBJECT_HEADER_LEN + 5);

        let decoded = ObjectRecord::decode(&encoded).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.checksum, CHECKSUM_SENTINEL);
    }

    #[test]
    fn test_object_layout_is_little_endian_packed() {
        let record = ObjectRecord::new(1, 2, 3, Bytes::from_static(b"x"));
        let encoded = record.encode();
        assert_eq!(&encoded[0..8], &1u64.to_le_bytes());
        assert_eq!(&encoded[8..16], &2u64.to_le_bytes());
        assert_eq!(&encoded[16..24], &3u64.to_le_bytes());
        assert_eq!(&encoded[24..32], &CHECKSUM_SENTINEL.to_le_bytes());
        assert_eq!(&encoded[32..36], &1u32.to_le_bytes());
        assert_eq!(&encoded[36..], b"x");
    }

    #[test]
    fn test_object_truncated() {
        let record = ObjectRecord::new(7, 42, 3, Bytes::from_static(b"hello"));
        let encoded = record.encode();
        let err = ObjectRecord::decode(&encoded[..encoded.len() - 1]).unwrap_err();
        assert!(err.is_corruption());
        assert!(ObjectRecord::decode(&encoded[..10]).is_err());
    }

    #[test]
    fn test_tombstone_roundtrip() {
        let tomb = TombstoneRecord {
            table_id: 7,
            object_id: 42,
            object_version: 9,
            segment_id: 4,
        };
        let encoded = tomb.encode();
        assert_eq!(encoded.len(), TOMBSTONE_LEN);
        assert_eq!(TombstoneRecord::decode(&encoded).unwrap(), tomb);
        assert_eq!(&encoded[24..32], &4u64.to_le_bytes());
    }

    #[test]
    fn test_entry_type_tags() {
        for ty in [
            EntryType::Object,
            EntryType::ObjectTombstone,
            EntryType::SegmentHeader,
            EntryType::SegmentFooter,
        ] {
            assert_eq!(EntryType::try_from(ty as u8).unwrap(), ty);
        }
        assert!(EntryType::try_from(0).is_err());
        assert!(EntryType::try_from(9).is_err());
    }
}
