//! Backup sessions
//!
//! The engine consumes backups through two traits: a [`SessionManager`]
//! that opens sessions from locator strings, and a [`BackupSession`] that
//! answers recovery-data requests. Transport details live behind the
//! traits; the in-process implementations here serve tests and single-node
//! wiring.

use crate::log::{EntryType, MemoryReplicator, ObjectRecord, SegmentIterator, TombstoneRecord};
use crate::{EmberError, Result, Tablet};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// One open session to a backup server.
pub trait BackupSession: Send + Sync {
    /// Fetch the image of one of `master_id`'s segments, filtered to the
    /// records covered by `tablets`.
    fn get_recovery_data(
        &self,
        master_id: u64,
        segment_id: u64,
        tablets: &[Tablet],
    ) -> Result<Bytes>;
}

/// Opens sessions to backups addressed by locator strings.
pub trait SessionManager: Send + Sync {
    /// Open (or reuse) a session.
    fn open_session(&self, locator: &str) -> Result<Arc<dyn BackupSession>>;
}

/// Filter a segment image down to the records covered by `tablets`.
///
/// Segment header and footer are regenerated; record order is preserved.
pub fn filter_image(image: &[u8], tablets: &[Tablet]) -> Result<Bytes> {
    let mut iter = SegmentIterator::new(image)?;
    let mut buf = BytesMut::with_capacity(image.len());
    buf.put_u8(EntryType::SegmentHeader as u8);
    buf.put_u32_le(8);
    buf.put_u64_le(iter.segment_id());

    while let Some((entry_type, payload)) = iter.next() {
        let keep = match entry_type {
            EntryType::Object => {
                let record = ObjectRecord::decode(payload)?;
                tablets
                    .iter()
                    .any(|t| t.contains(record.table_id, record.object_id))
            }
            EntryType::ObjectTombstone => {
                let record = TombstoneRecord::decode(payload)?;
                tablets
                    .iter()
                    .any(|t| t.contains(record.table_id, record.object_id))
            }
            EntryType::SegmentHeader | EntryType::SegmentFooter => false,
        };
        if keep {
            buf.put_u8(entry_type as u8);
            buf.put_u32_le(payload.len() as u32);
            buf.put_slice(payload);
        }
    }

    let checksum = crc32fast::hash(&buf);
    buf.put_u8(EntryType::SegmentFooter as u8);
    buf.put_u32_le(4);
    buf.put_u32_le(checksum);
    Ok(buf.freeze())
}

/// In-process backup backed by a [`MemoryReplicator`]'s segment store.
pub struct MemoryBackup {
    store: Arc<MemoryReplicator>,
}

impl MemoryBackup {
    /// Create a backup serving the given segment store.
    pub fn new(store: Arc<MemoryReplicator>) -> Self {
        Self { store }
    }
}

impl BackupSession for MemoryBackup {
    fn get_recovery_data(
        &self,
        _master_id: u64,
        segment_id: u64,
        tablets: &[Tablet],
    ) -> Result<Bytes> {
        let image = self
            .store
            .image(segment_id)
            .ok_or_else(|| EmberError::Transport(format!("segment {} not stored", segment_id)))?;
        filter_image(&image, tablets)
    }
}

/// Session manager over a fixed locator-to-session map.
#[derive(Default)]
pub struct StaticSessionManager {
    sessions: RwLock<HashMap<String, Arc<dyn BackupSession>>>,
}

impl StaticSessionManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under a locator.
    pub fn insert(&self, locator: &str, session: Arc<dyn BackupSession>) {
        self.sessions.write().insert(locator.to_string(), session);
    }
}

impl SessionManager for StaticSessionManager {
    fn open_session(&self, locator: &str) -> Result<Arc<dyn BackupSession>> {
        self.sessions
            .read()
            .get(locator)
            .cloned()
            .ok_or_else(|| EmberError::Transport(format!("no route to {}", locator)))
    }
}
