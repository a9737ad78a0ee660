//! Append-only segmented log
//!
//! Mutations append typed records into the open segment; full segments are
//! sealed and replicated to backups. Records stay addressable through
//! [`EntryRef`] handles until the cleaner reclaims their segment, at which
//! point the eviction callback registered for the record type decides
//! whether each surviving record is re-appended.

mod cleaner;
mod entry;
mod replication;
mod segment;

pub use entry::{
    EntryType, ObjectRecord, TombstoneRecord, CHECKSUM_SENTINEL, OBJECT_HEADER_LEN, TOMBSTONE_LEN,
};
pub use replication::{MemoryReplicator, NullReplicator, SegmentReplicator};
pub use segment::{Segment, SegmentIterator, FOOTER_FRAME_LEN, FRAME_HEADER_LEN, HEADER_FRAME_LEN};

use crate::config;
use crate::{EmberError, Result};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Log configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Byte capacity of one segment
    pub segment_size: usize,
    /// Sealed segments at or below this live ratio are cleaner candidates
    pub cleaner_live_ratio: f64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            segment_size: config::SEGMENT_SIZE,
            cleaner_live_ratio: config::CLEANER_LIVE_RATIO,
        }
    }
}

/// Stable, non-owning handle to a log record.
///
/// Valid until the cleaner reclaims the segment; the eviction callbacks
/// republish relocated records under fresh handles. Handle equality stands
/// in for pointer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryRef {
    /// Segment holding the record
    pub segment_id: u64,
    /// Slot of the record within the segment
    pub slot: u32,
}

/// Relocation handler invoked by the cleaner for each surviving record of
/// a registered type, before the record's segment is freed.
pub trait EvictionCallback: Send + Sync {
    /// Decide the fate of one record about to be discarded.
    fn evict(&self, payload: &[u8], evicted: EntryRef);
}

/// The append-only log.
pub struct Log {
    config: LogConfig,
    inner: Mutex<LogInner>,
    callbacks: RwLock<HashMap<EntryType, Arc<dyn EvictionCallback>>>,
    replicator: Arc<dyn SegmentReplicator>,
    bytes_appended: AtomicU64,
}

struct LogInner {
    segments: BTreeMap<u64, Segment>,
    open_id: u64,
    next_id: u64,
    /// Segments with appends not yet replicated
    dirty: BTreeSet<u64>,
}

impl Log {
    /// Create a log with a single open segment.
    pub fn new(config: LogConfig, replicator: Arc<dyn SegmentReplicator>) -> Self {
        let mut segments = BTreeMap::new();
        segments.insert(1, Segment::new(1, config.segment_size));
        Self {
            config,
            inner: Mutex::new(LogInner {
                segments,
                open_id: 1,
                next_id: 2,
                dirty: BTreeSet::new(),
            }),
            callbacks: RwLock::new(HashMap::new()),
            replicator,
            bytes_appended: AtomicU64::new(0),
        }
    }

    /// Register the eviction callback for a record type.
    pub fn register_type(&self, entry_type: EntryType, callback: Arc<dyn EvictionCallback>) {
        self.callbacks.write().insert(entry_type, callback);
    }

    /// Append a record, rotating to a new segment when the open one is full.
    ///
    /// With `durable`, a segment sealed by this append is replicated before
    /// the call returns; without it, replication is deferred to the next
    /// [`Log::sync`] (used by recovery replay).
    pub fn append(&self, entry_type: EntryType, payload: Bytes, durable: bool) -> Result<EntryRef> {
        let framed = FRAME_HEADER_LEN + payload.len();
        if HEADER_FRAME_LEN + FOOTER_FRAME_LEN + framed > self.config.segment_size {
            return Err(EmberError::EntryTooLarge {
                size: payload.len(),
                capacity: self.config.segment_size,
            });
        }

        let mut inner = self.inner.lock();
        let mut sealed = None;
        if !inner.segments[&inner.open_id].fits(payload.len()) {
            let open_id = inner.open_id;
            let segment = inner.segments.get_mut(&open_id).expect("open segment");
            segment.seal();
            if durable {
                sealed = Some((open_id, segment.image()));
            }
            let new_id = inner.next_id;
            inner.next_id += 1;
            inner
                .segments
                .insert(new_id, Segment::new(new_id, self.config.segment_size));
            inner.open_id = new_id;
            debug!("rotated log to segment {}", new_id);
        }

        let open_id = inner.open_id;
        let slot = inner
            .segments
            .get_mut(&open_id)
            .expect("open segment")
            .append(entry_type, payload);
        inner.dirty.insert(open_id);
        self.bytes_appended.fetch_add(framed as u64, Ordering::Relaxed);

        if let Some((id, image)) = sealed {
            self.replicator.replicate(id, image)?;
            inner.dirty.remove(&id);
        }

        Ok(EntryRef {
            segment_id: open_id,
            slot,
        })
    }

    /// Mark a record dead. Idempotent per record.
    ///
    /// Must precede any append that could supersede the record, so the
    /// cleaner never relocates an entry that is already logically dead.
    pub fn free(&self, entry: EntryRef) {
        let mut inner = self.inner.lock();
        match inner.segments.get_mut(&entry.segment_id) {
            Some(segment) => segment.free(entry.slot),
            None => debug!(
                "free of {:?} ignored: segment already reclaimed",
                entry
            ),
        }
    }

    /// Fetch a record's type and payload.
    pub fn entry(&self, entry: EntryRef) -> Option<(EntryType, Bytes)> {
        let inner = self.inner.lock();
        inner
            .segments
            .get(&entry.segment_id)?
            .get(entry.slot)
            .map(|e| (e.entry_type, e.data.clone()))
    }

    /// Whether a segment still exists in the log (not yet reclaimed).
    pub fn is_segment_live(&self, segment_id: u64) -> bool {
        self.inner.lock().segments.contains_key(&segment_id)
    }

    /// Replicate every segment with unreplicated appends and block until
    /// all images are acknowledged.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let dirty: Vec<u64> = inner.dirty.iter().copied().collect();
        for id in dirty {
            let image = inner.segments[&id].image();
            self.replicator.replicate(id, image)?;
            inner.dirty.remove(&id);
        }
        Ok(())
    }

    /// Total bytes appended over the log's lifetime (framing included).
    pub fn bytes_appended(&self) -> u64 {
        self.bytes_appended.load(Ordering::Relaxed)
    }

    /// Number of segments not yet reclaimed.
    pub fn segment_count(&self) -> usize {
        self.inner.lock().segments.len()
    }
}
