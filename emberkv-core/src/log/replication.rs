//! Segment replication to backups
//!
//! The log pushes whole segment images; an implementation must not return
//! until the image is durable at the configured replica count. Transient
//! backup failures are the implementation's to retry; an error from
//! [`SegmentReplicator::replicate`] is unrecoverable and fatal to the log.

use crate::Result;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Destination for segment images.
pub trait SegmentReplicator: Send + Sync {
    /// Replicate one segment image, blocking until acknowledged.
    ///
    /// Re-replicating a segment id replaces the previous image.
    fn replicate(&self, segment_id: u64, image: Bytes) -> Result<()>;
}

/// Replicator for single-node operation and benchmarks: drops every image.
pub struct NullReplicator;

impl SegmentReplicator for NullReplicator {
    fn replicate(&self, _segment_id: u64, _image: Bytes) -> Result<()> {
        Ok(())
    }
}

/// In-process replicator that retains the latest image per segment.
///
/// Stands in for a backup cluster when master and backups share a process,
/// and backs the recovery tests.
#[derive(Default)]
pub struct MemoryReplicator {
    segments: Mutex<HashMap<u64, Bytes>>,
}

impl MemoryReplicator {
    /// Create an empty replicator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest replicated image for a segment.
    pub fn image(&self, segment_id: u64) -> Option<Bytes> {
        self.segments.lock().get(&segment_id).cloned()
    }

    /// Ids of all replicated segments.
    pub fn segment_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.segments.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl SegmentReplicator for MemoryReplicator {
    fn replicate(&self, segment_id: u64, image: Bytes) -> Result<()> {
        self.segments.lock().insert(segment_id, image);
        Ok(())
    }
}
