//! Segment cleaning
//!
//! The cleaner reclaims sealed segments whose live ratio has dropped below
//! the configured threshold. Every record still live in a reclaimed segment
//! is offered to the eviction callback registered for its type; the
//! callback re-appends what must survive. The segment is freed only after
//! all its callbacks have returned.

use super::{EntryRef, EntryType, Log};
use bytes::Bytes;
use tracing::debug;

impl Log {
    /// One cleaner pass over all reclaimable segments.
    ///
    /// Returns the number of segments reclaimed.
    pub fn clean(&self) -> usize {
        let candidates: Vec<u64> = {
            let inner = self.inner.lock();
            inner
                .segments
                .values()
                .filter(|s| s.is_sealed() && s.live_ratio() <= self.config.cleaner_live_ratio)
                .map(|s| s.id())
                .collect()
        };
        let mut reclaimed = 0;
        for segment_id in candidates {
            if self.clean_segment(segment_id) {
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Reclaim one sealed segment, relocating its survivors.
    ///
    /// Returns false if the segment is open or already gone.
    pub fn clean_segment(&self, segment_id: u64) -> bool {
        let survivors: Vec<(EntryType, Bytes, EntryRef)> = {
            let inner = self.inner.lock();
            match inner.segments.get(&segment_id) {
                Some(segment) if segment.is_sealed() => segment
                    .live_slots()
                    .map(|(slot, entry)| {
                        (
                            entry.entry_type,
                            entry.data.clone(),
                            EntryRef { segment_id, slot },
                        )
                    })
                    .collect(),
                _ => return false,
            }
        };

        // Callbacks append and touch the index; the segment lock is not
        // held across them.
        for (entry_type, payload, evicted) in survivors {
            let callback = self.callbacks.read().get(&entry_type).cloned();
            if let Some(callback) = callback {
                callback.evict(&payload, evicted);
            }
        }

        let mut inner = self.inner.lock();
        inner.segments.remove(&segment_id);
        inner.dirty.remove(&segment_id);
        debug!("reclaimed segment {}", segment_id);
        true
    }
}
