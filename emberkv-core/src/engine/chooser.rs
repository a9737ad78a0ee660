//! Backup selection during recovery
//!
//! From the coordinator's backup list the chooser derives a randomized
//! replay schedule over the distinct segment ids and keeps a shrinking
//! pool of candidate locators per segment. A backup that fails a fetch is
//! marked down for that segment; an empty pool is fatal for the recovery.

use crate::{BackupDescriptor, EmberError, Result, ServerKind};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use tracing::warn;

/// Randomized per-segment backup schedule.
pub struct BackupChooser {
    pools: HashMap<u64, Vec<String>>,
    schedule: Vec<u64>,
}

impl BackupChooser {
    /// Build a chooser from a recovery backup list.
    ///
    /// Entries that are not backups are skipped with a warning.
    pub fn new(backups: &[BackupDescriptor]) -> Self {
        let mut pools: HashMap<u64, Vec<String>> = HashMap::new();
        for descriptor in backups {
            if descriptor.kind != ServerKind::Backup {
                warn!(
                    "backup list for recovery shouldn't contain masters: {}",
                    descriptor.locator
                );
                continue;
            }
            pools
                .entry(descriptor.segment_id)
                .or_default()
                .push(descriptor.locator.clone());
        }
        let mut schedule: Vec<u64> = pools.keys().copied().collect();
        schedule.shuffle(&mut rand::thread_rng());
        Self { pools, schedule }
    }

    /// The randomized replay order over distinct segment ids.
    pub fn schedule(&self) -> &[u64] {
        &self.schedule
    }

    /// Pick a uniformly random remaining locator for a segment.
    ///
    /// Fails with `SegmentRecoveryFailed` once every candidate for the
    /// segment has been marked down.
    pub fn get(&self, segment_id: u64) -> Result<String> {
        let pool = self
            .pools
            .get(&segment_id)
            .filter(|pool| !pool.is_empty())
            .ok_or(EmberError::SegmentRecoveryFailed)?;
        let pick = rand::thread_rng().gen_range(0..pool.len());
        Ok(pool[pick].clone())
    }

    /// Remove one `(segment_id, locator)` mapping after a failed fetch.
    pub fn mark_down(&mut self, segment_id: u64, locator: &str) {
        if let Some(pool) = self.pools.get_mut(&segment_id) {
            if let Some(pos) = pool.iter().position(|l| l == locator) {
                pool.remove(pos);
            }
        }
    }
}
