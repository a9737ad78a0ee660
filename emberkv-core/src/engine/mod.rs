//! Master storage engine
//!
//! Composes the log, the object index, the tablet set and the reject-rule
//! predicate into the client-visible operations, and drives recovery of
//! tablets from crashed peers (see [`recovery`]).
//!
//! Mutations are serialized by the caller (one serving worker per master);
//! the engine imposes no locking of its own on the hot path beyond the
//! per-structure locks.

mod chooser;
mod eviction;
mod recovery;

pub use chooser::BackupChooser;
pub use eviction::{ObjectEvictionCallback, TombstoneEvictionCallback};

use crate::backup::SessionManager;
use crate::config;
use crate::coordinator::CoordinatorClient;
use crate::index::HashIndex;
use crate::log::{
    EntryRef, EntryType, Log, LogConfig, ObjectRecord, SegmentReplicator, TombstoneRecord,
};
use crate::reject;
use crate::tablet::TabletSet;
use crate::{EmberError, ObjectId, RejectRules, Result, ServerKind, TableId, Tablet};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Index from (table id, object id) to the live log record.
pub type ObjectIndex = HashIndex<EntryRef>;

/// Transient recovery index holding owned tombstone copies.
pub type TombstoneIndex = HashIndex<TombstoneRecord>;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Locator other servers use to reach this master
    pub locator: String,
    /// Byte capacity of one log segment
    pub segment_size: usize,
    /// Byte budget of the object index
    pub hash_table_bytes: usize,
    /// Sealed segments at or below this live ratio are cleaner candidates
    pub cleaner_live_ratio: f64,
    /// In-flight recovery fetches
    pub recovery_fetch_window: usize,
    /// Byte budget of the recovery tombstone index
    pub recovery_tombstone_bytes: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            locator: "mem://master".to_string(),
            segment_size: config::SEGMENT_SIZE,
            hash_table_bytes: config::HASH_TABLE_BYTES,
            cleaner_live_ratio: config::CLEANER_LIVE_RATIO,
            recovery_fetch_window: config::RECOVERY_FETCH_WINDOW,
            recovery_tombstone_bytes: config::RECOVERY_TOMBSTONE_BYTES,
        }
    }
}

/// Counters reported by ping and the stats endpoint.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub server_id: u64,
    pub bytes_written: u64,
    pub bytes_appended: u64,
    pub segment_count: usize,
    pub object_count: usize,
    pub tablet_count: usize,
}

/// The master storage engine.
pub struct MasterEngine {
    config: MasterConfig,
    server_id: u64,
    coordinator: Arc<dyn CoordinatorClient>,
    sessions: Arc<dyn SessionManager>,
    log: Arc<Log>,
    index: Arc<ObjectIndex>,
    tablets: Arc<TabletSet>,
    bytes_written: AtomicU64,
}

impl MasterEngine {
    /// Construct an engine: enlist with the coordinator, build the log and
    /// index, and register the eviction callbacks.
    pub fn new(
        config: MasterConfig,
        coordinator: Arc<dyn CoordinatorClient>,
        sessions: Arc<dyn SessionManager>,
        replicator: Arc<dyn SegmentReplicator>,
    ) -> Result<Self> {
        let server_id = coordinator.enlist_server(ServerKind::Master, &config.locator)?;
        info!("server id is {}", server_id);

        let log = Arc::new(Log::new(
            LogConfig {
                segment_size: config.segment_size,
                cleaner_live_ratio: config.cleaner_live_ratio,
            },
            replicator,
        ));
        let index = Arc::new(ObjectIndex::with_byte_budget(config.hash_table_bytes));
        let tablets = Arc::new(TabletSet::new());

        log.register_type(
            EntryType::Object,
            Arc::new(ObjectEvictionCallback::new(
                Arc::downgrade(&log),
                index.clone(),
                tablets.clone(),
            )),
        );
        log.register_type(
            EntryType::ObjectTombstone,
            Arc::new(TombstoneEvictionCallback::new(Arc::downgrade(&log))),
        );

        Ok(Self {
            config,
            server_id,
            coordinator,
            sessions,
            log,
            index,
            tablets,
            bytes_written: AtomicU64::new(0),
        })
    }

    /// This server's id.
    pub fn server_id(&self) -> u64 {
        self.server_id
    }

    /// Create an object under a server-assigned id.
    ///
    /// The id is allocated skipping anything currently indexed, and the
    /// store carries an `exists` precondition so a racing occupant of the
    /// key is refused rather than overwritten.
    pub fn create(&self, table_id: TableId, value: Bytes) -> Result<(ObjectId, u64)> {
        let table = self.tablets.find(table_id, u64::MAX)?;
        let object_id = table.allocate_key(&self.index);
        let rules = RejectRules {
            exists: true,
            ..Default::default()
        };
        let version = self.store_data(table_id, object_id, &rules, value)?;
        Ok((object_id, version))
    }

    /// Read an object, evaluating reject rules against its version.
    pub fn read(
        &self,
        table_id: TableId,
        object_id: ObjectId,
        rules: &RejectRules,
    ) -> Result<(Bytes, u64)> {
        self.tablets.find(table_id, object_id)?;
        let entry = self
            .index
            .lookup(table_id, object_id)
            .ok_or(EmberError::ObjectDoesntExist)?;
        let record = self.object_at(entry)?;
        reject::check(rules, Some(record.version))?;
        Ok((record.data, record.version))
    }

    /// Write an object, returning the new version.
    pub fn write(
        &self,
        table_id: TableId,
        object_id: ObjectId,
        rules: &RejectRules,
        value: Bytes,
    ) -> Result<u64> {
        self.store_data(table_id, object_id, rules, value)
    }

    /// Remove an object, returning the removed version, or `None` when the
    /// object was already absent and the rules accepted that.
    pub fn remove(
        &self,
        table_id: TableId,
        object_id: ObjectId,
        rules: &RejectRules,
    ) -> Result<Option<u64>> {
        let table = self.tablets.find(table_id, object_id)?;
        let prev_ref = match self.index.lookup(table_id, object_id) {
            Some(entry) => entry,
            None => {
                reject::check(rules, None)?;
                return Ok(None);
            }
        };
        let prev = self.object_at(prev_ref)?;
        reject::check(rules, Some(prev.version))?;

        // A recreated object at this key must version past the deletion.
        table.raise_to(prev.version + 1);

        let tomb = TombstoneRecord {
            table_id,
            object_id,
            object_version: prev.version,
            segment_id: prev_ref.segment_id,
        };
        // The old record must be dead before the append lands; the cleaner
        // may relocate entries as soon as an append returns.
        self.log.free(prev_ref);
        self.log
            .append(EntryType::ObjectTombstone, tomb.encode(), true)?;
        self.index.remove(table_id, object_id);
        Ok(Some(prev.version))
    }

    /// Replace the set of tablets this master serves.
    ///
    /// The log and index must already hold a consistent view of any tablet
    /// being added.
    pub fn set_tablets(&self, tablets: Vec<Tablet>) {
        self.tablets.set_tablets(tablets);
    }

    /// Tablets currently served.
    pub fn tablets(&self) -> Vec<Tablet> {
        self.tablets.snapshot()
    }

    /// One cleaner pass over the log.
    pub fn clean_log(&self) -> usize {
        self.log.clean()
    }

    /// Engine counters.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            server_id: self.server_id,
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_appended: self.log.bytes_appended(),
            segment_count: self.log.segment_count(),
            object_count: self.index.len(),
            tablet_count: self.tablets.len(),
        }
    }

    /// Handle a ping: log the write counters and return the stats.
    pub fn ping(&self) -> EngineStats {
        let stats = self.stats();
        info!("bytes written: {}", stats.bytes_written);
        info!("bytes logged : {}", stats.bytes_appended);
        stats
    }

    fn store_data(
        &self,
        table_id: TableId,
        object_id: ObjectId,
        rules: &RejectRules,
        value: Bytes,
    ) -> Result<u64> {
        let table = self.tablets.find(table_id, object_id)?;
        let prev_ref = self.index.lookup(table_id, object_id);
        let prev = match prev_ref {
            Some(entry) => Some(self.object_at(entry)?),
            None => None,
        };
        reject::check(rules, prev.as_ref().map(|o| o.version))?;

        let version = match &prev {
            Some(prev) => prev.version + 1,
            None => table.allocate_version(),
        };
        let value_len = value.len();
        let record = ObjectRecord::new(table_id, object_id, version, value);

        if let (Some(prev_ref), Some(prev)) = (prev_ref, &prev) {
            let tomb = TombstoneRecord {
                table_id,
                object_id,
                object_version: prev.version,
                segment_id: prev_ref.segment_id,
            };
            // Free the overwritten record before any append; the cleaner
            // may relocate entries as soon as an append returns.
            self.log.free(prev_ref);
            self.log
                .append(EntryType::ObjectTombstone, tomb.encode(), true)?;
        }

        let new_ref = self.log.append(EntryType::Object, record.encode(), true)?;
        self.index.replace(table_id, object_id, new_ref);
        self.bytes_written
            .fetch_add(value_len as u64, Ordering::Relaxed);
        Ok(version)
    }

    fn object_at(&self, entry: EntryRef) -> Result<ObjectRecord> {
        match self.log.entry(entry) {
            Some((EntryType::Object, data)) => ObjectRecord::decode(&data),
            _ => Err(EmberError::Corruption(format!(
                "index references {:?} which is not an object record",
                entry
            ))),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::backup::StaticSessionManager;
    use crate::coordinator::NullCoordinator;
    use crate::log::MemoryReplicator;

    pub fn test_config() -> MasterConfig {
        MasterConfig {
            locator: "mem://local".to_string(),
            segment_size: 512,
            hash_table_bytes: 16 * 1024,
            cleaner_live_ratio: 0.5,
            recovery_fetch_window: 4,
            recovery_tombstone_bytes: 16 * 1024,
        }
    }

    pub fn test_engine() -> (MasterEngine, Arc<MemoryReplicator>, Arc<StaticSessionManager>) {
        let replicator = Arc::new(MemoryReplicator::new());
        let sessions = Arc::new(StaticSessionManager::new());
        let engine = MasterEngine::new(
            test_config(),
            Arc::new(NullCoordinator),
            sessions.clone(),
            replicator.clone(),
        )
        .unwrap();
        engine.set_tablets(vec![Tablet::full_range(7).with_owner("mem://local", 0)]);
        (engine, replicator, sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::test_engine;
    use super::*;
    use rand::Rng;

    #[test]
    fn test_create_then_read() {
        let (engine, _, _) = test_engine();
        let (id, version) = engine.create(7, Bytes::from_static(b"hello")).unwrap();
        assert_eq!(id, 1);
        assert_eq!(version, 1);

        let (value, version) = engine.read(7, id, &RejectRules::default()).unwrap();
        assert_eq!(value, Bytes::from_static(b"hello"));
        assert_eq!(version, 1);
    }

    #[test]
    fn test_unowned_table_is_rejected() {
        let (engine, _, _) = test_engine();
        assert_eq!(
            engine.read(9, 1, &RejectRules::default()),
            Err(EmberError::TableDoesntExist)
        );
        assert_eq!(
            engine.write(9, 1, &RejectRules::default(), Bytes::new()),
            Err(EmberError::TableDoesntExist)
        );
        assert_eq!(
            engine.create(9, Bytes::new()),
            Err(EmberError::TableDoesntExist)
        );
    }

    #[test]
    fn test_rejected_overwrite_leaves_state() {
        let (engine, _, _) = test_engine();
        let (id, _) = engine.create(7, Bytes::from_static(b"hello")).unwrap();

        let rules = RejectRules {
            exists: true,
            ..Default::default()
        };
        assert_eq!(
            engine.write(7, id, &rules, Bytes::from_static(b"x")),
            Err(EmberError::ObjectExists { current: 1 })
        );

        let (value, version) = engine.read(7, id, &RejectRules::default()).unwrap();
        assert_eq!(value, Bytes::from_static(b"hello"));
        assert_eq!(version, 1);
    }

    #[test]
    fn test_overwrite_bumps_version_and_logs_tombstone() {
        let (engine, _, _) = test_engine();
        let (id, _) = engine.create(7, Bytes::from_static(b"hello")).unwrap();

        let version = engine
            .write(7, id, &RejectRules::default(), Bytes::from_static(b"world"))
            .unwrap();
        assert_eq!(version, 2);

        let (value, version) = engine.read(7, id, &RejectRules::default()).unwrap();
        assert_eq!(value, Bytes::from_static(b"world"));
        assert_eq!(version, 2);

        // The supersede tombstone for v1 is in the log.
        let mut tombstones = 0;
        for segment_id in 1..=10 {
            if !engine.log.is_segment_live(segment_id) {
                continue;
            }
            for slot in 0u32..64 {
                if let Some((EntryType::ObjectTombstone, data)) = engine.log.entry(EntryRef {
                    segment_id,
                    slot,
                }) {
                    let tomb = TombstoneRecord::decode(&data).unwrap();
                    assert_eq!((tomb.table_id, tomb.object_id), (7, id));
                    assert_eq!(tomb.object_version, 1);
                    // The segment a tombstone points back to is still live.
                    assert!(engine.log.is_segment_live(tomb.segment_id));
                    tombstones += 1;
                }
            }
        }
        assert_eq!(tombstones, 1);
    }

    #[test]
    fn test_version_precondition_rules() {
        let (engine, _, _) = test_engine();
        let (id, old_version) = engine.create(7, Bytes::from_static(b"a")).unwrap();

        // version_ne_given with the matching version succeeds.
        let rules = RejectRules {
            version_ne_given: true,
            given_version: old_version,
            ..Default::default()
        };
        let version = engine
            .write(7, id, &rules, Bytes::from_static(b"b"))
            .unwrap();
        assert_eq!(version, old_version + 1);

        // With a stale given version it rejects.
        let rules = RejectRules {
            version_ne_given: true,
            given_version: old_version,
            ..Default::default()
        };
        assert_eq!(
            engine.write(7, id, &rules, Bytes::from_static(b"c")),
            Err(EmberError::WrongVersion { current: version })
        );
    }

    #[test]
    fn test_remove_then_recreate_is_monotone() {
        let (engine, _, _) = test_engine();
        let (id, _) = engine.create(7, Bytes::from_static(b"hello")).unwrap();
        engine
            .write(7, id, &RejectRules::default(), Bytes::from_static(b"world"))
            .unwrap();

        let removed = engine.remove(7, id, &RejectRules::default()).unwrap();
        assert_eq!(removed, Some(2));
        assert_eq!(
            engine.read(7, id, &RejectRules::default()),
            Err(EmberError::ObjectDoesntExist)
        );

        // Recreation at any id in the table versions past the deletion.
        let (_, version) = engine.create(7, Bytes::from_static(b"z")).unwrap();
        assert!(version >= 3);
    }

    #[test]
    fn test_double_remove_reports_nonexistent() {
        let (engine, _, _) = test_engine();
        let (id, _) = engine.create(7, Bytes::from_static(b"v")).unwrap();
        assert_eq!(
            engine.remove(7, id, &RejectRules::default()).unwrap(),
            Some(1)
        );
        assert_eq!(engine.remove(7, id, &RejectRules::default()).unwrap(), None);

        let rules = RejectRules {
            doesnt_exist: true,
            ..Default::default()
        };
        assert_eq!(
            engine.remove(7, id, &rules),
            Err(EmberError::ObjectDoesntExist)
        );
    }

    #[test]
    fn test_create_never_reuses_live_id() {
        let (engine, _, _) = test_engine();
        let mut ids = Vec::new();
        for _ in 0..20 {
            let (id, _) = engine.create(7, Bytes::from_static(b"x")).unwrap();
            assert!(!ids.contains(&id));
            ids.push(id);
        }
        // Holes from removals may be skipped but never collide.
        engine.remove(7, ids[3], &RejectRules::default()).unwrap();
        let (id, _) = engine.create(7, Bytes::from_static(b"y")).unwrap();
        assert!(!ids[4..].contains(&id));
    }

    #[test]
    fn test_index_tracks_max_accepted_version() {
        // Random accepted writes/removes per key: the index version always
        // equals the maximum accepted version for that key.
        let (engine, _, _) = test_engine();
        let mut rng = rand::thread_rng();
        let mut expected: std::collections::HashMap<u64, Option<u64>> = Default::default();

        for _ in 0..300 {
            let object_id = rng.gen_range(1..6);
            if rng.gen_bool(0.7) {
                let version = engine
                    .write(7, object_id, &RejectRules::default(), Bytes::from_static(b"p"))
                    .unwrap();
                let slot = expected.entry(object_id).or_default();
                if let Some(prior) = *slot {
                    assert!(version > prior);
                }
                *slot = Some(version);
            } else {
                let removed = engine.remove(7, object_id, &RejectRules::default()).unwrap();
                assert_eq!(removed, expected.get(&object_id).copied().flatten());
                expected.insert(object_id, None);
            }
        }

        for (object_id, version) in expected {
            match version {
                Some(version) => {
                    let (_, current) = engine.read(7, object_id, &RejectRules::default()).unwrap();
                    assert_eq!(current, version);
                }
                None => assert_eq!(
                    engine.read(7, object_id, &RejectRules::default()),
                    Err(EmberError::ObjectDoesntExist)
                ),
            }
        }
    }

    #[test]
    fn test_stats_counters() {
        let (engine, _, _) = test_engine();
        engine.create(7, Bytes::from_static(b"12345")).unwrap();
        let stats = engine.ping();
        assert_eq!(stats.bytes_written, 5);
        assert!(stats.bytes_appended > 5);
        assert_eq!(stats.object_count, 1);
        assert_eq!(stats.tablet_count, 1);
    }
}
