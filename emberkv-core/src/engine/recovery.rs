//! Tablet recovery from backups
//!
//! To take over tablets from a crashed master, the engine pulls that
//! master's filtered segment images from backups (a bounded window of
//! parallel fetches, one per segment) and replays each image under a
//! version-wins merge. Tombstones encountered during replay live in a
//! transient index that is drained when the recovery ends.

use super::chooser::BackupChooser;
use super::{MasterEngine, TombstoneIndex};
use crate::log::{EntryType, ObjectRecord, SegmentIterator, TombstoneRecord};
use crate::{BackupDescriptor, EmberError, Result, Tablet};
use bytes::Bytes;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

struct FetchTask {
    segment_id: u64,
    locator: String,
    handle: JoinHandle<Result<Bytes>>,
}

impl MasterEngine {
    /// Take over `recovery_tablets` from crashed master `master_id`.
    ///
    /// `backups` lists, per segment of the crashed master's log, the
    /// backups able to supply a filtered image of it. On success the
    /// coordinator is told and the tablets join the served set; on fatal
    /// failure recovery state is torn down, the coordinator is not
    /// notified, and this master keeps serving its existing tablets.
    pub fn recover(
        &self,
        master_id: u64,
        recovery_tablets: Vec<Tablet>,
        backups: Vec<BackupDescriptor>,
    ) -> Result<()> {
        info!(
            "recovering master {}: {} tablets, {} backup entries",
            master_id,
            recovery_tablets.len(),
            backups.len()
        );

        let tombstones = TombstoneIndex::with_byte_budget(self.config.recovery_tombstone_bytes);
        let result = self.recover_segments(master_id, &recovery_tablets, &backups, &tombstones);

        let mut drained = 0usize;
        tombstones.for_each(|_, _, _| drained += 1);
        debug!("dropping {} recovery tombstones", drained);
        drop(tombstones);
        result?;

        let owned: Vec<Tablet> = recovery_tablets
            .iter()
            .map(|t| t.with_owner(&self.config.locator, self.server_id))
            .collect();
        for tablet in &owned {
            info!("recovered {}", tablet);
        }
        self.coordinator.tablets_recovered(&owned)?;

        let mut merged = self.tablets.snapshot();
        merged.extend(owned);
        self.tablets.set_tablets(merged);
        Ok(())
    }

    fn recover_segments(
        &self,
        master_id: u64,
        tablets: &[Tablet],
        backups: &[BackupDescriptor],
        tombstones: &TombstoneIndex,
    ) -> Result<()> {
        let mut chooser = BackupChooser::new(backups);
        let schedule = chooser.schedule().to_vec();
        info!("{} segments to replay", schedule.len());
        let tablets: Arc<Vec<Tablet>> = Arc::new(tablets.to_vec());

        let window = self.config.recovery_fetch_window.max(1);
        let mut slots: Vec<Option<FetchTask>> =
            std::iter::repeat_with(|| None).take(window).collect();
        let mut pending = schedule.into_iter();
        let mut active = 0usize;

        for slot in slots.iter_mut() {
            let Some(segment_id) = pending.next() else {
                break;
            };
            *slot = Some(self.start_fetch(&mut chooser, master_id, segment_id, &tablets)?);
            active += 1;
        }

        while active > 0 {
            let mut progressed = false;
            for slot in slots.iter_mut() {
                let ready = matches!(slot, Some(task) if task.handle.is_finished());
                if !ready {
                    continue;
                }
                progressed = true;
                let task = slot.take().expect("ready slot");
                let outcome = task.handle.join().unwrap_or_else(|_| {
                    Err(EmberError::Transport(
                        "recovery fetch thread panicked".into(),
                    ))
                });
                match outcome {
                    Ok(image) => {
                        debug!(
                            "recovering segment {} with {} bytes from {}",
                            task.segment_id,
                            image.len(),
                            task.locator
                        );
                        self.replay_segment(task.segment_id, &image, tombstones)?;
                        match pending.next() {
                            Some(next) => {
                                *slot = Some(self.start_fetch(
                                    &mut chooser,
                                    master_id,
                                    next,
                                    &tablets,
                                )?);
                            }
                            None => active -= 1,
                        }
                    }
                    Err(e) => {
                        warn!(
                            "couldn't fetch segment {} from {}, trying next backup: {}",
                            task.segment_id, task.locator, e
                        );
                        chooser.mark_down(task.segment_id, &task.locator);
                        *slot = Some(self.start_fetch(
                            &mut chooser,
                            master_id,
                            task.segment_id,
                            &tablets,
                        )?);
                    }
                }
            }
            if !progressed {
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        self.log.sync()
    }

    /// Launch one fetch for a segment, cycling through the chooser's pool
    /// until a session opens. Exhausting the pool is fatal.
    fn start_fetch(
        &self,
        chooser: &mut BackupChooser,
        master_id: u64,
        segment_id: u64,
        tablets: &Arc<Vec<Tablet>>,
    ) -> Result<FetchTask> {
        loop {
            let locator = chooser.get(segment_id)?;
            match self.sessions.open_session(&locator) {
                Ok(session) => {
                    let tablets = tablets.clone();
                    let handle = std::thread::spawn(move || {
                        session.get_recovery_data(master_id, segment_id, &tablets)
                    });
                    return Ok(FetchTask {
                        segment_id,
                        locator,
                        handle,
                    });
                }
                Err(e) => {
                    warn!("couldn't open session to {}: {}", locator, e);
                    chooser.mark_down(segment_id, &locator);
                }
            }
        }
    }

    /// Replay one filtered segment image from the crashed master's log.
    pub(crate) fn replay_segment(
        &self,
        segment_id: u64,
        image: &[u8],
        tombstones: &TombstoneIndex,
    ) -> Result<()> {
        debug!("replaying segment {}", segment_id);
        let mut cursor = SegmentIterator::new(image)?;
        // A second cursor runs one record ahead, warming both indexes for
        // the key the main cursor reaches next.
        let mut prefetch = SegmentIterator::new(image)?;
        prefetch.next();

        while let Some((entry_type, payload)) = cursor.next() {
            self.prefetch_ahead(&mut prefetch, tombstones);
            match entry_type {
                EntryType::Object => self.replay_object(payload, tombstones)?,
                EntryType::ObjectTombstone => self.replay_tombstone(payload, tombstones)?,
                EntryType::SegmentHeader | EntryType::SegmentFooter => {}
            }
        }
        info!("segment {} replay complete", segment_id);
        Ok(())
    }

    fn prefetch_ahead(&self, prefetch: &mut SegmentIterator<'_>, tombstones: &TombstoneIndex) {
        let Some((entry_type, payload)) = prefetch.next() else {
            return;
        };
        let key = match entry_type {
            EntryType::Object => ObjectRecord::decode(payload)
                .ok()
                .map(|r| (r.table_id, r.object_id)),
            EntryType::ObjectTombstone => TombstoneRecord::decode(payload)
                .ok()
                .map(|r| (r.table_id, r.object_id)),
            _ => None,
        };
        if let Some((table_id, object_id)) = key {
            self.index.prefetch(table_id, object_id);
            tombstones.prefetch(table_id, object_id);
        }
    }

    fn replay_object(&self, payload: &[u8], tombstones: &TombstoneIndex) -> Result<()> {
        let incoming = ObjectRecord::decode(payload)?;
        let (table_id, object_id) = (incoming.table_id, incoming.object_id);

        let local_ref = self.index.lookup(table_id, object_id);
        let tomb = tombstones.lookup(table_id, object_id);
        if local_ref.is_some() && tomb.is_some() {
            return Err(EmberError::Corruption(format!(
                "({}, {}) has both an object and a tombstone during replay",
                table_id, object_id
            )));
        }

        let local = match local_ref {
            Some(entry) => Some(self.object_at(entry)?),
            None => None,
        };
        let min_successor = match (&local, &tomb) {
            (Some(local), _) => local.version + 1,
            (None, Some(tomb)) => tomb.object_version + 1,
            (None, None) => 0,
        };
        if incoming.version < min_successor {
            return Ok(());
        }

        // Lazy append: durability comes from the sync ending the recovery.
        let relocated = self
            .log
            .append(EntryType::Object, Bytes::copy_from_slice(payload), false)?;
        self.index.replace(table_id, object_id, relocated);
        if tomb.is_some() {
            tombstones.remove(table_id, object_id);
        }
        if let Some(old) = local_ref {
            self.log.free(old);
        }
        Ok(())
    }

    fn replay_tombstone(&self, payload: &[u8], tombstones: &TombstoneIndex) -> Result<()> {
        let incoming = TombstoneRecord::decode(payload)?;
        let (table_id, object_id) = (incoming.table_id, incoming.object_id);

        let local_ref = self.index.lookup(table_id, object_id);
        let tomb = tombstones.lookup(table_id, object_id);
        if local_ref.is_some() && tomb.is_some() {
            return Err(EmberError::Corruption(format!(
                "({}, {}) has both an object and a tombstone during replay",
                table_id, object_id
            )));
        }

        let local = match local_ref {
            Some(entry) => Some(self.object_at(entry)?),
            None => None,
        };
        // A tombstone at the same version as a live object supersedes it:
        // that object is the one being deleted.
        let min_successor = match (&local, &tomb) {
            (Some(local), _) => local.version,
            (None, Some(tomb)) => tomb.object_version + 1,
            (None, None) => 0,
        };
        if incoming.object_version < min_successor {
            return Ok(());
        }

        tombstones.replace(table_id, object_id, incoming);
        if let Some(old) = local_ref {
            self.index.remove(table_id, object_id);
            self.log.free(old);
        }
        Ok(())
    }
}
