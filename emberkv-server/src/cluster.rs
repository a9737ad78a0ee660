//! HTTP clients for the rest of the cluster
//!
//! The engine consumes the coordinator, backup sessions and segment
//! replication through traits; these implementations speak JSON over HTTP
//! to peers addressed by `http://` locators. All of them block, so they
//! are only called off the async runtime (the engine's recovery threads
//! and `spawn_blocking` handlers).

use bytes::Bytes;
use emberkv_core::backup::{BackupSession, SessionManager};
use emberkv_core::coordinator::CoordinatorClient;
use emberkv_core::log::SegmentReplicator;
use emberkv_core::{EmberError, Result, ServerKind, Tablet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

fn http_client() -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| EmberError::Transport(e.to_string()))
}

#[derive(Serialize)]
struct RecoveryDataRequest<'a> {
    master_id: u64,
    segment_id: u64,
    tablets: &'a [Tablet],
}

/// Session to one backup server over HTTP.
pub struct HttpBackupSession {
    base: String,
    client: reqwest::blocking::Client,
}

impl BackupSession for HttpBackupSession {
    fn get_recovery_data(
        &self,
        master_id: u64,
        segment_id: u64,
        tablets: &[Tablet],
    ) -> Result<Bytes> {
        let url = format!("{}/v1/recovery-data", self.base);
        let response = self
            .client
            .post(&url)
            .json(&RecoveryDataRequest {
                master_id,
                segment_id,
                tablets,
            })
            .send()
            .map_err(|e| EmberError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EmberError::Transport(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        response
            .bytes()
            .map_err(|e| EmberError::Transport(e.to_string()))
    }
}

/// Opens HTTP sessions to backups.
pub struct HttpSessionManager;

impl SessionManager for HttpSessionManager {
    fn open_session(&self, locator: &str) -> Result<Arc<dyn BackupSession>> {
        Ok(Arc::new(HttpBackupSession {
            base: locator.trim_end_matches('/').to_string(),
            client: http_client()?,
        }))
    }
}

#[derive(Serialize)]
struct EnlistRequest<'a> {
    kind: ServerKind,
    locator: &'a str,
}

#[derive(Deserialize)]
struct EnlistResponse {
    server_id: u64,
}

/// Coordinator reached over HTTP.
pub struct HttpCoordinator {
    base: String,
}

impl HttpCoordinator {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }
}

impl CoordinatorClient for HttpCoordinator {
    fn enlist_server(&self, kind: ServerKind, locator: &str) -> Result<u64> {
        let response = http_client()?
            .post(format!("{}/v1/enlist", self.base))
            .json(&EnlistRequest { kind, locator })
            .send()
            .map_err(|e| EmberError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EmberError::Transport(format!(
                "enlist returned {}",
                response.status()
            )));
        }
        let body: EnlistResponse = response
            .json()
            .map_err(|e| EmberError::Transport(e.to_string()))?;
        Ok(body.server_id)
    }

    fn tablets_recovered(&self, tablets: &[Tablet]) -> Result<()> {
        let response = http_client()?
            .post(format!("{}/v1/tablets-recovered", self.base))
            .json(&tablets)
            .send()
            .map_err(|e| EmberError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EmberError::Transport(format!(
                "tablets-recovered returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Ships segment images to a fixed list of backup servers.
///
/// An image must land on every listed backup before the call returns;
/// transient failures are retried a few times before giving up.
pub struct HttpReplicator {
    backups: Vec<String>,
    attempts: usize,
}

impl HttpReplicator {
    pub fn new(backups: Vec<String>) -> Self {
        Self {
            backups,
            attempts: 3,
        }
    }

    fn ship(&self, base: &str, segment_id: u64, image: &Bytes) -> Result<()> {
        let url = format!("{}/v1/segments/{}", base.trim_end_matches('/'), segment_id);
        let client = http_client()?;
        let mut last = None;
        for attempt in 0..self.attempts {
            match client.put(&url).body(image.clone()).send() {
                Ok(response) if response.status().is_success() => {
                    debug!("segment {} replicated to {}", segment_id, base);
                    return Ok(());
                }
                Ok(response) => {
                    last = Some(format!("{} returned {}", url, response.status()));
                }
                Err(e) => last = Some(e.to_string()),
            }
            warn!(
                "replicating segment {} to {} failed (attempt {}): {}",
                segment_id,
                base,
                attempt + 1,
                last.as_deref().unwrap_or("unknown")
            );
        }
        Err(EmberError::Replication(format!(
            "segment {} to {}: {}",
            segment_id,
            base,
            last.unwrap_or_default()
        )))
    }
}

impl SegmentReplicator for HttpReplicator {
    fn replicate(&self, segment_id: u64, image: Bytes) -> Result<()> {
        for base in &self.backups {
            self.ship(base, segment_id, &image)?;
        }
        Ok(())
    }
}
