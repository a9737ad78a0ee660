//! emberkv core: in-memory key-value master storage engine
//!
//! A master server owns a set of tablets and keeps every object in an
//! append-only log whose segments are replicated to backup servers. An
//! in-memory hash index maps (table id, object id) to the live log record.
//! When a peer crashes, a master can take over its tablets by pulling
//! filtered segment images from the crashed peer's backups in parallel and
//! replaying them under a version-wins merge.
//!
//! # Architecture
//!
//! - **Log**: fixed-size segments, typed records, replication on seal and
//!   sync, a cleaner that relocates live records through eviction callbacks
//! - **ObjectIndex**: hash index from key to a revocable log reference
//! - **TabletSet**: served key ranges plus per-table key/version allocators
//! - **MasterEngine**: reject-rule checked read/write/remove/create, and
//!   the parallel recovery driver

pub mod backup;
pub mod coordinator;
pub mod engine;
pub mod index;
pub mod log;
pub mod reject;
pub mod tablet;

mod error;
mod types;

pub use engine::{EngineStats, MasterConfig, MasterEngine, ObjectIndex, TombstoneIndex};
pub use error::{EmberError, Result};
pub use types::*;

/// emberkv version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Log segment size (8MB)
    pub const SEGMENT_SIZE: usize = 8 * 1024 * 1024;

    /// Object index byte budget (16MB)
    pub const HASH_TABLE_BYTES: usize = 16 * 1024 * 1024;

    /// Index bucket granularity: one bucket per cache line of budget
    pub const BYTES_PER_CACHE_LINE: usize = 64;

    /// Sealed segments at or below this live ratio are cleaner candidates
    pub const CLEANER_LIVE_RATIO: f64 = 0.5;

    /// In-flight recovery fetches
    pub const RECOVERY_FETCH_WINDOW: usize = 4;

    /// Recovery tombstone index byte budget (64MB)
    pub const RECOVERY_TOMBSTONE_BYTES: usize = 64 * 1024 * 1024;
}
