//! Error types for emberkv

use thiserror::Error;

/// Result type alias for emberkv operations
pub type Result<T> = std::result::Result<T, EmberError>;

/// emberkv error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmberError {
    /// No tablet owned by this server covers the requested object
    #[error("table doesn't exist on this server")]
    TableDoesntExist,

    /// Object not present in the index
    #[error("object doesn't exist")]
    ObjectDoesntExist,

    /// Rejected because the object already exists
    #[error("object exists at version {current}")]
    ObjectExists {
        /// Version of the object that caused the rejection
        current: u64,
    },

    /// Rejected by a version precondition
    #[error("wrong version: object is at version {current}")]
    WrongVersion {
        /// Version of the object that caused the rejection
        current: u64,
    },

    /// No remaining backup can supply a segment needed for recovery
    #[error("segment recovery failed: no backup could supply the segment")]
    SegmentRecoveryFailed,

    /// Request not supported by this server
    #[error("unimplemented request: {0}")]
    Unimplemented(String),

    /// Transport-level failure talking to a remote server
    #[error("transport error: {0}")]
    Transport(String),

    /// Segment replication could not reach the configured replica count
    #[error("replication error: {0}")]
    Replication(String),

    /// Data corruption detected
    #[error("corruption: {0}")]
    Corruption(String),

    /// Segment image checksum mismatch
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Entry larger than a whole segment
    #[error("entry of {size} bytes exceeds segment capacity of {capacity}")]
    EntryTooLarge { size: usize, capacity: usize },
}

impl EmberError {
    /// Check if the error is a client-visible precondition failure
    /// (no server state was mutated).
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            EmberError::TableDoesntExist
                | EmberError::ObjectDoesntExist
                | EmberError::ObjectExists { .. }
                | EmberError::WrongVersion { .. }
        )
    }

    /// Check if the error is a transient external failure worth retrying
    /// against another server.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EmberError::Transport(_))
    }

    /// Check if the error indicates corrupt data
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            EmberError::Corruption(_) | EmberError::ChecksumMismatch { .. }
        )
    }

    /// Short stable code for the wire
    pub fn code(&self) -> &'static str {
        match self {
            EmberError::TableDoesntExist => "TableDoesntExist",
            EmberError::ObjectDoesntExist => "ObjectDoesntExist",
            EmberError::ObjectExists { .. } => "ObjectExists",
            EmberError::WrongVersion { .. } => "WrongVersion",
            EmberError::SegmentRecoveryFailed => "SegmentRecoveryFailed",
            EmberError::Unimplemented(_) => "UnimplementedRequest",
            EmberError::Transport(_) => "Transport",
            EmberError::Replication(_) => "Replication",
            EmberError::Corruption(_) => "Corruption",
            EmberError::ChecksumMismatch { .. } => "ChecksumMismatch",
            EmberError::EntryTooLarge { .. } => "EntryTooLarge",
        }
    }
}
