//! Core types for emberkv

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a table
pub type TableId = u64;

/// Identifier of an object within a table
pub type ObjectId = u64;

/// What role a server plays in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerKind {
    /// Serves tablets and owns the log
    Master,
    /// Stores replicated segments
    Backup,
}

/// A contiguous key-range of a table, hosted by exactly one master at a time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tablet {
    /// Table this tablet belongs to
    pub table_id: TableId,
    /// First object id covered (inclusive)
    pub start_object_id: ObjectId,
    /// Last object id covered (inclusive)
    pub end_object_id: ObjectId,
    /// Locator of the server currently hosting the tablet
    pub service_locator: String,
    /// Id of the server currently hosting the tablet
    pub server_id: u64,
}

impl Tablet {
    /// Create a tablet covering the full id space of a table
    pub fn full_range(table_id: TableId) -> Self {
        Self {
            table_id,
            start_object_id: 0,
            end_object_id: u64::MAX,
            service_locator: String::new(),
            server_id: 0,
        }
    }

    /// Check whether the tablet covers an object
    pub fn contains(&self, table_id: TableId, object_id: ObjectId) -> bool {
        self.table_id == table_id
            && self.start_object_id <= object_id
            && object_id <= self.end_object_id
    }

    /// Return a copy of the tablet rehomed to a new owner
    pub fn with_owner(&self, service_locator: &str, server_id: u64) -> Self {
        Self {
            service_locator: service_locator.to_string(),
            server_id,
            ..self.clone()
        }
    }
}

impl fmt::Display for Tablet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "table {} [{}, {}] @ {}",
            self.table_id, self.start_object_id, self.end_object_id, self.service_locator
        )
    }
}

/// One entry of a recovery backup list: a backup that holds a replica of
/// one segment of the crashed master's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupDescriptor {
    /// Role of the listed server
    pub kind: ServerKind,
    /// Locator to open a session to
    pub locator: String,
    /// Segment the server claims to hold
    pub segment_id: u64,
}

/// Preconditions a client attaches to an operation.
///
/// Evaluated against the current version of the object, first match wins;
/// see [`crate::reject::check`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RejectRules {
    /// Reject if the object does not exist
    pub doesnt_exist: bool,
    /// Reject if the object exists
    pub exists: bool,
    /// Reject if the current version is less than or equal to `given_version`
    pub version_le_given: bool,
    /// Reject if the current version differs from `given_version`
    pub version_ne_given: bool,
    /// Version the two version rules compare against
    pub given_version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tablet_contains() {
        let t = Tablet {
            table_id: 7,
            start_object_id: 10,
            end_object_id: 20,
            service_locator: "mem://a".into(),
            server_id: 1,
        };
        assert!(t.contains(7, 10));
        assert!(t.contains(7, 20));
        assert!(!t.contains(7, 21));
        assert!(!t.contains(8, 15));
    }

    #[test]
    fn test_with_owner() {
        let t = Tablet::full_range(3);
        let owned = t.with_owner("mem://b", 42);
        assert_eq!(owned.table_id, 3);
        assert_eq!(owned.service_locator, "mem://b");
        assert_eq!(owned.server_id, 42);
    }

    #[test]
    fn test_reject_rules_default() {
        let rules = RejectRules::default();
        assert!(!rules.doesnt_exist && !rules.exists);
        assert!(!rules.version_le_given && !rules.version_ne_given);
    }
}
