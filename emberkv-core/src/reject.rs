//! Reject-rule evaluation
//!
//! A pure predicate over `(rules, current version)`. The engine calls this
//! before any mutation; a rejection returns before any state changes.

use crate::{EmberError, RejectRules, Result};

/// Check a set of reject rules against the current state of an object.
///
/// `current` is `None` when the object does not exist. The first matching
/// rule wins:
///
/// - absent + `doesnt_exist` -> `ObjectDoesntExist`
/// - absent otherwise -> accept
/// - `exists` -> `ObjectExists`
/// - `version_le_given` and version <= `given_version` -> `WrongVersion`
/// - `version_ne_given` and version != `given_version` -> `WrongVersion`
pub fn check(rules: &RejectRules, current: Option<u64>) -> Result<()> {
    let version = match current {
        None => {
            if rules.doesnt_exist {
                return Err(EmberError::ObjectDoesntExist);
            }
            return Ok(());
        }
        Some(version) => version,
    };
    if rules.exists {
        return Err(EmberError::ObjectExists { current: version });
    }
    if rules.version_le_given && version <= rules.given_version {
        return Err(EmberError::WrongVersion { current: version });
    }
    if rules.version_ne_given && version != rules.given_version {
        return Err(EmberError::WrongVersion { current: version });
    }
    Ok(())
}
