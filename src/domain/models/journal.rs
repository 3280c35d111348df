//! Journal entry model.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::issue::ReviewSummary;
use super::scope::Scope;

/// One committed check result. Immutable once committed; supersession is a
/// new entry with a higher commit id for the same (session, scope, check).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Strictly monotonic per journal.
    pub commit_id: u64,
    pub session_id: Uuid,
    pub scope: Scope,
    pub check_id: String,
    /// Trigger event the check ran under.
    pub event: String,
    pub result: ReviewSummary,
}

impl JournalEntry {
    pub fn new(
        session_id: Uuid,
        scope: Scope,
        check_id: impl Into<String>,
        event: impl Into<String>,
        result: ReviewSummary,
    ) -> Self {
        Self {
            commit_id: 0,
            session_id,
            scope,
            check_id: check_id.into(),
            event: event.into(),
            result,
        }
    }
}
