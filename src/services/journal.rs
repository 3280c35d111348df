//! Execution journal: append-only log of committed check results.
//!
//! Commit ids are strictly monotonic per journal. Readers take a snapshot
//! (`begin_snapshot`) and never observe entries committed after it. A
//! result is never mutated in place; the routing return path supersedes an
//! entry by committing a new one for the same (session, scope, check) key.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::models::issue::ReviewSummary;
use crate::domain::models::journal::JournalEntry;
use crate::domain::models::scope::Scope;

/// Append-only journal shared across the run.
#[derive(Debug, Default)]
pub struct ExecutionJournal {
    entries: RwLock<Vec<JournalEntry>>,
    commit: AtomicU64,
}

impl ExecutionJournal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Highest commit id visible right now. Entries committed later carry
    /// strictly greater ids.
    pub fn begin_snapshot(&self) -> u64 {
        self.commit.load(Ordering::SeqCst)
    }

    /// Commit an entry, assigning the next commit id. Returns the committed
    /// entry.
    pub async fn commit_entry(
        &self,
        session_id: Uuid,
        scope: Scope,
        check_id: &str,
        event: &str,
        result: ReviewSummary,
    ) -> JournalEntry {
        let mut entries = self.entries.write().await;
        // Id assignment under the write lock keeps insertion order and id
        // order identical.
        let commit_id = self.commit.fetch_add(1, Ordering::SeqCst) + 1;
        let mut entry = JournalEntry::new(session_id, scope, check_id, event, result);
        entry.commit_id = commit_id;
        entries.push(entry.clone());
        entry
    }

    /// All entries for a session with `commit_id <= snapshot`, optionally
    /// filtered by event, in commit order.
    pub async fn read_visible(
        &self,
        session_id: Uuid,
        snapshot: u64,
        event: Option<&str>,
    ) -> Vec<JournalEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| e.session_id == session_id && e.commit_id <= snapshot)
            .filter(|e| event.is_none_or(|ev| e.event == ev))
            .cloned()
            .collect()
    }

    /// All visible entries for one check, in commit order.
    pub async fn history_for(
        &self,
        session_id: Uuid,
        snapshot: u64,
        check_id: &str,
    ) -> Vec<JournalEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| {
                e.session_id == session_id && e.commit_id <= snapshot && e.check_id == check_id
            })
            .cloned()
            .collect()
    }

    /// The most recent visible entry for a check at exactly the given scope.
    pub async fn latest_at_scope(
        &self,
        session_id: Uuid,
        snapshot: u64,
        check_id: &str,
        scope: &Scope,
    ) -> Option<JournalEntry> {
        self.history_for(session_id, snapshot, check_id)
            .await
            .into_iter()
            .filter(|e| &e.scope == scope)
            .max_by_key(|e| e.commit_id)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn summary(output: serde_json::Value) -> ReviewSummary {
        ReviewSummary::empty().with_output(output)
    }

    #[tokio::test]
    async fn commit_ids_are_monotonic() {
        let journal = ExecutionJournal::new();
        let session = Uuid::new_v4();
        let mut last = 0;
        for i in 0..5 {
            let entry = journal
                .commit_entry(session, Scope::root(), "a", "manual", summary(json!(i)))
                .await;
            assert!(entry.commit_id > last);
            last = entry.commit_id;
        }
        assert_eq!(journal.len().await, 5);
    }

    #[tokio::test]
    async fn snapshot_bounds_reads() {
        let journal = ExecutionJournal::new();
        let session = Uuid::new_v4();
        journal
            .commit_entry(session, Scope::root(), "a", "manual", summary(json!(1)))
            .await;
        let snapshot = journal.begin_snapshot();
        journal
            .commit_entry(session, Scope::root(), "a", "manual", summary(json!(2)))
            .await;

        let visible = journal.read_visible(session, snapshot, None).await;
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].result.output, Some(json!(1)));

        // Read-your-writes: a snapshot begun after the commit sees it.
        let later = journal.begin_snapshot();
        let visible = journal.read_visible(session, later, None).await;
        assert_eq!(visible.len(), 2);
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let journal = ExecutionJournal::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        journal
            .commit_entry(a, Scope::root(), "x", "manual", summary(json!("a")))
            .await;
        journal
            .commit_entry(b, Scope::root(), "x", "manual", summary(json!("b")))
            .await;

        let snapshot = journal.begin_snapshot();
        let visible = journal.read_visible(a, snapshot, None).await;
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].result.output, Some(json!("a")));
    }

    #[tokio::test]
    async fn event_filter_applies() {
        let journal = ExecutionJournal::new();
        let session = Uuid::new_v4();
        journal
            .commit_entry(session, Scope::root(), "x", "pr_opened", summary(json!(1)))
            .await;
        journal
            .commit_entry(session, Scope::root(), "x", "manual", summary(json!(2)))
            .await;
        let snapshot = journal.begin_snapshot();
        let visible = journal.read_visible(session, snapshot, Some("manual")).await;
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].result.output, Some(json!(2)));
    }

    #[tokio::test]
    async fn supersession_picks_latest_commit() {
        let journal = ExecutionJournal::new();
        let session = Uuid::new_v4();
        journal
            .commit_entry(session, Scope::root(), "x", "manual", summary(json!("old")))
            .await;
        journal
            .commit_entry(session, Scope::root(), "x", "manual", summary(json!("new")))
            .await;
        let snapshot = journal.begin_snapshot();
        let latest = journal
            .latest_at_scope(session, snapshot, "x", &Scope::root())
            .await
            .unwrap();
        assert_eq!(latest.result.output, Some(json!("new")));
    }
}
