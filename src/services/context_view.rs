//! Scope-aware, snapshot-bounded projection over the execution journal.
//!
//! Providers and expressions never read the journal directly; they get a
//! `ContextView` bound to (session, snapshot, scope). Resolution order for
//! `get` is exact scope, then nearest ancestor, then most recent any-scope.

use std::sync::Arc;
use uuid::Uuid;

use crate::domain::models::journal::JournalEntry;
use crate::domain::models::scope::Scope;
use crate::services::journal::ExecutionJournal;

#[derive(Clone)]
pub struct ContextView {
    journal: Arc<ExecutionJournal>,
    session_id: Uuid,
    snapshot: u64,
    scope: Scope,
    event: Option<String>,
}

impl ContextView {
    pub fn new(
        journal: Arc<ExecutionJournal>,
        session_id: Uuid,
        snapshot: u64,
        scope: Scope,
        event: Option<String>,
    ) -> Self {
        Self { journal, session_id, snapshot, scope, event }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn snapshot(&self) -> u64 {
        self.snapshot
    }

    /// Rebind the view to a different scope, keeping the snapshot.
    pub fn at_scope(&self, scope: Scope) -> Self {
        Self { scope, ..self.clone() }
    }

    async fn visible_for(&self, check_id: &str) -> Vec<JournalEntry> {
        let entries = self
            .journal
            .history_for(self.session_id, self.snapshot, check_id)
            .await;
        match &self.event {
            Some(event) => entries.into_iter().filter(|e| &e.event == event).collect(),
            None => entries,
        }
    }

    /// Nearest result for a check: exact scope first, then the closest
    /// ancestor scope, then the most recent entry at any scope.
    pub async fn get(&self, check_id: &str) -> Option<JournalEntry> {
        let entries = self.visible_for(check_id).await;
        if entries.is_empty() {
            return None;
        }

        if let Some(exact) = entries
            .iter()
            .filter(|e| e.scope == self.scope)
            .max_by_key(|e| e.commit_id)
        {
            return Some(exact.clone());
        }

        // Walk ancestors from deepest to shallowest.
        let mut ancestor = self.scope.parent();
        while let Some(scope) = ancestor {
            if let Some(found) = entries
                .iter()
                .filter(|e| e.scope == scope)
                .max_by_key(|e| e.commit_id)
            {
                return Some(found.clone());
            }
            ancestor = scope.parent();
        }

        entries.into_iter().max_by_key(|e| e.commit_id)
    }

    /// Aggregate entry: the shallowest-scope result for the check (ties
    /// resolved toward the latest commit).
    pub async fn get_raw(&self, check_id: &str) -> Option<JournalEntry> {
        let entries = self.visible_for(check_id).await;
        let min_depth = entries.iter().map(|e| e.scope.depth()).min()?;
        entries
            .into_iter()
            .filter(|e| e.scope.depth() == min_depth)
            .max_by_key(|e| e.commit_id)
    }

    /// All visible entries for the check in commit order.
    pub async fn get_history(&self, check_id: &str) -> Vec<JournalEntry> {
        self.visible_for(check_id).await
    }
}
