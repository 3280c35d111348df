//! Property tests for the execution journal and context view.

use proptest::prelude::*;
use serde_json::json;
use uuid::Uuid;

use vigil::domain::models::issue::ReviewSummary;
use vigil::domain::models::scope::Scope;
use vigil::services::context_view::ContextView;
use vigil::services::journal::ExecutionJournal;

fn summary(n: u64) -> ReviewSummary {
    ReviewSummary::empty().with_output(json!(n))
}

proptest! {
    /// Property: commit ids are unique and strictly increasing in
    /// insertion order, regardless of scope/check interleaving.
    #[test]
    fn prop_commit_ids_monotonic(entries in prop::collection::vec((0u8..4, 0u8..3), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        runtime.block_on(async move {
            let journal = ExecutionJournal::new();
            let session = Uuid::new_v4();
            let mut last = 0u64;
            for (i, (check, item)) in entries.iter().enumerate() {
                let scope = if *item == 0 {
                    Scope::root()
                } else {
                    Scope::item(format!("c{check}"), *item as usize)
                };
                let entry = journal
                    .commit_entry(session, scope, &format!("c{check}"), "manual", summary(i as u64))
                    .await;
                prop_assert!(entry.commit_id > last, "commit ids must increase");
                last = entry.commit_id;
            }
            Ok(())
        })?;
    }

    /// Property: a view bound to snapshot S never observes entries
    /// committed after S, for any split point.
    #[test]
    fn prop_snapshot_isolation(total in 1usize..30, split_ratio in 0.0f64..1.0) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        runtime.block_on(async move {
            let journal = ExecutionJournal::new();
            let session = Uuid::new_v4();
            let split = ((total as f64) * split_ratio) as usize;

            for i in 0..split {
                journal
                    .commit_entry(session, Scope::root(), "x", "manual", summary(i as u64))
                    .await;
            }
            let snapshot = journal.begin_snapshot();
            for i in split..total {
                journal
                    .commit_entry(session, Scope::root(), "x", "manual", summary(i as u64))
                    .await;
            }

            let view = ContextView::new(journal.clone(), session, snapshot, Scope::root(), None);
            let history = view.get_history("x").await;
            prop_assert_eq!(history.len(), split);
            for entry in &history {
                prop_assert!(entry.commit_id <= snapshot);
            }

            // The latest visible entry is the last pre-snapshot commit.
            match view.get("x").await {
                Some(entry) => {
                    prop_assert_eq!(entry.result.output, Some(json!((split - 1) as u64)));
                }
                None => prop_assert_eq!(split, 0),
            }
            Ok(())
        })?;
    }

    /// Property: scope resolution prefers exact over ancestor over latest,
    /// for arbitrary item indices.
    #[test]
    fn prop_scope_resolution_order(index in 0usize..8) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        runtime.block_on(async move {
            let journal = ExecutionJournal::new();
            let session = Uuid::new_v4();

            journal
                .commit_entry(session, Scope::root(), "p", "manual", summary(100))
                .await;
            journal
                .commit_entry(session, Scope::item("p", index), "p", "manual", summary(index as u64))
                .await;
            let snapshot = journal.begin_snapshot();

            // Exact scope wins.
            let exact = ContextView::new(
                journal.clone(), session, snapshot, Scope::item("p", index), None,
            );
            prop_assert_eq!(
                exact.get("p").await.expect("entry").result.output,
                Some(json!(index as u64))
            );

            // A sibling index falls back to the root ancestor.
            let sibling = ContextView::new(
                journal.clone(), session, snapshot, Scope::item("p", index + 1), None,
            );
            prop_assert_eq!(
                sibling.get("p").await.expect("entry").result.output,
                Some(json!(100))
            );

            // get_raw always returns the shallowest entry.
            prop_assert_eq!(
                exact.get_raw("p").await.expect("entry").scope,
                Scope::root()
            );
            Ok(())
        })?;
    }
}
