//! Level dispatcher: executes one topological level of checks.
//!
//! Session-grouped members run sequentially; everything else runs in
//! parallel up to `max_parallelism`. Each check passes the policy gate, the
//! wave-local `if` condition, and dependency gating before its provider is
//! invoked with a fresh snapshot-bound context view. ForEach producers fan
//! their items out to map-mode dependents with per-item scopes, gating, and
//! journaling.

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::errors::ProviderError;
use crate::domain::models::check::{CheckConfig, FanoutMode, SchemaRef};
use crate::domain::models::config::EngineConfig;
use crate::domain::models::event::{telemetry, EnginePayload};
use crate::domain::models::issue::{
    is_failed_item, is_skip_item, mark_failed, skip_marker, Issue, ReviewSummary, Severity,
};
use crate::domain::models::run::{RunInput, RunOptions, RunState, SkipReason};
use crate::domain::models::scope::Scope;
use crate::domain::ports::cancel::CancelToken;
use crate::domain::ports::llm::LlmClient;
use crate::domain::ports::policy::PolicyGate;
use crate::domain::ports::provider::{DependencyResults, ProviderContext};
use crate::providers::ProviderRegistry;
use crate::services::context_view::ContextView;
use crate::services::event_bus::EventBus;
use crate::services::gating::{DependencyGate, GateDecision};
use crate::services::journal::ExecutionJournal;
use crate::services::memory_service::MemoryStore;
use crate::services::retry::RetryPolicy;
use crate::services::routing::{fail_if_issue, RoutingEngine, RoutingOutcome};
use crate::services::sandbox::{EvalContextBuilder, Sandbox};
use crate::services::stats::MetricsRegistry;
use crate::services::template::TemplateService;

/// Fallback timeout for providers without their own bound.
const DEFAULT_CHECK_TIMEOUT_SECS: u64 = 600;

/// Outcome of dispatching one level.
#[derive(Debug, Default, Clone)]
pub struct LevelOutcome {
    /// Routing requested a new planning pass.
    pub wave_retry: bool,
    /// Fail-fast tripped during this level.
    pub fail_fast: bool,
}

/// Shared handles threaded into every check execution.
#[derive(Clone)]
pub struct LevelDispatcher {
    pub config: Arc<EngineConfig>,
    pub registry: Arc<ProviderRegistry>,
    pub journal: Arc<ExecutionJournal>,
    pub memory: Arc<MemoryStore>,
    pub templates: Arc<TemplateService>,
    pub sandbox: Sandbox,
    pub routing: Arc<RoutingEngine>,
    pub bus: Arc<EventBus>,
    pub metrics: Arc<MetricsRegistry>,
    pub policy: Option<Arc<dyn PolicyGate>>,
    pub llm: Option<Arc<dyn LlmClient>>,
    pub mock_for_step: HashMap<String, Value>,
    pub run_input: Arc<RunInput>,
    pub options: Arc<RunOptions>,
    pub cancel: CancelToken,
    pub state: Arc<Mutex<RunState>>,
    pub requested: Arc<HashSet<String>>,
}

impl LevelDispatcher {
    /// Execute one level. Members sharing a `session` annotation run
    /// sequentially with respect to each other.
    pub async fn dispatch_level(&self, level: Vec<String>, event: &str) -> LevelOutcome {
        // Deduplicate while preserving order.
        let mut seen = HashSet::new();
        let level: Vec<String> = level.into_iter().filter(|id| seen.insert(id.clone())).collect();

        // Partition into session groups; non-annotated checks form
        // singleton groups and parallelize freely.
        let mut groups: Vec<Vec<String>> = Vec::new();
        let mut by_session: HashMap<String, usize> = HashMap::new();
        for id in level {
            match self.config.check(&id).and_then(|c| c.session.clone()) {
                Some(session) => {
                    let index = *by_session.entry(session).or_insert_with(|| {
                        groups.push(Vec::new());
                        groups.len() - 1
                    });
                    groups[index].push(id);
                }
                None => groups.push(vec![id]),
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.options.max_parallelism.max(1)));
        let mut handles = Vec::new();
        for group in groups {
            let dispatcher = self.clone();
            let event = event.to_string();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let mut outcome = LevelOutcome::default();
                for check_id in group {
                    let permit = semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("semaphore closed");
                    let one = dispatcher.run_check(&check_id, &event).await;
                    drop(permit);
                    outcome.wave_retry |= one.wave_retry;
                    outcome.fail_fast |= one.fail_fast;
                    if one.fail_fast {
                        break;
                    }
                }
                outcome
            }));
        }

        let mut outcome = LevelOutcome::default();
        for handle in handles {
            if let Ok(one) = handle.await {
                outcome.wave_retry |= one.wave_retry;
                outcome.fail_fast |= one.fail_fast;
            }
        }
        outcome
    }

    /// Run a single check through the full pipeline.
    async fn run_check(&self, check_id: &str, event: &str) -> LevelOutcome {
        let Some(check) = self.config.check(check_id).cloned() else {
            warn!(check = %check_id, "check disappeared from configuration");
            return LevelOutcome::default();
        };

        let (session_id, wave, scope_override, event) = {
            let mut state = self.state.lock().await;
            // At most one execution per wave.
            if state.current_wave_completions.contains(check_id) {
                return LevelOutcome::default();
            }
            if state.fail_fast_triggered {
                state
                    .stats_mut(check_id)
                    .record_skip(SkipReason::FailFast, None);
                state.skipped.insert(check_id.to_string(), SkipReason::FailFast);
                return LevelOutcome::default();
            }
            state.active.insert(check_id.to_string());
            state.stats_mut(check_id);
            let scope_override = state.scope_overrides.remove(check_id);
            // goto_event overrides the trigger event for this run only.
            let event = state
                .event_overrides
                .remove(check_id)
                .unwrap_or_else(|| event.to_string());
            (state.session_id, state.wave, scope_override, event)
        };

        self.metrics.check_started();
        self.bus.publish(
            session_id,
            EnginePayload::CheckScheduled { check_id: check_id.to_string(), wave },
        );

        let outcome = self
            .run_check_inner(&check, &event, session_id, scope_override)
            .await;

        self.metrics.check_finished();
        outcome
    }

    async fn run_check_inner(
        &self,
        check: &CheckConfig,
        event: &str,
        session_id: Uuid,
        scope_override: Option<Scope>,
    ) -> LevelOutcome {
        // 1. Policy gate.
        if let Some(policy) = &self.policy {
            if !policy.allows(check, &self.run_input).await {
                return self.skip(check, SkipReason::PolicyDenied, None).await;
            }
        }

        // 2. Wave-local `if` condition: only checks completed in the
        // current wave are visible. Errors skip (fail-secure).
        if let Some(condition) = &check.if_condition {
            let context = self.wave_local_context(check, session_id).await;
            match self.sandbox.eval_if(condition, &context) {
                Ok(true) => {}
                Ok(false) => {
                    return self
                        .skip(check, SkipReason::IfCondition, Some(condition.clone()))
                        .await;
                }
                Err(err) => {
                    debug!(check = %check.id, error = %err, "if expression error, skipping");
                    return self
                        .skip(check, SkipReason::IfCondition, Some(condition.clone()))
                        .await;
                }
            }
        }

        // 3. Dependency gating.
        {
            let state = self.state.lock().await;
            let gate = DependencyGate::new(&self.config);
            match gate.evaluate(check, &state, &self.requested) {
                GateDecision::Runnable => {}
                GateDecision::NotReady | GateDecision::Skip(_) => {
                    drop(state);
                    return self.skip(check, SkipReason::DependencyFailed, None).await;
                }
            }
        }

        // 4. ForEach fan-out detection: exactly one dependency with
        // committed items, map mode.
        let snapshot = self.journal.begin_snapshot();
        let for_each_parent = self.detect_for_each_parent(check, session_id, snapshot).await;

        match for_each_parent {
            Some((parent_id, items)) if check.effective_fanout() == FanoutMode::Map => {
                if items.is_empty() {
                    let parent_failed = {
                        let state = self.state.lock().await;
                        state.is_failed(&parent_id)
                    };
                    let reason = if parent_failed {
                        SkipReason::DependencyFailed
                    } else {
                        SkipReason::ForEachEmpty
                    };
                    return self.skip(check, reason, None).await;
                }
                self.run_for_each(check, event, session_id, &parent_id).await
            }
            _ => {
                let scope = scope_override.unwrap_or_else(Scope::root);
                self.run_aggregate(check, event, session_id, scope).await
            }
        }
    }

    /// Aggregate-scope execution (the common path).
    async fn run_aggregate(
        &self,
        check: &CheckConfig,
        event: &str,
        session_id: Uuid,
        scope: Scope,
    ) -> LevelOutcome {
        let started = Instant::now();
        let (mut summary, provider_success) = self
            .execute_provider(check, event, session_id, scope.clone(), None)
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        // ForEach producer bookkeeping: an array output becomes the item
        // list; a missing output is an execution error.
        let mut provider_success = provider_success;
        if check.for_each {
            match summary.output.clone() {
                Some(Value::Array(items)) => {
                    summary.for_each_items = Some(items);
                }
                Some(other) => {
                    // A scalar still fans out as a single item.
                    summary.for_each_items = Some(vec![other]);
                }
                None => {
                    summary.issues.push(
                        enrich_issue(
                            check,
                            Issue::new(
                                format!("{}/execution_error", check.id),
                                "forEach check produced no output",
                                Severity::Error,
                            ),
                        ),
                    );
                    summary.for_each_items = Some(Vec::new());
                    provider_success = false;
                }
            }
        }

        self.finish_check(
            check,
            event,
            session_id,
            scope,
            summary,
            provider_success,
            duration_ms,
            true,
        )
        .await
    }

    /// Per-item execution for a map-fanout dependent of a forEach producer.
    async fn run_for_each(
        &self,
        check: &CheckConfig,
        event: &str,
        session_id: Uuid,
        parent_id: &str,
    ) -> LevelOutcome {
        // Re-read the parent's latest aggregated items to absorb retries.
        let snapshot = self.journal.begin_snapshot();
        let view = ContextView::new(
            self.journal.clone(),
            session_id,
            snapshot,
            Scope::root(),
            None,
        );
        let items: Vec<Value> = view
            .get_raw(parent_id)
            .await
            .and_then(|entry| entry.result.for_each_items)
            .unwrap_or_default();

        let mut aggregated_outputs: Vec<Value> = Vec::with_capacity(items.len());
        let mut item_results: Vec<ReviewSummary> = Vec::with_capacity(items.len());
        let mut fatal_mask: Vec<bool> = Vec::with_capacity(items.len());
        let mut aggregate_issues: Vec<Issue> = Vec::new();
        let mut total_duration_ms = 0u64;

        for (index, item) in items.iter().enumerate() {
            // Failed or skipped iterations cascade without counting.
            if is_failed_item(item) || is_skip_item(item) {
                aggregated_outputs.push(skip_marker());
                item_results.push(ReviewSummary::empty());
                fatal_mask.push(false);
                self.bus.telemetry(
                    session_id,
                    telemetry::FOREACH_ITEM,
                    json!({
                        "check": check.id, "parent": parent_id,
                        "index": index, "skipped": true,
                    }),
                );
                continue;
            }

            // Per-item OR-group gating: a group containing the parent is
            // carried by this item; other groups were settled at check
            // level.
            if !self.item_groups_satisfied(check, parent_id, session_id).await {
                aggregated_outputs.push(skip_marker());
                item_results.push(ReviewSummary::empty());
                fatal_mask.push(false);
                continue;
            }

            let scope = Scope::item(parent_id, index);
            let started = Instant::now();
            let (mut summary, mut success) = self
                .execute_provider(check, event, session_id, scope.clone(), Some(item.clone()))
                .await;
            let duration_ms = started.elapsed().as_millis() as u64;
            total_duration_ms += duration_ms;

            // Fatal rules wrap the output so dependents cascade-skip.
            let mut failed = summary.has_fatal_issues();

            // Per-item fail_if.
            if let Some(expression) = check.fail_if.as_ref().or(self.config.fail_if.as_ref()) {
                let context = self
                    .routing_context(check, session_id, &scope, &summary)
                    .await;
                let triggered = self.sandbox.eval_fail_if(expression, &context);
                self.bus.telemetry(
                    session_id,
                    telemetry::FAIL_IF_EVALUATED,
                    json!({
                        "check": check.id, "scope": scope.to_string(),
                        "expression": expression, "triggered": triggered,
                    }),
                );
                if triggered {
                    summary
                        .issues
                        .push(enrich_issue(check, fail_if_issue(&check.id, expression)));
                    failed = true;
                    self.metrics.record_fail_if(&scope.to_string());
                    self.bus.telemetry(
                        session_id,
                        telemetry::FAIL_IF_TRIGGERED,
                        json!({"check": check.id, "scope": scope.to_string()}),
                    );
                }
            }
            if failed {
                success = false;
                let wrapped = mark_failed(summary.output.clone().unwrap_or(Value::Null));
                summary.output = Some(wrapped);
            }

            {
                let mut state = self.state.lock().await;
                let stats = state.stats_mut(&check.id);
                stats.record_run(success, duration_ms);
                stats.record_issues(&summary.issues);
                stats.outputs_produced += u32::from(summary.output.is_some());
            }
            for issue in &summary.issues {
                self.metrics.record_issue(issue.severity);
            }

            self.bus.telemetry(
                session_id,
                telemetry::FOREACH_ITEM,
                json!({
                    "check": check.id, "parent": parent_id,
                    "index": index, "failed": failed,
                }),
            );

            // Commit the per-item entry before moving on.
            self.journal
                .commit_entry(session_id, scope, &check.id, event, summary.clone())
                .await;

            aggregated_outputs.push(summary.output.clone().unwrap_or(Value::Null));
            aggregate_issues.extend(summary.issues.clone());
            item_results.push(summary);
            fatal_mask.push(failed);
        }

        // Aggregate entry carries the fan-out bookkeeping.
        let aggregate = ReviewSummary {
            issues: aggregate_issues,
            output: Some(Value::Array(aggregated_outputs.clone())),
            content: None,
            for_each_items: Some(aggregated_outputs),
            for_each_item_results: Some(item_results),
            for_each_fatal_mask: Some(fatal_mask),
        };
        let success = !aggregate.has_fatal_issues();

        self.finish_check(
            check,
            event,
            session_id,
            Scope::root(),
            aggregate,
            success,
            total_duration_ms,
            false,
        )
        .await
    }

    /// Shared completion path: record completion before routing, route,
    /// commit the routed result, then per-item stubs for forEach producers.
    #[allow(clippy::too_many_arguments)]
    async fn finish_check(
        &self,
        check: &CheckConfig,
        event: &str,
        session_id: Uuid,
        scope: Scope,
        mut summary: ReviewSummary,
        provider_success: bool,
        duration_ms: u64,
        count_run: bool,
    ) -> LevelOutcome {
        let routing_context = self
            .routing_context(check, session_id, &scope, &summary)
            .await;

        let (outcome, fail_fast) = {
            let mut state = self.state.lock().await;

            // Completion is recorded before routing so self-goto sees the
            // check as completed.
            state.completed.insert(check.id.clone());
            state.current_wave_completions.insert(check.id.clone());
            state.active.remove(&check.id);

            let outcome: RoutingOutcome = self.routing.process(
                check,
                &scope,
                provider_success,
                &routing_context,
                &mut summary,
                &mut state,
            );

            enrich_summary(check, &mut summary);

            if count_run {
                let stats = state.stats_mut(&check.id);
                stats.record_run(outcome.success, duration_ms);
                stats.record_issues(&summary.issues);
                stats.outputs_produced += u32::from(summary.output.is_some());
                if let Some(items) = &summary.for_each_items {
                    stats.for_each_preview = items.iter().take(5).cloned().collect();
                }
                if !outcome.success {
                    if let Some(issue) = summary.issues.iter().find(|i| i.is_fatal()) {
                        stats.error_message = Some(issue.message.clone());
                    }
                }
            } else {
                // Per-item runs were already counted; keep the preview.
                let stats = state.stats_mut(&check.id);
                if let Some(items) = &summary.for_each_items {
                    stats.for_each_preview = items.iter().take(5).cloned().collect();
                }
            }

            // Failed-set membership follows the statistics invariant: a
            // check that only ever failed blocks its dependents. A forEach
            // dependent with a partial item failure stays out of the set so
            // dependents iterate with skip markers instead.
            if state.stats_mut(&check.id).is_completely_failed() {
                state.failed.insert(check.id.clone());
            } else {
                state.failed.remove(&check.id);
            }

            let fail_fast = self.options.fail_fast && !outcome.success;
            if fail_fast {
                state.fail_fast_triggered = true;
            }
            (outcome, fail_fast)
        };

        // Render content after routing so fail_if issues are included.
        if summary.content.is_none() {
            let data = self.routing_context(check, session_id, &scope, &summary).await;
            summary.content = self.templates.render_check_content(check, &summary, &data);
        }

        if count_run {
            // Per-item paths already recorded their issues.
            for issue in &summary.issues {
                self.metrics.record_issue(issue.severity);
            }
        }
        self.metrics
            .record_provider_duration(&check.check_type, duration_ms);

        // Commit the (possibly routing-mutated) result.
        self.journal
            .commit_entry(session_id, scope.clone(), &check.id, event, summary.clone())
            .await;

        // Per-item stubs for forEach producers so map-mode dependents can
        // bind item scopes.
        if check.for_each {
            if let Some(items) = &summary.for_each_items {
                for (index, item) in items.iter().enumerate() {
                    let stub = ReviewSummary::empty().with_output(item.clone());
                    self.journal
                        .commit_entry(
                            session_id,
                            Scope::item(&check.id, index),
                            &check.id,
                            event,
                            stub,
                        )
                        .await;
                }
            }
        }

        self.bus.publish(
            session_id,
            EnginePayload::CheckCompleted {
                check_id: check.id.clone(),
                scope,
                success: outcome.success,
                duration_ms,
                issue_count: summary.issues.len(),
            },
        );

        LevelOutcome { wave_retry: outcome.wave_retry, fail_fast }
    }

    /// Invoke the provider with retry for transient errors, a timeout, and
    /// cancellation. Hard errors become issues, not run aborts.
    async fn execute_provider(
        &self,
        check: &CheckConfig,
        event: &str,
        session_id: Uuid,
        scope: Scope,
        item: Option<Value>,
    ) -> (ReviewSummary, bool) {
        let provider = match self.registry.resolve(&check.check_type) {
            Ok(provider) => provider,
            Err(err) => {
                return (provider_error_summary(check, &err), false);
            }
        };

        let snapshot = self.journal.begin_snapshot();
        let view = ContextView::new(
            self.journal.clone(),
            session_id,
            snapshot,
            scope.clone(),
            None,
        );

        let deps = self.dependency_results(check, &view, item.as_ref()).await;
        let template_data = self
            .eval_context_for(check, session_id, &view, &deps, item.clone())
            .await;
        let history = self.history_snapshot(session_id, snapshot).await;

        let mut env = self.config.env.iter().map(|(k, v)| (k.clone(), v.clone()))
            .collect::<HashMap<_, _>>();
        env.extend(check.env.clone());

        let ctx = ProviderContext {
            session_id,
            scope: scope.clone(),
            event: event.to_string(),
            view,
            memory: self.memory.clone(),
            templates: self.templates.clone(),
            sandbox: self.sandbox.clone(),
            cancel: self.cancel.clone(),
            llm: self.llm.clone(),
            ai_model: self.config.ai_model.clone(),
            events: Some(self.bus.clone()),
            template_data,
            mock_for_step: self.mock_for_step.clone(),
            history,
            working_dir: self.options.working_dir.clone(),
            env,
            debug: self.run_input.debug,
        };

        let retry_policy = RetryPolicy::from_config(check.retry_config());
        let timeout_secs = check.timeout.unwrap_or(DEFAULT_CHECK_TIMEOUT_SECS);

        let (result, _retries) = retry_policy
            .execute(|| {
                let provider = provider.clone();
                let ctx = ctx.clone();
                let run = self.run_input.clone();
                let check = check.clone();
                let deps = deps.clone();
                async move {
                    match timeout(
                        Duration::from_secs(timeout_secs),
                        provider.execute(&run, &check, &deps, &ctx),
                    )
                    .await
                    {
                        Ok(inner) => inner,
                        Err(_) => Err(ProviderError::Timeout(timeout_secs)),
                    }
                }
            })
            .await;

        match result {
            Ok(mut summary) => {
                enrich_summary(check, &mut summary);
                (summary, true)
            }
            Err(err) => {
                self.bus.publish(
                    session_id,
                    EnginePayload::CheckErrored {
                        check_id: check.id.clone(),
                        scope,
                        error: err.to_string(),
                    },
                );
                (provider_error_summary(check, &err), false)
            }
        }
    }

    /// Outputs of this check's declared dependencies at the current scope.
    async fn dependency_results(
        &self,
        check: &CheckConfig,
        view: &ContextView,
        item: Option<&Value>,
    ) -> DependencyResults {
        let mut deps = DependencyResults::default();
        for option in check.dependency_options() {
            if let Some(entry) = view.get(&option).await {
                let output = match (item, entry.result.for_each_items.as_ref()) {
                    // In per-item mode the producing dependency contributes
                    // the current item rather than its aggregate.
                    (Some(item), Some(_)) => item.clone(),
                    _ => entry.result.output.clone().unwrap_or(Value::Null),
                };
                deps.outputs.insert(option.clone(), output);
            }
            if let Some(entry) = view.get_raw(&option).await {
                deps.outputs_raw
                    .insert(option.clone(), entry.result.output.clone().unwrap_or(Value::Null));
            }
        }
        deps
    }

    /// The shared template/sandbox context for a provider invocation.
    async fn eval_context_for(
        &self,
        check: &CheckConfig,
        _session_id: Uuid,
        _view: &ContextView,
        deps: &DependencyResults,
        item: Option<Value>,
    ) -> Value {
        let memory_snapshot = self.memory.snapshot(check.namespace.as_deref()).await;
        let output = match item {
            Some(item) => item,
            None => single_dependency_output(deps),
        };
        EvalContextBuilder::new()
            .output(output)
            .outputs(deps.outputs.clone())
            .outputs_raw(deps.outputs_raw.clone())
            .memory(memory_snapshot)
            .inputs(self.config.output.clone().unwrap_or(Value::Null))
            .env(self.merged_env(check))
            .run_input(&self.run_input)
            .check(
                &check.id,
                check.schema.as_ref().and_then(SchemaRef::label),
                check.group.as_deref(),
            )
            .build()
    }

    fn merged_env(&self, check: &CheckConfig) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.extend(check.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    /// Context for `if`: only checks completed in the current wave are
    /// visible.
    async fn wave_local_context(&self, check: &CheckConfig, session_id: Uuid) -> Value {
        let wave_completions: Vec<String> = {
            let state = self.state.lock().await;
            state.current_wave_completions.iter().cloned().collect()
        };
        let snapshot = self.journal.begin_snapshot();
        let view = ContextView::new(
            self.journal.clone(),
            session_id,
            snapshot,
            Scope::root(),
            None,
        );
        let mut outputs = Map::new();
        let mut outputs_raw = Map::new();
        for id in wave_completions {
            if let Some(entry) = view.get(&id).await {
                outputs.insert(id.clone(), entry.result.output.clone().unwrap_or(Value::Null));
            }
            if let Some(entry) = view.get_raw(&id).await {
                outputs_raw.insert(id, entry.result.output.clone().unwrap_or(Value::Null));
            }
        }
        let memory_snapshot = self.memory.snapshot(check.namespace.as_deref()).await;
        EvalContextBuilder::new()
            .outputs(outputs)
            .outputs_raw(outputs_raw)
            .memory(memory_snapshot)
            .env(self.merged_env(check))
            .run_input(&self.run_input)
            .check(
                &check.id,
                check.schema.as_ref().and_then(SchemaRef::label),
                check.group.as_deref(),
            )
            .build()
    }

    /// Context for `fail_if`/`goto_js`: the entire visible journal.
    async fn routing_context(
        &self,
        check: &CheckConfig,
        session_id: Uuid,
        scope: &Scope,
        summary: &ReviewSummary,
    ) -> Value {
        let snapshot = self.journal.begin_snapshot();
        let view = ContextView::new(
            self.journal.clone(),
            session_id,
            snapshot,
            scope.clone(),
            None,
        );
        let entries = self.journal.read_visible(session_id, snapshot, None).await;
        let mut ids: Vec<String> = entries.iter().map(|e| e.check_id.clone()).collect();
        ids.sort();
        ids.dedup();

        let mut outputs = Map::new();
        let mut outputs_raw = Map::new();
        for id in ids {
            if let Some(entry) = view.get(&id).await {
                outputs.insert(id.clone(), entry.result.output.clone().unwrap_or(Value::Null));
            }
            if let Some(entry) = view.get_raw(&id).await {
                outputs_raw.insert(id, entry.result.output.clone().unwrap_or(Value::Null));
            }
        }
        let memory_snapshot = self.memory.snapshot(check.namespace.as_deref()).await;
        EvalContextBuilder::new()
            .output(summary.output.clone().unwrap_or(Value::Null))
            .outputs(outputs)
            .outputs_raw(outputs_raw)
            .memory(memory_snapshot)
            .issues(&summary.issues)
            .env(self.merged_env(check))
            .run_input(&self.run_input)
            .check(
                &check.id,
                check.schema.as_ref().and_then(SchemaRef::label),
                check.group.as_deref(),
            )
            .build()
    }

    /// Point-in-time output history for providers.
    async fn history_snapshot(
        &self,
        session_id: Uuid,
        snapshot: u64,
    ) -> HashMap<String, Vec<Value>> {
        let entries = self.journal.read_visible(session_id, snapshot, None).await;
        let mut history: HashMap<String, Vec<Value>> = HashMap::new();
        for entry in entries {
            if let Some(output) = entry.result.output {
                history.entry(entry.check_id).or_default().push(output);
            }
        }
        history
    }

    /// Find the single forEach dependency, if any, and its items.
    async fn detect_for_each_parent(
        &self,
        check: &CheckConfig,
        session_id: Uuid,
        snapshot: u64,
    ) -> Option<(String, Vec<Value>)> {
        let view = ContextView::new(
            self.journal.clone(),
            session_id,
            snapshot,
            Scope::root(),
            None,
        );
        let mut parents = Vec::new();
        for option in check.dependency_options() {
            if let Some(entry) = view.get_raw(&option).await {
                if let Some(items) = entry.result.for_each_items {
                    parents.push((option, items));
                }
            }
        }
        // Exactly one forEach dependency triggers fan-out.
        if parents.len() == 1 {
            parents.pop()
        } else {
            None
        }
    }

    /// Per-item gating for groups that include the forEach parent. The
    /// current item already passed its own marker check; a group is carried
    /// either by the parent or by any other satisfied option.
    async fn item_groups_satisfied(
        &self,
        check: &CheckConfig,
        parent_id: &str,
        _session_id: Uuid,
    ) -> bool {
        let state = self.state.lock().await;
        let gate = DependencyGate::new(&self.config);
        for group in check.dependency_groups() {
            if group.iter().any(|o| o == parent_id) {
                continue;
            }
            // Build a one-group probe so OR semantics stay in one place.
            let mut probe = check.clone();
            probe.depends_on = vec![group.join("|")];
            if gate.evaluate(&probe, &state, &self.requested) != GateDecision::Runnable {
                return false;
            }
        }
        true
    }

    async fn skip(
        &self,
        check: &CheckConfig,
        reason: SkipReason,
        condition: Option<String>,
    ) -> LevelOutcome {
        let mut state = self.state.lock().await;
        state.active.remove(&check.id);
        state
            .skipped
            .entry(check.id.clone())
            .and_modify(|existing| *existing = SkipReason::strongest(*existing, reason))
            .or_insert(reason);
        state.stats_mut(&check.id).record_skip(reason, condition);
        debug!(check = %check.id, reason = %reason, "check skipped");
        LevelOutcome::default()
    }
}

/// The primary dependency output when the check has exactly one dependency.
fn single_dependency_output(deps: &DependencyResults) -> Value {
    if deps.outputs.len() == 1 {
        deps.outputs.values().next().cloned().unwrap_or(Value::Null)
    } else {
        Value::Null
    }
}

/// Wrap a provider error as issues on the check.
fn provider_error_summary(check: &CheckConfig, err: &ProviderError) -> ReviewSummary {
    let rule = match err {
        ProviderError::Cancelled => format!("{}/cancelled", check.id),
        ProviderError::UnknownProvider(_) | ProviderError::Unavailable { .. } => {
            format!("{}/error", check.id)
        }
        _ => format!("{}/execution_error", check.id),
    };
    let mut summary = ReviewSummary::empty();
    summary
        .issues
        .push(enrich_issue(check, Issue::new(rule, err.to_string(), Severity::Error)));
    summary
}

/// Qualify rule ids as `<checkId>/<innerRuleId>` and stamp check metadata.
fn enrich_summary(check: &CheckConfig, summary: &mut ReviewSummary) {
    for issue in &mut summary.issues {
        *issue = enrich_issue(check, issue.clone());
    }
}

fn enrich_issue(check: &CheckConfig, mut issue: Issue) -> Issue {
    if !issue.rule_id.starts_with(&format!("{}/", check.id)) {
        issue.rule_id = format!("{}/{}", check.id, issue.rule_id);
    }
    if issue.check_id.is_none() {
        issue.check_id = Some(check.id.clone());
    }
    if issue.group.is_none() {
        issue.group = check.group.clone();
    }
    if issue.schema.is_none() {
        issue.schema = check
            .schema
            .as_ref()
            .and_then(SchemaRef::label)
            .map(String::from);
    }
    if issue.timestamp.is_none() {
        issue.timestamp = Some(Utc::now());
    }
    issue
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enrichment_qualifies_rule_ids_once() {
        let mut check = CheckConfig::new("security", "ai");
        check.group = Some("review".into());
        let issue = enrich_issue(&check, Issue::new("sqli", "injection", Severity::Error));
        assert_eq!(issue.rule_id, "security/sqli");
        assert_eq!(issue.check_id.as_deref(), Some("security"));
        assert_eq!(issue.group.as_deref(), Some("review"));
        assert!(issue.timestamp.is_some());

        // Already-qualified ids stay untouched.
        let again = enrich_issue(&check, issue.clone());
        assert_eq!(again.rule_id, "security/sqli");
    }

    #[test]
    fn provider_errors_map_to_rule_ids() {
        let check = CheckConfig::new("fetch", "command");
        let summary =
            provider_error_summary(&check, &ProviderError::Subprocess("exit 1".into()));
        assert_eq!(summary.issues[0].rule_id, "fetch/execution_error");

        let summary = provider_error_summary(&check, &ProviderError::Cancelled);
        assert_eq!(summary.issues[0].rule_id, "fetch/cancelled");

        let summary = provider_error_summary(
            &check,
            &ProviderError::UnknownProvider("nope".into()),
        );
        assert_eq!(summary.issues[0].rule_id, "fetch/error");
        assert!(summary.has_fatal_issues());
    }

    #[test]
    fn single_dependency_output_picks_lone_dep() {
        let mut deps = DependencyResults::default();
        assert_eq!(single_dependency_output(&deps), Value::Null);
        deps.outputs.insert("a".into(), json!([1]));
        assert_eq!(single_dependency_output(&deps), json!([1]));
        deps.outputs.insert("b".into(), json!(2));
        assert_eq!(single_dependency_output(&deps), Value::Null);
    }
}
