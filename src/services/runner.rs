//! State-machine runner: WavePlanning ⇄ LevelDispatch ⇄ WaveRetry →
//! Terminal.
//!
//! Ties planning, dispatch, routing, and statistics together and produces
//! the final [`AnalysisResult`]. Termination: the level queue is drained
//! with no pending forward runs and no active dispatches, or fail-fast
//! cleared the queue.

use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::config::EngineConfig;
use crate::domain::models::event::{telemetry, EnginePayload};
use crate::domain::models::issue::{Issue, ReviewSummary, Severity};
use crate::domain::models::run::{AnalysisResult, RunInput, RunOptions, RunState, SkipReason};
use crate::domain::models::scope::Scope;
use crate::domain::ports::cancel::{cancel_pair, CancelHandle, CancelToken};
use crate::domain::ports::event_sink::EventSink;
use crate::domain::ports::llm::LlmClient;
use crate::domain::ports::policy::PolicyGate;
use crate::providers::ProviderRegistry;
use crate::services::dispatcher::LevelDispatcher;
use crate::services::event_bus::EventBus;
use crate::services::journal::ExecutionJournal;
use crate::services::memory_service::MemoryStore;
use crate::services::planner::WavePlanner;
use crate::services::routing::RoutingEngine;
use crate::services::sandbox::Sandbox;
use crate::services::stats::MetricsRegistry;
use crate::services::template::TemplateService;

/// Hard ceiling on planning passes; a run that legitimately needs more than
/// this is outside the loop budget anyway.
const MAX_WAVES: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    WavePlanning,
    LevelDispatch,
    WaveRetry,
    Terminal,
}

/// External collaborators wired by the caller.
#[derive(Default, Clone)]
pub struct ExecutionHooks {
    pub llm: Option<Arc<dyn LlmClient>>,
    pub policy: Option<Arc<dyn PolicyGate>>,
    /// Canned per-check results, bypassing real provider execution.
    pub mock_for_step: HashMap<String, Value>,
}

/// The engine runner. Construct once per configuration; `run` may be called
/// for multiple inputs, each with a fresh session.
pub struct EngineRunner {
    config: Arc<EngineConfig>,
    registry: Arc<ProviderRegistry>,
    journal: Arc<ExecutionJournal>,
    memory: Arc<MemoryStore>,
    templates: Arc<TemplateService>,
    sandbox: Sandbox,
    bus: Arc<EventBus>,
    metrics: Arc<MetricsRegistry>,
    hooks: ExecutionHooks,
    cancel: (CancelHandle, CancelToken),
}

impl EngineRunner {
    pub fn new(config: EngineConfig, working_dir: impl Into<std::path::PathBuf>) -> Self {
        let config = Arc::new(config);
        let memory = MemoryStore::new(&config.memory);
        Self {
            registry: Arc::new(ProviderRegistry::with_builtins()),
            journal: ExecutionJournal::new(),
            memory,
            templates: Arc::new(TemplateService::new(working_dir)),
            sandbox: Sandbox::new(),
            bus: EventBus::with_defaults(),
            metrics: Arc::new(MetricsRegistry::new()),
            hooks: ExecutionHooks::default(),
            cancel: cancel_pair(),
            config,
        }
    }

    pub fn with_registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_hooks(mut self, hooks: ExecutionHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_memory(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_event_sink(self, sink: Arc<dyn EventSink>) -> Self {
        self.bus.add_sink(sink);
        self
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        self.metrics.clone()
    }

    /// Cancel the in-flight run.
    pub fn cancel(&self) {
        self.cancel.0.cancel();
    }

    /// Select the checks participating in this run: explicit requests (plus
    /// their transitive dependencies) or every check passing the event and
    /// tag filters.
    fn select_requested(&self, input: &RunInput, options: &RunOptions) -> HashSet<String> {
        let eligible = |id: &str| {
            self.config.check(id).is_some_and(|check| {
                !check.is_disabled() && check.runs_on(&input.event)
            })
        };

        let mut requested: HashSet<String> = if options.requested_checks.is_empty() {
            self.config
                .checks
                .values()
                .filter(|check| {
                    eligible(&check.id) && self.config.tag_filter.matches(&check.tags)
                })
                .map(|check| check.id.clone())
                .collect()
        } else {
            options
                .requested_checks
                .iter()
                .filter(|id| eligible(id))
                .cloned()
                .collect()
        };

        // Pull in transitive dependencies; a requested check is useless
        // without them.
        let mut frontier: Vec<String> = requested.iter().cloned().collect();
        while let Some(id) = frontier.pop() {
            let Some(check) = self.config.check(&id) else { continue };
            for option in check.dependency_options() {
                if eligible(&option) && requested.insert(option.clone()) {
                    frontier.push(option);
                }
            }
        }
        requested
    }

    /// Execute a run to completion.
    pub async fn run(
        &self,
        input: RunInput,
        options: RunOptions,
    ) -> EngineResult<AnalysisResult> {
        self.config.validate()?;
        self.registry.validate_config(&self.config)?;

        let started = Instant::now();
        let session_id = Uuid::new_v4();
        let state = Arc::new(Mutex::new(RunState::new(session_id)));
        let run_input = Arc::new(input);
        let options = Arc::new(options);
        let mut requested = self.select_requested(&run_input, &options);

        info!(session = %session_id, checks = requested.len(), event = %run_input.event,
              "engine run starting");

        let routing = Arc::new(
            RoutingEngine::new(self.config.clone(), self.sandbox.clone())
                .with_event_bus(self.bus.clone())
                .with_metrics(self.metrics.clone()),
        );

        let mut dispatcher = LevelDispatcher {
            config: self.config.clone(),
            registry: self.registry.clone(),
            journal: self.journal.clone(),
            memory: self.memory.clone(),
            templates: self.templates.clone(),
            sandbox: self.sandbox.clone(),
            routing,
            bus: self.bus.clone(),
            metrics: self.metrics.clone(),
            policy: self.hooks.policy.clone(),
            llm: self.hooks.llm.clone(),
            mock_for_step: self.hooks.mock_for_step.clone(),
            run_input: run_input.clone(),
            options: options.clone(),
            cancel: self.cancel.1.clone(),
            state: state.clone(),
            requested: Arc::new(requested.clone()),
        };

        let mut queue: VecDeque<Vec<String>> = VecDeque::new();
        let mut phase = Phase::WavePlanning;
        let mut internal_error: Option<String> = None;

        while phase != Phase::Terminal {
            if self.cancel.1.is_cancelled() {
                warn!(session = %session_id, "run cancelled");
                break;
            }

            match phase {
                Phase::WavePlanning => {
                    let (wave, pending) = {
                        let mut state = state.lock().await;
                        state.wave += 1;
                        state.current_wave_completions.clear();
                        (state.wave, std::mem::take(&mut state.pending_forward))
                    };

                    if wave > MAX_WAVES {
                        internal_error = Some(format!("wave budget of {MAX_WAVES} exhausted"));
                        break;
                    }

                    // Forward runs re-enter the requested set and may re-run
                    // completed checks.
                    {
                        let mut state = state.lock().await;
                        for forward in pending {
                            requested.insert(forward.target.clone());
                            state.completed.remove(&forward.target);
                            state.skipped.remove(&forward.target);
                            if let Some(event) = forward.event {
                                state.event_overrides.insert(forward.target.clone(), event);
                            }
                        }
                    }
                    dispatcher.requested = Arc::new(requested.clone());

                    self.bus.telemetry(
                        session_id,
                        telemetry::ITERATION_START,
                        json!({"wave": wave}),
                    );

                    let plan = {
                        let state = state.lock().await;
                        let planner = WavePlanner::new(&self.config);
                        planner.plan(&requested, &state)
                    };
                    let plan = match plan {
                        Ok(plan) => plan,
                        Err(EngineError::Config(err)) => return Err(EngineError::Config(err)),
                        Err(other) => {
                            internal_error = Some(other.to_string());
                            break;
                        }
                    };

                    {
                        let mut state = state.lock().await;
                        for (id, reason) in &plan.skips {
                            state.skipped.insert(id.clone(), *reason);
                            state.stats_mut(id).record_skip(*reason, None);
                        }
                    }

                    if plan.levels.is_empty() {
                        let state = state.lock().await;
                        let drained = state.pending_forward.is_empty() && state.active.is_empty();
                        if drained {
                            phase = Phase::Terminal;
                            continue;
                        }
                    }

                    queue = plan.levels.into();
                    phase = Phase::LevelDispatch;
                }

                Phase::LevelDispatch => {
                    let Some(level) = queue.pop_front() else {
                        self.emit_state_snapshot(session_id).await;
                        phase = Phase::WavePlanning;
                        continue;
                    };

                    let wave = state.lock().await.wave;
                    self.bus.publish(
                        session_id,
                        EnginePayload::LevelReady { wave, checks: level.clone() },
                    );

                    let outcome = dispatcher.dispatch_level(level, &run_input.event).await;

                    self.bus
                        .publish(session_id, EnginePayload::LevelDepleted { wave });

                    if outcome.fail_fast {
                        queue.clear();
                        self.apply_fail_fast(&state, &requested).await;
                        phase = Phase::Terminal;
                    } else if outcome.wave_retry {
                        queue.clear();
                        self.bus
                            .publish(session_id, EnginePayload::WaveRetry { wave });
                        phase = Phase::WaveRetry;
                    }
                }

                Phase::WaveRetry => {
                    phase = Phase::WavePlanning;
                }

                Phase::Terminal => unreachable!("loop exits on Terminal"),
            }
        }

        self.emit_state_snapshot(session_id).await;
        self.assemble_result(session_id, started, &run_input, &state, internal_error)
            .await
    }

    async fn apply_fail_fast(&self, state: &Arc<Mutex<RunState>>, requested: &HashSet<String>) {
        let mut state = state.lock().await;
        state.fail_fast_triggered = true;
        for id in requested {
            if !state.completed.contains(id) && !state.is_skipped(id) {
                state.skipped.insert(id.clone(), SkipReason::FailFast);
                state.stats_mut(id).record_skip(SkipReason::FailFast, None);
            }
        }
    }

    async fn emit_state_snapshot(&self, session_id: Uuid) {
        self.bus.telemetry(
            session_id,
            telemetry::STATE_SNAPSHOT,
            self.metrics.snapshot(),
        );
    }

    async fn assemble_result(
        &self,
        session_id: Uuid,
        started: Instant,
        run_input: &RunInput,
        state: &Arc<Mutex<RunState>>,
        internal_error: Option<String>,
    ) -> EngineResult<AnalysisResult> {
        let state = state.lock().await;
        let snapshot = self.journal.begin_snapshot();
        let entries = self.journal.read_visible(session_id, snapshot, None).await;

        // Latest root-scope entry per check carries the final issue set;
        // superseded commits are shadowed by commit order.
        let mut latest_root: HashMap<String, (u64, ReviewSummary)> = HashMap::new();
        let mut output_history: HashMap<String, Vec<Value>> = HashMap::new();
        for entry in &entries {
            if let Some(output) = &entry.result.output {
                output_history
                    .entry(entry.check_id.clone())
                    .or_default()
                    .push(output.clone());
            }
            if entry.scope == Scope::root() {
                let slot = latest_root
                    .entry(entry.check_id.clone())
                    .or_insert((0, ReviewSummary::empty()));
                if entry.commit_id >= slot.0 {
                    *slot = (entry.commit_id, entry.result.clone());
                }
            }
        }

        let mut issues: Vec<Issue> = Vec::new();
        let mut ordered: Vec<(&String, &(u64, ReviewSummary))> = latest_root.iter().collect();
        ordered.sort_by_key(|(_, (commit, _))| *commit);
        for (_, (_, summary)) in ordered {
            issues.extend(summary.issues.clone());
        }

        if let Some(message) = internal_error {
            issues.push(Issue::new("system/error", message, Severity::Critical));
        }

        let mut checks_executed: Vec<String> = state
            .stats
            .iter()
            .filter(|(_, stats)| stats.total_runs > 0)
            .map(|(id, _)| id.clone())
            .collect();
        checks_executed.sort();

        debug!(session = %session_id, issues = issues.len(),
               executed = checks_executed.len(), "engine run finished");

        Ok(AnalysisResult {
            repository_info: run_input.repository.clone(),
            review_summary: ReviewSummary { issues, ..ReviewSummary::empty() },
            execution_time_ms: started.elapsed().as_millis() as u64,
            timestamp: chrono::Utc::now(),
            checks_executed,
            execution_statistics: Some(state.stats.clone()),
            output_history,
            debug: None,
        })
    }
}
