//! Routing engine: post-execution decisions for a completed check.
//!
//! Evaluates `fail_if` and `failure_conditions`, then walks the action
//! blocks (`on_success`/`on_fail` first, `on_finish` always): `run` names
//! become forward runs, `goto`/`goto_js` reroute execution under a global
//! loop budget. Forward requests are deduplicated per wave by the
//! `(origin, target, wave)` guard on the run state.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::models::check::{CheckConfig, Criticality, RoutingBlock};
use crate::domain::models::config::EngineConfig;
use crate::domain::models::event::{telemetry, EnginePayload};
use crate::domain::models::issue::{Issue, ReviewSummary, Severity};
use crate::domain::models::run::RunState;
use crate::domain::models::scope::Scope;
use crate::services::event_bus::EventBus;
use crate::services::sandbox::Sandbox;
use crate::services::stats::MetricsRegistry;

/// What routing decided for one completed check.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoutingOutcome {
    /// Success after `fail_if` and failure conditions were applied.
    pub success: bool,
    /// A new wave should be planned (forward runs or goto fired).
    pub wave_retry: bool,
    /// `fail_if` (or a fatal failure condition) flipped this check to
    /// failed.
    pub failed_by_condition: bool,
    /// The loop budget was exhausted on this path.
    pub budget_exhausted: bool,
}

pub struct RoutingEngine {
    config: Arc<EngineConfig>,
    sandbox: Sandbox,
    bus: Option<Arc<EventBus>>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl RoutingEngine {
    pub fn new(config: Arc<EngineConfig>, sandbox: Sandbox) -> Self {
        Self { config, sandbox, bus: None, metrics: None }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Apply routing for a completed check. `eval_context` is the broader
    /// expression context (full visible journal outputs); `result` is
    /// mutated in place and the caller commits it afterwards.
    pub fn process(
        &self,
        check: &CheckConfig,
        scope: &Scope,
        provider_success: bool,
        eval_context: &Value,
        result: &mut ReviewSummary,
        state: &mut RunState,
    ) -> RoutingOutcome {
        let mut outcome = RoutingOutcome {
            success: provider_success,
            ..RoutingOutcome::default()
        };

        self.apply_fail_if(check, scope, eval_context, result, state, &mut outcome);
        self.apply_failure_conditions(check, eval_context, result, &mut outcome);

        // Primary block by outcome, then on_finish regardless.
        let primary = if outcome.success { &check.on_success } else { &check.on_fail };
        let blocks: Vec<&RoutingBlock> = [primary.as_ref(), check.on_finish.as_ref()]
            .into_iter()
            .flatten()
            .collect();

        for block in blocks {
            if self.apply_block(check, block, eval_context, result, state, &mut outcome) {
                break;
            }
        }

        // Logical-failure retry: suppressed for external criticality.
        if !outcome.success && check.criticality != Criticality::External {
            if let Some(retry) = check.retry_config() {
                let attempts = state.logical_retries.entry(check.id.clone()).or_insert(0);
                if *attempts < retry.max {
                    *attempts += 1;
                    if state.request_forward(&check.id, &check.id, None) {
                        self.emit_forward(state, &check.id, &check.id);
                        outcome.wave_retry = true;
                    }
                }
            }
        }

        outcome
    }

    fn apply_fail_if(
        &self,
        check: &CheckConfig,
        scope: &Scope,
        eval_context: &Value,
        result: &mut ReviewSummary,
        state: &RunState,
        outcome: &mut RoutingOutcome,
    ) {
        let Some(expression) = check.fail_if.as_ref().or(self.config.fail_if.as_ref()) else {
            return;
        };

        // Per-item execution already applied fail_if to each iteration; an
        // aggregate that carries those issues is not re-evaluated.
        if result
            .issues
            .iter()
            .any(|i| i.rule_id.ends_with(&format!("{}_fail_if", check.id)))
        {
            outcome.success = false;
            outcome.failed_by_condition = true;
            return;
        }

        let triggered = self.sandbox.eval_fail_if(expression, eval_context);
        if let Some(bus) = &self.bus {
            bus.telemetry(
                state.session_id,
                telemetry::FAIL_IF_EVALUATED,
                serde_json::json!({
                    "check": check.id,
                    "scope": scope.to_string(),
                    "expression": expression,
                    "triggered": triggered,
                }),
            );
        }
        if !triggered {
            return;
        }

        result.issues.push(fail_if_issue(&check.id, expression));
        outcome.success = false;
        outcome.failed_by_condition = true;

        if let Some(metrics) = &self.metrics {
            metrics.record_fail_if(&scope.to_string());
        }
        if let Some(bus) = &self.bus {
            bus.telemetry(
                state.session_id,
                telemetry::FAIL_IF_TRIGGERED,
                serde_json::json!({
                    "check": check.id,
                    "scope": scope.to_string(),
                    "expression": expression,
                }),
            );
        }
    }

    fn apply_failure_conditions(
        &self,
        check: &CheckConfig,
        eval_context: &Value,
        result: &mut ReviewSummary,
        outcome: &mut RoutingOutcome,
    ) {
        let conditions = check
            .failure_conditions
            .iter()
            .chain(self.config.failure_conditions.iter());
        for condition in conditions {
            if !self.sandbox.eval_fail_if(&condition.condition, eval_context) {
                continue;
            }
            let message = condition
                .message
                .clone()
                .unwrap_or_else(|| format!("failure condition met: {}", condition.condition));
            result.issues.push(Issue::new(
                format!("{}/{}", check.id, condition.name),
                message,
                condition.severity,
            ));
            if condition.severity.is_fatal() {
                outcome.success = false;
                outcome.failed_by_condition = true;
            }
        }
    }

    /// Apply one action block. Returns true when routing on this path must
    /// stop (loop budget breach).
    fn apply_block(
        &self,
        check: &CheckConfig,
        block: &RoutingBlock,
        eval_context: &Value,
        result: &mut ReviewSummary,
        state: &mut RunState,
        outcome: &mut RoutingOutcome,
    ) -> bool {
        for target in &block.run {
            if !self.config.checks.contains_key(target) {
                warn!(check = %check.id, target = %target, "run target not declared, ignoring");
                continue;
            }
            if state.request_forward(&check.id, target, None) {
                self.emit_forward(state, &check.id, target);
                outcome.wave_retry = true;
            }
        }

        let Some(target) = self.goto_target(check, block, eval_context) else {
            return false;
        };

        if !self.config.checks.contains_key(&target) {
            result.issues.push(Issue::new(
                format!("{}/routing/invalid_goto", check.id),
                format!("goto target '{target}' is not a declared check"),
                Severity::Error,
            ));
            return false;
        }

        state.routing_loop_count += 1;
        if state.routing_loop_count > self.config.routing.max_loops {
            result.issues.push(Issue::new(
                format!("{}/routing/loop_budget_exceeded", check.id),
                format!(
                    "routing loop budget of {} exceeded; not rerouting to '{target}'",
                    self.config.routing.max_loops
                ),
                Severity::Error,
            ));
            outcome.budget_exhausted = true;
            return true;
        }

        if state.request_forward(&check.id, &target, block.goto_event.clone()) {
            self.emit_forward(state, &check.id, &target);
            outcome.wave_retry = true;
        }
        false
    }

    fn goto_target(
        &self,
        check: &CheckConfig,
        block: &RoutingBlock,
        eval_context: &Value,
    ) -> Option<String> {
        if let Some(target) = &block.goto {
            return Some(target.clone());
        }
        let source = block.goto_js.as_ref()?;
        match self.sandbox.eval(source, eval_context) {
            Ok(Value::String(target)) if !target.is_empty() => Some(target),
            Ok(Value::Null) => None,
            Ok(other) => {
                debug!(check = %check.id, value = %other, "goto_js returned non-string, ignoring");
                None
            }
            Err(err) => {
                debug!(check = %check.id, error = %err, "goto_js evaluation failed, ignoring");
                None
            }
        }
    }

    fn emit_forward(&self, state: &RunState, origin: &str, target: &str) {
        if let Some(bus) = &self.bus {
            bus.publish(
                state.session_id,
                EnginePayload::ForwardRunRequested {
                    origin: origin.to_string(),
                    target: target.to_string(),
                    wave: state.wave,
                },
            );
        }
    }
}

/// The enriched issue appended when `fail_if` triggers. Rule ids qualify as
/// `<checkId>/<innerRuleId>`; the inner id `<checkId>_fail_if` keeps the
/// fatal-rule suffix detectable on both forms.
pub fn fail_if_issue(check_id: &str, expression: &str) -> Issue {
    Issue::new(
        format!("{check_id}/{check_id}_fail_if"),
        format!("fail_if condition met: {expression}"),
        Severity::Error,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn engine(config: EngineConfig) -> RoutingEngine {
        RoutingEngine::new(Arc::new(config), Sandbox::new())
    }

    fn base_config(checks: &[&str]) -> EngineConfig {
        let mut config = EngineConfig::default();
        for id in checks {
            config.checks.insert((*id).to_string(), CheckConfig::new(*id, "log"));
        }
        config
    }

    #[test]
    fn fail_if_appends_issue_and_fails() {
        let mut config = base_config(&["a"]);
        config.checks.get_mut("a").unwrap().fail_if = Some("true".into());
        let check = config.checks["a"].clone();
        let engine = engine(config);
        let mut state = RunState::new(Uuid::new_v4());
        let mut result = ReviewSummary::empty();

        let outcome = engine.process(
            &check,
            &Scope::root(),
            true,
            &json!({}),
            &mut result,
            &mut state,
        );

        assert!(!outcome.success);
        assert!(outcome.failed_by_condition);
        assert_eq!(result.issues.len(), 1);
        assert_eq!(result.issues[0].rule_id, "a/a_fail_if");
        assert_eq!(result.issues[0].severity, Severity::Error);
        assert!(result.has_fatal_issues());
    }

    #[test]
    fn fail_if_errors_evaluate_false() {
        let mut config = base_config(&["a"]);
        config.checks.get_mut("a").unwrap().fail_if = Some("totally_undefined()".into());
        let check = config.checks["a"].clone();
        let engine = engine(config);
        let mut state = RunState::new(Uuid::new_v4());
        let mut result = ReviewSummary::empty();

        let outcome = engine.process(
            &check,
            &Scope::root(),
            true,
            &json!({}),
            &mut result,
            &mut state,
        );
        assert!(outcome.success);
        assert!(result.issues.is_empty());
    }

    #[test]
    fn check_level_fail_if_overrides_global() {
        let mut config = base_config(&["a"]);
        config.fail_if = Some("true".into());
        config.checks.get_mut("a").unwrap().fail_if = Some("false".into());
        let check = config.checks["a"].clone();
        let engine = engine(config);
        let mut state = RunState::new(Uuid::new_v4());
        let mut result = ReviewSummary::empty();

        let outcome = engine.process(
            &check,
            &Scope::root(),
            true,
            &json!({}),
            &mut result,
            &mut state,
        );
        assert!(outcome.success);
    }

    #[test]
    fn on_fail_runs_only_on_failure() {
        let mut config = base_config(&["a", "cleanup", "celebrate"]);
        {
            let a = config.checks.get_mut("a").unwrap();
            a.on_fail = Some(RoutingBlock { run: vec!["cleanup".into()], ..Default::default() });
            a.on_success =
                Some(RoutingBlock { run: vec!["celebrate".into()], ..Default::default() });
        }
        let check = config.checks["a"].clone();
        let engine = engine(config);
        let mut state = RunState::new(Uuid::new_v4());
        let mut result = ReviewSummary::empty();

        let outcome = engine.process(
            &check,
            &Scope::root(),
            false,
            &json!({}),
            &mut result,
            &mut state,
        );
        assert!(outcome.wave_retry);
        assert_eq!(state.pending_forward.len(), 1);
        assert_eq!(state.pending_forward[0].target, "cleanup");
    }

    #[test]
    fn goto_js_reroutes_until_budget() {
        let mut config = base_config(&["a"]);
        config.routing.max_loops = 3;
        config.checks.get_mut("a").unwrap().on_finish = Some(RoutingBlock {
            goto_js: Some("return 'a'".into()),
            ..Default::default()
        });
        let check = config.checks["a"].clone();
        let engine = engine(config);
        let mut state = RunState::new(Uuid::new_v4());

        // Three reroutes pass, the fourth breaches the budget.
        for wave in 1..=3u64 {
            state.wave = wave;
            let mut result = ReviewSummary::empty();
            let outcome = engine.process(
                &check,
                &Scope::root(),
                true,
                &json!({}),
                &mut result,
                &mut state,
            );
            assert!(outcome.wave_retry, "wave {wave} should reroute");
            assert!(!outcome.budget_exhausted);
        }

        state.wave = 4;
        let mut result = ReviewSummary::empty();
        let outcome = engine.process(
            &check,
            &Scope::root(),
            true,
            &json!({}),
            &mut result,
            &mut state,
        );
        assert!(outcome.budget_exhausted);
        assert!(!outcome.wave_retry);
        assert_eq!(result.issues.len(), 1);
        assert_eq!(result.issues[0].rule_id, "a/routing/loop_budget_exceeded");
    }

    #[test]
    fn invalid_goto_target_is_reported_not_fatal() {
        let mut config = base_config(&["a"]);
        config.checks.get_mut("a").unwrap().on_success = Some(RoutingBlock {
            goto: Some("ghost".into()),
            ..Default::default()
        });
        let check = config.checks["a"].clone();
        let engine = engine(config);
        let mut state = RunState::new(Uuid::new_v4());
        let mut result = ReviewSummary::empty();

        let outcome = engine.process(
            &check,
            &Scope::root(),
            true,
            &json!({}),
            &mut result,
            &mut state,
        );
        assert!(!outcome.wave_retry);
        assert_eq!(result.issues[0].rule_id, "a/routing/invalid_goto");
        // An invalid goto does not flip the success flag.
        assert!(outcome.success);
    }

    #[test]
    fn forward_guard_prevents_duplicates_within_wave() {
        let mut config = base_config(&["a", "b"]);
        config.checks.get_mut("a").unwrap().on_finish = Some(RoutingBlock {
            run: vec!["b".into(), "b".into()],
            ..Default::default()
        });
        let check = config.checks["a"].clone();
        let engine = engine(config);
        let mut state = RunState::new(Uuid::new_v4());
        let mut result = ReviewSummary::empty();

        engine.process(&check, &Scope::root(), true, &json!({}), &mut result, &mut state);
        assert_eq!(state.pending_forward.len(), 1);
    }

    #[test]
    fn logical_retry_suppressed_for_external_criticality() {
        let mut config = base_config(&["a"]);
        {
            let a = config.checks.get_mut("a").unwrap();
            a.fail_if = Some("true".into());
            a.criticality = Criticality::External;
            a.on_fail = Some(RoutingBlock {
                retry: Some(crate::domain::models::check::RetryConfig { max: 2, backoff_ms: 1 }),
                ..Default::default()
            });
        }
        let check = config.checks["a"].clone();
        let engine = engine(config);
        let mut state = RunState::new(Uuid::new_v4());
        let mut result = ReviewSummary::empty();

        let outcome = engine.process(
            &check,
            &Scope::root(),
            true,
            &json!({}),
            &mut result,
            &mut state,
        );
        assert!(!outcome.success);
        assert!(state.pending_forward.is_empty());
        assert!(!outcome.wave_retry);
    }

    #[test]
    fn logical_retry_fires_for_internal_criticality() {
        let mut config = base_config(&["a"]);
        {
            let a = config.checks.get_mut("a").unwrap();
            a.fail_if = Some("true".into());
            a.on_fail = Some(RoutingBlock {
                retry: Some(crate::domain::models::check::RetryConfig { max: 1, backoff_ms: 1 }),
                ..Default::default()
            });
        }
        let check = config.checks["a"].clone();
        let engine = engine(config);
        let mut state = RunState::new(Uuid::new_v4());

        let mut result = ReviewSummary::empty();
        let outcome = engine.process(
            &check,
            &Scope::root(),
            true,
            &json!({}),
            &mut result,
            &mut state,
        );
        assert!(outcome.wave_retry);
        assert_eq!(state.pending_forward[0].target, "a");

        // Budget of one: the second failure does not reroute again.
        state.wave += 1;
        let mut result = ReviewSummary::empty();
        let outcome = engine.process(
            &check,
            &Scope::root(),
            true,
            &json!({}),
            &mut result,
            &mut state,
        );
        assert!(!outcome.wave_retry);
    }

    #[test]
    fn failure_conditions_append_issues() {
        let mut config = base_config(&["a"]);
        config.checks.get_mut("a").unwrap().failure_conditions =
            vec![crate::domain::models::check::FailureCondition {
                name: "too_many".into(),
                condition: "output.count > 2".into(),
                severity: Severity::Error,
                message: Some("count too high".into()),
            }];
        let check = config.checks["a"].clone();
        let engine = engine(config);
        let mut state = RunState::new(Uuid::new_v4());
        let mut result = ReviewSummary::empty();

        let outcome = engine.process(
            &check,
            &Scope::root(),
            true,
            &json!({"output": {"count": 5}}),
            &mut result,
            &mut state,
        );
        assert!(!outcome.success);
        assert_eq!(result.issues[0].rule_id, "a/too_many");
        assert_eq!(result.issues[0].message, "count too high");
    }
}
