//! Wave planner: computes topological levels of runnable checks.
//!
//! Each planning pass considers the requested checks that are not yet
//! completed, skipped, or active; removes the ones whose gating can never
//! be satisfied (recording skips, which cascade); and partitions the rest
//! into levels where every member's groups are satisfied by strictly lower
//! levels or by already-completed checks.

use std::collections::HashSet;

use crate::domain::errors::{ConfigError, EngineError, EngineResult};
use crate::domain::models::config::EngineConfig;
use crate::domain::models::run::{RunState, SkipReason};

use super::gating::{DependencyGate, GateDecision};

/// Result of one planning pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Plan {
    /// Topological levels, in dispatch order. Members are sorted for
    /// deterministic dispatch.
    pub levels: Vec<Vec<String>>,
    /// Checks found unsatisfiable during this pass, with reasons.
    pub skips: Vec<(String, SkipReason)>,
}

pub struct WavePlanner<'a> {
    config: &'a EngineConfig,
}

impl<'a> WavePlanner<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    pub fn plan(
        &self,
        requested: &HashSet<String>,
        state: &RunState,
    ) -> EngineResult<Plan> {
        let gate = DependencyGate::new(self.config);
        let mut plan = Plan::default();

        let mut pool: HashSet<String> = requested
            .iter()
            .filter(|id| {
                !state.completed.contains(*id)
                    && !state.is_skipped(id)
                    && !state.active.contains(*id)
            })
            .cloned()
            .collect();

        // Fixpoint: skipping a check can strand its dependents. The gate
        // needs a view of the state with the new skips applied, so track
        // them locally.
        let mut skipped_now: HashSet<String> = HashSet::new();
        loop {
            let mut newly_dead = Vec::new();
            for id in &pool {
                let Some(check) = self.config.check(id) else { continue };
                if let GateDecision::Skip(reason) =
                    self.gate_with_skips(&gate, check, state, requested, &skipped_now)
                {
                    newly_dead.push((id.clone(), reason));
                }
            }
            if newly_dead.is_empty() {
                break;
            }
            for (id, reason) in newly_dead {
                pool.remove(&id);
                skipped_now.insert(id.clone());
                plan.skips.push((id, reason));
            }
        }

        // Level assignment: a check enters a level once all its groups are
        // satisfied by completed checks or earlier levels.
        let mut leveled: HashSet<String> = HashSet::new();
        while !pool.is_empty() {
            let mut ready: Vec<String> = pool
                .iter()
                .filter(|id| {
                    self.config.check(id).is_some_and(|check| {
                        self.satisfied_for_planning(check, state, &leveled, &skipped_now)
                    })
                })
                .cloned()
                .collect();
            if ready.is_empty() {
                let stuck = pool.iter().next().cloned().unwrap_or_default();
                return Err(EngineError::Config(ConfigError::DependencyCycle(stuck)));
            }
            ready.sort();
            for id in &ready {
                pool.remove(id);
                leveled.insert(id.clone());
            }
            plan.levels.push(ready);
        }

        Ok(plan)
    }

    fn gate_with_skips(
        &self,
        gate: &DependencyGate<'_>,
        check: &crate::domain::models::check::CheckConfig,
        state: &RunState,
        requested: &HashSet<String>,
        skipped_now: &HashSet<String>,
    ) -> GateDecision {
        // An option skipped in this very pass is as dead as one skipped in
        // an earlier wave; narrow the requested set accordingly.
        let effective: HashSet<String> = requested
            .iter()
            .filter(|id| !skipped_now.contains(*id))
            .cloned()
            .collect();
        gate.evaluate(check, state, &effective)
    }

    fn satisfied_for_planning(
        &self,
        check: &crate::domain::models::check::CheckConfig,
        state: &RunState,
        leveled: &HashSet<String>,
        skipped_now: &HashSet<String>,
    ) -> bool {
        check.dependency_groups().iter().all(|group| {
            group.iter().any(|option| {
                if leveled.contains(option) {
                    return true;
                }
                if skipped_now.contains(option) {
                    return false;
                }
                if state.completed.contains(option) {
                    if !state.is_failed(option) {
                        return true;
                    }
                    return self
                        .config
                        .check(option)
                        .is_some_and(|c| c.continue_on_failure);
                }
                // Options outside the leveled/completed sets can't unblock
                // anything in this pass.
                false
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::check::CheckConfig;
    use uuid::Uuid;

    fn config(checks: &[(&str, &[&str])]) -> EngineConfig {
        let mut config = EngineConfig::default();
        for (id, deps) in checks {
            let mut check = CheckConfig::new(*id, "log");
            check.depends_on = deps.iter().map(|s| (*s).to_string()).collect();
            config.checks.insert((*id).to_string(), check);
        }
        config
    }

    fn all(config: &EngineConfig) -> HashSet<String> {
        config.checks.keys().cloned().collect()
    }

    #[test]
    fn linear_chain_levels() {
        let config = config(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        let planner = WavePlanner::new(&config);
        let state = RunState::new(Uuid::new_v4());
        let plan = planner.plan(&all(&config), &state).unwrap();
        assert_eq!(
            plan.levels,
            vec![vec!["a".to_string()], vec!["b".to_string()], vec!["c".to_string()]]
        );
        assert!(plan.skips.is_empty());
    }

    #[test]
    fn diamond_parallelizes_middle() {
        let config = config(&[("a", &[]), ("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])]);
        let planner = WavePlanner::new(&config);
        let state = RunState::new(Uuid::new_v4());
        let plan = planner.plan(&all(&config), &state).unwrap();
        assert_eq!(plan.levels.len(), 3);
        assert_eq!(plan.levels[1], vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn completed_checks_are_not_replanned() {
        let config = config(&[("a", &[]), ("b", &["a"])]);
        let planner = WavePlanner::new(&config);
        let mut state = RunState::new(Uuid::new_v4());
        state.completed.insert("a".into());
        let plan = planner.plan(&all(&config), &state).unwrap();
        assert_eq!(plan.levels, vec![vec!["b".to_string()]]);
    }

    #[test]
    fn hard_failed_dependency_cascades_skips() {
        let config = config(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        let planner = WavePlanner::new(&config);
        let mut state = RunState::new(Uuid::new_v4());
        state.completed.insert("a".into());
        state.failed.insert("a".into());
        let plan = planner.plan(&all(&config), &state).unwrap();
        assert!(plan.levels.is_empty());
        let skipped: Vec<&str> = plan.skips.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(skipped, vec!["b", "c"]);
        assert!(plan
            .skips
            .iter()
            .all(|(_, reason)| *reason == SkipReason::DependencyFailed));
    }

    #[test]
    fn or_group_keeps_dependent_alive() {
        let config = config(&[("a", &[]), ("b", &[]), ("c", &["a|b"])]);
        let planner = WavePlanner::new(&config);
        let mut state = RunState::new(Uuid::new_v4());
        state.completed.insert("a".into());
        state.failed.insert("a".into());
        let plan = planner.plan(&all(&config), &state).unwrap();
        // b runs first, then c (satisfied via b).
        assert_eq!(plan.levels, vec![vec!["b".to_string()], vec!["c".to_string()]]);
    }

    #[test]
    fn cycle_is_detected() {
        let config = config(&[("a", &["b"]), ("b", &["a"])]);
        let planner = WavePlanner::new(&config);
        let state = RunState::new(Uuid::new_v4());
        assert!(planner.plan(&all(&config), &state).is_err());
    }
}
