//! Dependency gating.
//!
//! Each `depends_on` token is an OR group. A group is satisfied when at
//! least one option has a recorded result, was not skipped, and either
//! succeeded or failed with `continue_on_failure`. A check is runnable only
//! when every group is satisfied.

use std::collections::HashSet;

use crate::domain::models::check::CheckConfig;
use crate::domain::models::config::EngineConfig;
use crate::domain::models::run::{RunState, SkipReason};

/// Outcome of gating one check against the current run state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// All groups satisfied; the check may run now.
    Runnable,
    /// Some group is waiting on a check that can still run.
    NotReady,
    /// Some group can never be satisfied.
    Skip(SkipReason),
}

/// Stateless gate over the configuration.
pub struct DependencyGate<'a> {
    config: &'a EngineConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OptionState {
    Satisfies,
    Pending,
    Dead,
}

impl<'a> DependencyGate<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    fn option_state(
        &self,
        option: &str,
        state: &RunState,
        requested: &HashSet<String>,
    ) -> OptionState {
        if state.is_skipped(option) {
            return OptionState::Dead;
        }
        if state.completed.contains(option) {
            if !state.is_failed(option) {
                return OptionState::Satisfies;
            }
            let continue_on_failure = self
                .config
                .check(option)
                .is_some_and(|c| c.continue_on_failure);
            return if continue_on_failure {
                OptionState::Satisfies
            } else {
                OptionState::Dead
            };
        }
        // Not run yet: it can still satisfy the group only if it is part of
        // this run.
        if requested.contains(option) || state.active.contains(option) {
            OptionState::Pending
        } else {
            OptionState::Dead
        }
    }

    /// Gate a check. `requested` is the set of checks participating in the
    /// run (used to decide whether an unfinished option can still run).
    pub fn evaluate(
        &self,
        check: &CheckConfig,
        state: &RunState,
        requested: &HashSet<String>,
    ) -> GateDecision {
        let mut waiting = false;
        for group in check.dependency_groups() {
            let states: Vec<OptionState> = group
                .iter()
                .map(|option| self.option_state(option, state, requested))
                .collect();
            if states.contains(&OptionState::Satisfies) {
                continue;
            }
            if states.contains(&OptionState::Pending) {
                waiting = true;
                continue;
            }
            // No option can ever satisfy this group.
            return GateDecision::Skip(SkipReason::DependencyFailed);
        }
        if waiting {
            GateDecision::NotReady
        } else {
            GateDecision::Runnable
        }
    }
}
