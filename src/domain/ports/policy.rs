//! Policy gate port.
//!
//! When a caller wires a policy engine into the execution context, the
//! dispatcher consults it before anything else; a denial skips the check
//! with reason `policy_denied`.

use async_trait::async_trait;

use crate::domain::models::check::CheckConfig;
use crate::domain::models::run::RunInput;

#[async_trait]
pub trait PolicyGate: Send + Sync {
    /// Whether the check may run for this input.
    async fn allows(&self, check: &CheckConfig, run: &RunInput) -> bool;
}

/// Deny-list gate, mostly for tests and simple embedding scenarios.
#[derive(Debug, Default)]
pub struct DenyListPolicy {
    denied: Vec<String>,
}

impl DenyListPolicy {
    pub fn deny(mut self, check_id: impl Into<String>) -> Self {
        self.denied.push(check_id.into());
        self
    }
}

#[async_trait]
impl PolicyGate for DenyListPolicy {
    async fn allows(&self, check: &CheckConfig, _run: &RunInput) -> bool {
        !self.denied.iter().any(|d| d == &check.id)
    }
}
