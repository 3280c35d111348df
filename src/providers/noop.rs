//! Noop provider: produces no side effects.
//!
//! Registered as both `noop` and `workflow`; used for grouping and
//! aggregation nodes in the check graph.

use async_trait::async_trait;

use crate::domain::errors::{ConfigError, ProviderError};
use crate::domain::models::check::CheckConfig;
use crate::domain::models::issue::ReviewSummary;
use crate::domain::models::run::RunInput;
use crate::domain::ports::provider::{DependencyResults, Provider, ProviderContext};

#[derive(Debug, Default)]
pub struct NoopProvider;

impl NoopProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Provider for NoopProvider {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn description(&self) -> &'static str {
        "Grouping node with no side effects"
    }

    fn validate_config(&self, _check: &CheckConfig) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn execute(
        &self,
        _run: &RunInput,
        _check: &CheckConfig,
        _deps: &DependencyResults,
        _ctx: &ProviderContext,
    ) -> Result<ReviewSummary, ProviderError> {
        Ok(ReviewSummary::empty())
    }

    fn supported_keys(&self) -> &'static [&'static str] {
        &[]
    }
}
