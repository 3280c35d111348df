//! Script provider: evaluates a sandbox expression and returns the result
//! as the check's output.

use async_trait::async_trait;

use crate::domain::errors::{ConfigError, ProviderError};
use crate::domain::models::check::CheckConfig;
use crate::domain::models::issue::ReviewSummary;
use crate::domain::models::run::RunInput;
use crate::domain::ports::provider::{require_key, DependencyResults, Provider, ProviderContext};

#[derive(Debug, Default)]
pub struct ScriptProvider;

impl ScriptProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Provider for ScriptProvider {
    fn name(&self) -> &'static str {
        "script"
    }

    fn description(&self) -> &'static str {
        "Evaluates a sandboxed expression over the check context"
    }

    fn validate_config(&self, check: &CheckConfig) -> Result<(), ConfigError> {
        if check.value_js.is_none() {
            return Err(ConfigError::ProviderValidation {
                check: check.id.clone(),
                reason: "script checks require 'value_js'".into(),
            });
        }
        Ok(())
    }

    async fn execute(
        &self,
        _run: &RunInput,
        check: &CheckConfig,
        _deps: &DependencyResults,
        ctx: &ProviderContext,
    ) -> Result<ReviewSummary, ProviderError> {
        let source = require_key(self.name(), "value_js", check.value_js.as_ref())?;
        let output = ctx.sandbox.eval(source, &ctx.template_data)?;
        Ok(ReviewSummary::empty().with_output(output))
    }

    fn supported_keys(&self) -> &'static [&'static str] {
        &["value_js"]
    }
}
