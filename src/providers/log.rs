//! Log provider: renders the message template and emits it as a log line.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::domain::errors::{ConfigError, ProviderError};
use crate::domain::models::check::CheckConfig;
use crate::domain::models::issue::ReviewSummary;
use crate::domain::models::run::RunInput;
use crate::domain::ports::provider::{require_key, DependencyResults, Provider, ProviderContext};

#[derive(Debug, Default)]
pub struct LogProvider;

impl LogProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Provider for LogProvider {
    fn name(&self) -> &'static str {
        "log"
    }

    fn description(&self) -> &'static str {
        "Renders a message template and writes it to the engine log"
    }

    fn validate_config(&self, check: &CheckConfig) -> Result<(), ConfigError> {
        if check.message.is_none() {
            return Err(ConfigError::ProviderValidation {
                check: check.id.clone(),
                reason: "log checks require 'message'".into(),
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
        let message = require_key(self.name(), "message", check.message.as_ref())?;
        let rendered = ctx
            .templates
            .render_str(message, &ctx.template_data)
            .unwrap_or_else(|_| message.clone());

        match check.level.as_deref().unwrap_or("info") {
            "debug" => debug!(target: "vigil::check", check = %check.id, "{rendered}"),
            "warn" | "warning" => warn!(target: "vigil::check", check = %check.id, "{rendered}"),
            "error" => error!(target: "vigil::check", check = %check.id, "{rendered}"),
            _ => info!(target: "vigil::check", check = %check.id, "{rendered}"),
        }

        let mut summary = ReviewSummary::empty().with_output(Value::String(rendered.clone()));
        summary.content = Some(rendered);
        Ok(summary)
    }

    fn supported_keys(&self) -> &'static [&'static str] {
        &["message", "level"]
    }
}
