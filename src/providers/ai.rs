//! AI provider: renders the prompt, calls the wired LLM client, and parses
//! the response into issues and/or structured output.
//!
//! The engine never talks to a model API itself; callers wire an
//! [`LlmClient`](crate::domain::ports::llm::LlmClient) through the
//! execution context. `mock_for_step` entries short-circuit execution with
//! a canned result.

use async_trait::async_trait;
use serde_json::Value;
use tracing::instrument;

use crate::domain::errors::{ConfigError, ProviderError};
use crate::domain::models::check::{CheckConfig, SchemaRef};
use crate::domain::models::event::telemetry;
use crate::domain::models::issue::ReviewSummary;
use crate::domain::models::run::RunInput;
use crate::domain::ports::llm::LlmRequest;
use crate::domain::ports::provider::{require_key, DependencyResults, Provider, ProviderContext};

use super::parse_wire_summary;

#[derive(Debug, Default)]
pub struct AiProvider;

impl AiProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Provider for AiProvider {
    fn name(&self) -> &'static str {
        "ai"
    }

    fn description(&self) -> &'static str {
        "Sends a rendered prompt to the configured model and parses findings"
    }

    fn validate_config(&self, check: &CheckConfig) -> Result<(), ConfigError> {
        if check.prompt.is_none() {
            return Err(ConfigError::ProviderValidation {
                check: check.id.clone(),
                reason: "ai checks require 'prompt'".into(),
            });
        }
        Ok(())
    }

    #[instrument(skip_all, fields(check = %check.id))]
    async fn execute(
        &self,
        _run: &RunInput,
        check: &CheckConfig,
        _deps: &DependencyResults,
        ctx: &ProviderContext,
    ) -> Result<ReviewSummary, ProviderError> {
        // Hook: canned result for this step bypasses the model entirely.
        if let Some(mock) = ctx.mock_for_step.get(&check.id) {
            return Ok(mock_summary(mock));
        }

        let prompt = require_key(self.name(), "prompt", check.prompt.as_ref())?;
        let rendered = ctx
            .templates
            .render_str(prompt, &ctx.template_data)
            .unwrap_or_else(|_| prompt.clone());

        let schema = match &check.schema {
            Some(SchemaRef::Inline(definition)) => Some(definition.clone()),
            _ => None,
        };

        let client = ctx.llm.as_ref().ok_or_else(|| ProviderError::Unavailable {
            provider: "ai".into(),
            reason: "no LLM client wired into the execution context".into(),
        })?;

        if let Some(bus) = &ctx.events {
            bus.telemetry(
                ctx.session_id,
                telemetry::AI_REQUEST,
                serde_json::json!({
                    "check": check.id,
                    "scope": ctx.scope.to_string(),
                    "prompt_chars": rendered.len(),
                }),
            );
        }

        let request = LlmRequest {
            model: ctx.ai_model.clone(),
            prompt: rendered,
            schema: schema.clone(),
        };
        let response = tokio::select! {
            result = client.complete(request) => result?,
            () = ctx.cancel.cancelled() => return Err(ProviderError::Cancelled),
        };

        parse_response(&response.text, schema.is_some())
    }

    fn supported_keys(&self) -> &'static [&'static str] {
        &["prompt", "appendPrompt", "schema", "timeout"]
    }

    fn requirements(&self) -> Vec<String> {
        vec!["an LlmClient wired into the execution context".into()]
    }
}

/// Interpret the canned `mock_for_step` value: a summary-shaped object is
/// parsed as one, anything else becomes the output.
fn mock_summary(mock: &Value) -> ReviewSummary {
    if mock.get("issues").is_some() || mock.get("output").is_some() {
        if let Ok(summary) = parse_wire_summary(mock, false) {
            return summary;
        }
    }
    ReviewSummary::empty().with_output(mock.clone())
}

/// Parse model text: summary-shaped JSON becomes issues/output, other JSON
/// becomes structured output, and plain text is preserved as a string. When
/// a schema was declared the response must parse as JSON.
fn parse_response(text: &str, schema_required: bool) -> Result<ReviewSummary, ProviderError> {
    let trimmed = strip_code_fence(text.trim());
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => {
            if value.get("issues").is_some() {
                parse_wire_summary(&value, false)
            } else {
                Ok(ReviewSummary::empty().with_output(value))
            }
        }
        Err(err) => {
            if schema_required {
                return Err(ProviderError::SchemaValidation(format!(
                    "structured output required but response is not JSON: {err}"
                )));
            }
            Ok(ReviewSummary::empty().with_output(Value::String(trimmed.to_string())))
        }
    }
}

/// Models wrap JSON in markdown fences often enough to handle it here.
fn strip_code_fence(text: &str) -> &str {
    let text = text.trim();
    if let Some(rest) = text.strip_prefix("```json") {
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim();
        }
    }
    if let Some(rest) = text.strip_prefix("```") {
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim();
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_summary_shaped_response() {
        let text = r#"{"issues": [{"ruleId": "style", "message": "m", "severity": "warning"}]}"#;
        let summary = parse_response(text, false).unwrap();
        assert_eq!(summary.issues.len(), 1);
    }

    #[test]
    fn parses_structured_output() {
        let summary = parse_response("{\"score\": 9}", true).unwrap();
        assert_eq!(summary.output, Some(json!({"score": 9})));
    }

    #[test]
    fn plain_text_allowed_without_schema() {
        let summary = parse_response("all clear", false).unwrap();
        assert_eq!(summary.output, Some(json!("all clear")));
    }

    #[test]
    fn schema_requires_json() {
        assert!(matches!(
            parse_response("not json", true),
            Err(ProviderError::SchemaValidation(_))
        ));
    }

    #[test]
    fn strips_markdown_fences() {
        let fenced = "```json\n{\"score\": 1}\n```";
        let summary = parse_response(fenced, true).unwrap();
        assert_eq!(summary.output, Some(json!({"score": 1})));
    }

    #[test]
    fn mock_values_short_circuit() {
        let shaped = json!({"issues": [], "output": [1, 2]});
        assert_eq!(mock_summary(&shaped).output, Some(json!([1, 2])));

        let raw = json!(["a", "b"]);
        assert_eq!(mock_summary(&raw).output, Some(json!(["a", "b"])));
    }
}
