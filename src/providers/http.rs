//! HTTP/webhook provider: POSTs a JSON payload and parses a
//! `ReviewSummary`-shaped response.
//!
//! Registered under both `http` and `webhook`. Severity and category enum
//! values in the response are validated; anything else is a schema error.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::instrument;

use crate::domain::errors::{ConfigError, ProviderError};
use crate::domain::models::check::CheckConfig;
use crate::domain::models::issue::ReviewSummary;
use crate::domain::models::run::RunInput;
use crate::domain::ports::provider::{require_key, DependencyResults, Provider, ProviderContext};

use super::parse_wire_summary;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug)]
pub struct HttpProvider {
    client: reqwest::Client,
}

impl Default for HttpProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpProvider {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    fn description(&self) -> &'static str {
        "POSTs a JSON payload to an endpoint and parses the reply as findings"
    }

    fn validate_config(&self, check: &CheckConfig) -> Result<(), ConfigError> {
        let Some(url) = check.url.as_deref() else {
            return Err(ConfigError::ProviderValidation {
                check: check.id.clone(),
                reason: "http checks require 'url'".into(),
            });
        };
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::ProviderValidation {
                check: check.id.clone(),
                reason: format!("unsupported url scheme in '{url}'"),
            });
        }
        Ok(())
    }

    #[instrument(skip_all, fields(check = %check.id))]
    async fn execute(
        &self,
        run: &RunInput,
        check: &CheckConfig,
        deps: &DependencyResults,
        ctx: &ProviderContext,
    ) -> Result<ReviewSummary, ProviderError> {
        let url = require_key(self.name(), "url", check.url.as_ref())?;

        let payload = match &check.body {
            Some(body) => body.clone(),
            None => json!({
                "check": check.id,
                "event": ctx.event,
                "scope": ctx.scope.to_string(),
                "title": run.title,
                "branch": run.head_branch,
                "baseBranch": run.base_branch,
                "outputs": Value::Object(deps.outputs.clone()),
            }),
        };

        let timeout_secs = check.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);
        let mut request = self
            .client
            .post(url)
            .timeout(Duration::from_secs(timeout_secs))
            .json(&payload);
        for (name, value) in &check.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let send = async {
            let response = request.send().await.map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(timeout_secs)
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;
            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| ProviderError::Network(e.to_string()))?;
            if !status.is_success() {
                return Err(ProviderError::Http { status: status.as_u16(), body });
            }
            Ok(body)
        };

        let body = tokio::select! {
            result = send => result?,
            () = ctx.cancel.cancelled() => return Err(ProviderError::Cancelled),
        };

        if body.trim().is_empty() {
            return Ok(ReviewSummary::empty());
        }
        let value: Value = serde_json::from_str(&body)
            .map_err(|e| ProviderError::JsonParse(e.to_string()))?;
        parse_wire_summary(&value, true)
    }

    fn supported_keys(&self) -> &'static [&'static str] {
        &["url", "body", "headers", "timeout"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::scope::Scope;
    use crate::domain::ports::cancel::CancelToken;
    use crate::services::context_view::ContextView;
    use crate::services::journal::ExecutionJournal;
    use crate::services::memory_service::MemoryStore;
    use crate::services::sandbox::Sandbox;
    use crate::services::template::TemplateService;
    use std::collections::HashMap;
    use std::sync::Arc;
    use uuid::Uuid;

    fn context() -> ProviderContext {
        let journal = ExecutionJournal::new();
        let session = Uuid::new_v4();
        ProviderContext {
            session_id: session,
            scope: Scope::root(),
            event: "manual".into(),
            view: ContextView::new(journal, session, 0, Scope::root(), None),
            memory: MemoryStore::in_memory(),
            templates: Arc::new(TemplateService::new(".")),
            sandbox: Sandbox::new(),
            cancel: CancelToken::never(),
            llm: None,
            ai_model: None,
            events: None,
            template_data: json!({}),
            mock_for_step: HashMap::new(),
            history: HashMap::new(),
            working_dir: std::env::temp_dir(),
            env: HashMap::new(),
            debug: false,
        }
    }

    fn check(url: &str) -> CheckConfig {
        let mut check = CheckConfig::new("hook", "http");
        check.url = Some(url.to_string());
        check
    }

    #[tokio::test]
    async fn posts_and_parses_summary() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/review")
            .with_status(200)
            .with_body(r#"{"issues": [{"ruleId": "ext", "message": "found", "severity": "error", "category": "security"}]}"#)
            .create_async()
            .await;

        let provider = HttpProvider::new();
        let summary = provider
            .execute(
                &RunInput::manual(),
                &check(&format!("{}/review", server.url())),
                &Default::default(),
                &context(),
            )
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(summary.issues.len(), 1);
        assert_eq!(summary.issues[0].rule_id, "ext");
    }

    #[tokio::test]
    async fn non_2xx_is_http_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/review")
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let provider = HttpProvider::new();
        let err = provider
            .execute(
                &RunInput::manual(),
                &check(&format!("{}/review", server.url())),
                &Default::default(),
                &context(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Http { status: 503, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn invalid_severity_is_schema_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/review")
            .with_status(200)
            .with_body(r#"{"issues": [{"severity": "whatever"}]}"#)
            .create_async()
            .await;

        let provider = HttpProvider::new();
        let err = provider
            .execute(
                &RunInput::manual(),
                &check(&format!("{}/review", server.url())),
                &Default::default(),
                &context(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::SchemaValidation(_)));
    }

    #[test]
    fn validate_rejects_bad_scheme() {
        let provider = HttpProvider::new();
        assert!(provider.validate_config(&check("ftp://host/x")).is_err());
        assert!(provider.validate_config(&check("https://host/x")).is_ok());
    }
}
