//! The provider contract.
//!
//! A provider executes one check kind. The registry resolves `type` strings
//! to implementations; the dispatcher hands each invocation a scope-bound
//! context view, a memory handle, and a point-in-time history snapshot.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::errors::{ConfigError, ProviderError};
use crate::domain::models::check::CheckConfig;
use crate::domain::models::issue::ReviewSummary;
use crate::domain::models::run::RunInput;
use crate::domain::models::scope::Scope;
use crate::services::context_view::ContextView;
use crate::services::event_bus::EventBus;
use crate::services::memory_service::MemoryStore;
use crate::services::sandbox::Sandbox;
use crate::services::template::TemplateService;

use super::cancel::CancelToken;
use super::llm::LlmClient;

/// Outputs of the checks a provider invocation depends on.
#[derive(Debug, Clone, Default)]
pub struct DependencyResults {
    /// Scope-appropriate outputs by check id.
    pub outputs: Map<String, Value>,
    /// Aggregate (root-scope) outputs by check id.
    pub outputs_raw: Map<String, Value>,
}

/// Everything a provider may touch during one invocation.
#[derive(Clone)]
pub struct ProviderContext {
    pub session_id: Uuid,
    pub scope: Scope,
    /// Trigger event this invocation runs under.
    pub event: String,
    /// Snapshot-bounded journal view for this scope.
    pub view: ContextView,
    pub memory: Arc<MemoryStore>,
    pub templates: Arc<TemplateService>,
    pub sandbox: Sandbox,
    pub cancel: CancelToken,
    pub llm: Option<Arc<dyn LlmClient>>,
    /// Engine-level model selection for ai checks.
    pub ai_model: Option<String>,
    /// Event bus for provider telemetry (`tool.call`, `ai.request`).
    pub events: Option<Arc<EventBus>>,
    /// Data object shared by template rendering and sandbox evaluation for
    /// this invocation.
    pub template_data: Value,
    /// Hook: canned results keyed by check id, bypassing real execution.
    pub mock_for_step: HashMap<String, Value>,
    /// Point-in-time output history, check id → outputs in commit order.
    pub history: HashMap<String, Vec<Value>>,
    pub working_dir: PathBuf,
    /// Engine-level env overlaid with the check's own `env`.
    pub env: HashMap<String, String>,
    pub debug: bool,
}

/// One check kind's implementation.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registry key, matching the `type` field in configuration.
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Static validation of a check using this provider.
    fn validate_config(&self, check: &CheckConfig) -> Result<(), ConfigError>;

    /// Execute one invocation.
    async fn execute(
        &self,
        run: &RunInput,
        check: &CheckConfig,
        deps: &DependencyResults,
        ctx: &ProviderContext,
    ) -> Result<ReviewSummary, ProviderError>;

    /// Configuration keys this provider reads.
    fn supported_keys(&self) -> &'static [&'static str];

    /// Whether the provider can run in this process (wired clients,
    /// available binaries).
    fn is_available(&self) -> bool {
        true
    }

    /// Human-readable requirements for `is_available` to become true.
    fn requirements(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Helper for providers that require a key to be present.
pub fn require_key<'a, T>(
    provider: &str,
    key: &str,
    value: Option<&'a T>,
) -> Result<&'a T, ProviderError> {
    value.ok_or_else(|| ProviderError::MissingKey {
        provider: provider.to_string(),
        key: key.to_string(),
    })
}
