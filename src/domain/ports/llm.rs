//! LLM client port for the ai provider.
//!
//! The engine never talks to a model API directly; callers wire an
//! implementation through the execution context. `StaticLlmClient` serves
//! tests and dry runs with canned responses.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::errors::ProviderError;

/// A request to the model backing an ai check.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: Option<String>,
    pub prompt: String,
    /// Declared output schema, when the check requires structured output.
    pub schema: Option<Value>,
}

/// Raw model response text; the ai provider parses and validates it.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, ProviderError>;
}

/// Canned-response client: the first matcher contained in the prompt wins,
/// otherwise the default response is returned.
#[derive(Debug, Default)]
pub struct StaticLlmClient {
    responses: Vec<(String, String)>,
    default: String,
}

impl StaticLlmClient {
    pub fn new(default: impl Into<String>) -> Self {
        Self { responses: Vec::new(), default: default.into() }
    }

    pub fn with_response(mut self, matcher: impl Into<String>, response: impl Into<String>) -> Self {
        self.responses.push((matcher.into(), response.into()));
        self
    }
}

#[async_trait]
impl LlmClient for StaticLlmClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, ProviderError> {
        for (matcher, response) in &self.responses {
            if request.prompt.contains(matcher) {
                return Ok(LlmResponse { text: response.clone() });
            }
        }
        Ok(LlmResponse { text: self.default.clone() })
    }
}
