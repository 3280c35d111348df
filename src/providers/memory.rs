//! Memory provider: executes one memory-store operation per check.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::errors::{ConfigError, ProviderError};
use crate::domain::models::check::CheckConfig;
use crate::domain::models::issue::ReviewSummary;
use crate::domain::models::run::RunInput;
use crate::domain::ports::provider::{require_key, DependencyResults, Provider, ProviderContext};

const OPERATIONS: &[&str] = &[
    "get", "has", "set", "append", "increment", "delete", "clear", "list",
];

/// Operations that do not address a single key.
const KEYLESS: &[&str] = &["clear", "list"];

#[derive(Debug, Default)]
pub struct MemoryProvider;

impl MemoryProvider {
    pub fn new() -> Self {
        Self
    }
}

impl MemoryProvider {
    /// The value operand: `value_js` (sandbox) wins over the literal
    /// `value`.
    fn operand(
        &self,
        check: &CheckConfig,
        ctx: &ProviderContext,
    ) -> Result<Value, ProviderError> {
        if let Some(source) = &check.value_js {
            return Ok(ctx.sandbox.eval(source, &ctx.template_data)?);
        }
        Ok(check.value.clone().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn description(&self) -> &'static str {
        "Executes a single namespaced key/value operation"
    }

    fn validate_config(&self, check: &CheckConfig) -> Result<(), ConfigError> {
        let Some(operation) = check.operation.as_deref() else {
            return Err(ConfigError::ProviderValidation {
                check: check.id.clone(),
                reason: "memory checks require 'operation'".into(),
            });
        };
        if !OPERATIONS.contains(&operation) {
            return Err(ConfigError::ProviderValidation {
                check: check.id.clone(),
                reason: format!("unknown memory operation '{operation}'"),
            });
        }
        if !KEYLESS.contains(&operation) && check.key.is_none() {
            return Err(ConfigError::ProviderValidation {
                check: check.id.clone(),
                reason: format!("memory operation '{operation}' requires 'key'"),
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
        let operation = require_key(self.name(), "operation", check.operation.as_ref())?;
        let namespace = check.namespace.as_deref();
        let store = &ctx.memory;

        let output = match operation.as_str() {
            "get" => {
                let key = require_key(self.name(), "key", check.key.as_ref())?;
                store.get(namespace, key).await.unwrap_or(Value::Null)
            }
            "has" => {
                let key = require_key(self.name(), "key", check.key.as_ref())?;
                Value::Bool(store.has(namespace, key).await)
            }
            "set" => {
                let key = require_key(self.name(), "key", check.key.as_ref())?;
                let value = self.operand(check, ctx)?;
                store.set(namespace, key, value.clone()).await;
                value
            }
            "append" => {
                let key = require_key(self.name(), "key", check.key.as_ref())?;
                let value = self.operand(check, ctx)?;
                store.append(namespace, key, value).await
            }
            "increment" => {
                let key = require_key(self.name(), "key", check.key.as_ref())?;
                let amount = match self.operand(check, ctx)? {
                    Value::Null => Value::from(1),
                    other => other,
                };
                store
                    .increment(namespace, key, &amount)
                    .await
                    .map_err(|e| ProviderError::SchemaValidation(e.to_string()))?
            }
            "delete" => {
                let key = require_key(self.name(), "key", check.key.as_ref())?;
                Value::Bool(store.delete(namespace, key).await)
            }
            "clear" => {
                store.clear(namespace).await;
                Value::Null
            }
            "list" => {
                let keys = store.list(namespace).await;
                Value::Array(keys.into_iter().map(Value::String).collect())
            }
            other => {
                return Err(ProviderError::SchemaValidation(format!(
                    "unknown memory operation '{other}'"
                )));
            }
        };

        Ok(ReviewSummary::empty().with_output(output))
    }

    fn supported_keys(&self) -> &'static [&'static str] {
        &["operation", "key", "value", "value_js", "namespace"]
    }
}
