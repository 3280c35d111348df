//! Built-in providers and the provider registry.

pub mod ai;
pub mod command;
pub mod http;
pub mod log;
pub mod memory;
pub mod noop;
pub mod script;

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::errors::{ConfigError, ProviderError};
use crate::domain::models::config::EngineConfig;
use crate::domain::models::issue::{Issue, ReviewSummary, Severity, VALID_CATEGORIES};
use crate::domain::ports::provider::Provider;

pub use ai::AiProvider;
pub use command::CommandProvider;
pub use http::HttpProvider;
pub use log::LogProvider;
pub use memory::MemoryProvider;
pub use noop::NoopProvider;
pub use script::ScriptProvider;

/// Maps `type` strings to provider implementations.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self { providers: HashMap::new() }
    }

    /// Registry with every built-in provider registered, including the
    /// `webhook` and `workflow` aliases.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(AiProvider::new()));
        registry.register(Arc::new(CommandProvider::new()));
        let http = Arc::new(HttpProvider::new());
        registry.register(http.clone());
        registry.register_alias("webhook", http);
        registry.register(Arc::new(ScriptProvider::new()));
        registry.register(Arc::new(MemoryProvider::new()));
        registry.register(Arc::new(LogProvider::new()));
        let noop = Arc::new(NoopProvider::new());
        registry.register(noop.clone());
        registry.register_alias("workflow", noop);
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn register_alias(&mut self, alias: &str, provider: Arc<dyn Provider>) {
        self.providers.insert(alias.to_string(), provider);
    }

    pub fn resolve(&self, check_type: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        self.providers
            .get(check_type)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider(check_type.to_string()))
    }

    pub fn known_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.providers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Validate every check of a configuration against its provider.
    pub fn validate_config(&self, config: &EngineConfig) -> Result<(), ConfigError> {
        for (id, check) in &config.checks {
            let provider = self.resolve(&check.check_type).map_err(|_| {
                ConfigError::UnknownProviderType {
                    check: id.clone(),
                    provider: check.check_type.clone(),
                }
            })?;
            provider.validate_config(check)?;
        }
        Ok(())
    }
}

/// Parse a `ReviewSummary`-shaped JSON value from an external payload,
/// validating severity (always) and category (when `strict_categories`).
pub fn parse_wire_summary(
    value: &Value,
    strict_categories: bool,
) -> Result<ReviewSummary, ProviderError> {
    let mut summary = ReviewSummary::empty();

    if let Some(issues) = value.get("issues").and_then(Value::as_array) {
        for raw in issues {
            let severity_text = raw
                .get("severity")
                .and_then(Value::as_str)
                .unwrap_or("warning");
            let severity = Severity::parse(severity_text).ok_or_else(|| {
                ProviderError::SchemaValidation(format!("invalid severity '{severity_text}'"))
            })?;
            let category = raw
                .get("category")
                .and_then(Value::as_str)
                .unwrap_or("logic");
            if strict_categories && !VALID_CATEGORIES.contains(&category) {
                return Err(ProviderError::SchemaValidation(format!(
                    "invalid category '{category}'"
                )));
            }
            let rule_id = raw
                .get("ruleId")
                .or_else(|| raw.get("rule_id"))
                .and_then(Value::as_str)
                .unwrap_or("finding");
            let message = raw
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let mut issue = Issue::new(rule_id, message, severity).with_category(category);
            issue.file = raw.get("file").and_then(Value::as_str).map(String::from);
            issue.line = raw.get("line").and_then(Value::as_u64);
            summary.issues.push(issue);
        }
    }

    summary.output = value.get("output").cloned();
    summary.content = value
        .get("content")
        .and_then(Value::as_str)
        .map(String::from);

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtins_cover_all_kinds() {
        let registry = ProviderRegistry::with_builtins();
        for kind in ["ai", "command", "http", "webhook", "script", "memory", "log", "noop", "workflow"] {
            assert!(registry.resolve(kind).is_ok(), "missing provider {kind}");
        }
        assert!(registry.resolve("carrier-pigeon").is_err());
    }

    #[test]
    fn wire_summary_parses_and_validates() {
        let value = json!({
            "issues": [
                {"ruleId": "sqli", "message": "injection", "severity": "critical",
                 "category": "security", "file": "db.rs", "line": 4}
            ],
            "output": {"score": 7},
            "content": "report"
        });
        let summary = parse_wire_summary(&value, true).unwrap();
        assert_eq!(summary.issues.len(), 1);
        assert_eq!(summary.issues[0].severity, Severity::Critical);
        assert_eq!(summary.issues[0].file.as_deref(), Some("db.rs"));
        assert_eq!(summary.output, Some(json!({"score": 7})));
        assert_eq!(summary.content.as_deref(), Some("report"));
    }

    #[test]
    fn wire_summary_rejects_bad_enums() {
        let bad_severity = json!({"issues": [{"severity": "catastrophic"}]});
        assert!(parse_wire_summary(&bad_severity, false).is_err());

        let bad_category = json!({"issues": [{"severity": "error", "category": "vibes"}]});
        assert!(parse_wire_summary(&bad_category, true).is_err());
        // Lenient mode keeps unknown categories.
        assert!(parse_wire_summary(&bad_category, false).is_ok());
    }
}
