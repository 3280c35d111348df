//! Issue and result summary models.
//!
//! Every provider invocation produces a [`ReviewSummary`]. Issues are the
//! structured findings; `output` carries an arbitrary value (primitives
//! preserved), `content` the rendered template text. ForEach producers
//! additionally carry the per-item aggregation fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity of an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }

    /// Parse a severity label. Unknown labels are rejected so that webhook
    /// payloads cannot smuggle arbitrary strings into the enum.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// True for severities that mark a check as failed.
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::Error | Self::Critical)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Issue categories accepted from external (http/webhook) providers.
pub const VALID_CATEGORIES: &[&str] = &[
    "security",
    "performance",
    "style",
    "logic",
    "documentation",
];

/// A single structured finding attached to a check result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    /// Qualified rule id, `<checkId>/<innerRuleId>` once enriched.
    #[serde(rename = "ruleId")]
    pub rule_id: String,
    pub message: String,
    pub severity: Severity,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
    /// Enrichment: the check that produced this issue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

fn default_category() -> String {
    "logic".to_string()
}

impl Issue {
    pub fn new(rule_id: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            rule_id: rule_id.into(),
            message: message.into(),
            severity,
            category: default_category(),
            file: None,
            line: None,
            check_id: None,
            group: None,
            schema: None,
            timestamp: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_file(mut self, file: impl Into<String>, line: Option<u64>) -> Self {
        self.file = Some(file.into());
        self.line = line;
        self
    }

    /// A rule id marks the check (or iteration) as failed when it is a hard
    /// execution failure or a triggered fail_if.
    pub fn is_fatal_rule(rule_id: &str) -> bool {
        rule_id.ends_with("/error")
            || rule_id.contains("/execution_error")
            || rule_id.ends_with("_fail_if")
    }

    /// Whether this issue alone fails the check.
    pub fn is_fatal(&self) -> bool {
        Self::is_fatal_rule(&self.rule_id) && self.severity.is_fatal()
    }
}

/// Result of a single provider invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewSummary {
    #[serde(default)]
    pub issues: Vec<Issue>,
    /// Arbitrary provider output. Primitives are preserved as-is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Rendered template content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Aggregated per-item outputs for a forEach producer.
    #[serde(default, rename = "forEachItems", skip_serializing_if = "Option::is_none")]
    pub for_each_items: Option<Vec<Value>>,
    /// Per-item result summaries for a forEach producer.
    #[serde(default, rename = "forEachItemResults", skip_serializing_if = "Option::is_none")]
    pub for_each_item_results: Option<Vec<ReviewSummary>>,
    /// Per-item fatality mask aligned with `for_each_items`.
    #[serde(default, rename = "forEachFatalMask", skip_serializing_if = "Option::is_none")]
    pub for_each_fatal_mask: Option<Vec<bool>>,
}

impl ReviewSummary {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_issues(mut self, issues: Vec<Issue>) -> Self {
        self.issues = issues;
        self
    }

    /// True when any issue marks this result as a hard failure.
    pub fn has_fatal_issues(&self) -> bool {
        self.issues.iter().any(Issue::is_fatal)
    }

    /// Count issues at a given severity.
    pub fn count_severity(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }
}

/// An output value wrapped with an iteration-failure marker so that
/// dependents of a forEach producer can cascade-skip that item.
pub fn mark_failed(output: Value) -> Value {
    serde_json::json!({ "__failed": true, "value": output })
}

/// A placeholder recorded for iterations that were skipped.
pub fn skip_marker() -> Value {
    serde_json::json!({ "__skip": true })
}

/// True when an item output carries the `__failed` marker.
pub fn is_failed_item(value: &Value) -> bool {
    value.get("__failed").and_then(Value::as_bool).unwrap_or(false)
}

/// True when an item output carries the `__skip` marker.
pub fn is_skip_item(value: &Value) -> bool {
    value.get("__skip").and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fatal_rule_suffixes() {
        assert!(Issue::is_fatal_rule("fetch/error"));
        assert!(Issue::is_fatal_rule("fetch/execution_error"));
        assert!(Issue::is_fatal_rule("lint/execution_error/detail"));
        assert!(Issue::is_fatal_rule("a_fail_if"));
        assert!(!Issue::is_fatal_rule("fetch/style"));
        assert!(!Issue::is_fatal_rule("fetch/errors_found"));
    }

    #[test]
    fn summary_fatality_requires_fatal_severity() {
        let mut summary = ReviewSummary::empty();
        summary.issues.push(Issue::new("a/a_fail_if", "failed", Severity::Error));
        assert!(summary.has_fatal_issues());

        let mut benign = ReviewSummary::empty();
        benign.issues.push(Issue::new("a/style", "note", Severity::Warning));
        assert!(!benign.has_fatal_issues());
    }

    #[test]
    fn severity_parsing_rejects_unknown() {
        assert_eq!(Severity::parse("ERROR"), Some(Severity::Error));
        assert_eq!(Severity::parse("blocker"), None);
    }

    #[test]
    fn item_markers_round_trip() {
        let failed = mark_failed(json!("x"));
        assert!(is_failed_item(&failed));
        assert!(!is_skip_item(&failed));
        assert!(is_skip_item(&skip_marker()));
        assert!(!is_failed_item(&json!("plain")));
        assert!(!is_failed_item(&json!(42)));
    }
}
