//! Check configuration model.
//!
//! A check is a named unit of work declared in configuration: a provider
//! type plus gating, routing, fan-out, and provider-specific parameters.
//! Instances are immutable for the duration of a run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::issue::Severity;

/// Fan-out mode for dependents of a forEach producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanoutMode {
    /// One invocation per produced item.
    Map,
    /// Single invocation at the aggregate scope.
    Reduce,
}

/// Provider types that aggregate by default when not explicitly configured.
const REDUCE_BY_DEFAULT: &[&str] = &["log", "memory", "script", "workflow", "noop"];

/// Criticality classification of a check, used to gate retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Criticality {
    /// Interacts with external systems; logical failures are not retried.
    External,
    /// Internal computation; retries are safe.
    #[default]
    Internal,
    /// Policy decision; treated like internal for retry purposes.
    Policy,
}

/// Retry settings attached to an `on_fail` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub max: u32,
    /// Initial backoff between attempts in milliseconds.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_backoff_ms() -> u64 {
    500
}

/// An `on_success` / `on_fail` / `on_finish` action block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingBlock {
    /// Checks to enqueue as forward runs, in order.
    #[serde(default)]
    pub run: Vec<String>,
    /// Static reroute target.
    #[serde(default)]
    pub goto: Option<String>,
    /// Sandbox expression producing a reroute target or null.
    #[serde(default)]
    pub goto_js: Option<String>,
    /// Event to run the goto target under; inherits the current event when
    /// absent.
    #[serde(default)]
    pub goto_event: Option<String>,
    /// Retry policy (meaningful on `on_fail` only).
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl RoutingBlock {
    pub fn is_empty(&self) -> bool {
        self.run.is_empty() && self.goto.is_none() && self.goto_js.is_none()
    }
}

/// A structured failure condition evaluated after a check completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureCondition {
    pub name: String,
    /// Sandbox expression; truthy means the condition fired.
    pub condition: String,
    #[serde(default = "default_condition_severity")]
    pub severity: Severity,
    #[serde(default)]
    pub message: Option<String>,
}

fn default_condition_severity() -> Severity {
    Severity::Error
}

/// Schema tag: `plain`, a named domain schema, or an inline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SchemaRef {
    Name(String),
    Inline(Value),
}

impl SchemaRef {
    pub fn is_plain(&self) -> bool {
        matches!(self, Self::Name(n) if n == "plain")
    }

    /// The schema name used for issue enrichment and template lookup.
    pub fn label(&self) -> Option<&str> {
        match self {
            Self::Name(n) => Some(n),
            Self::Inline(_) => None,
        }
    }
}

/// Template reference: inline content or a `.liquid` file under the project
/// root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemplateRef {
    Path(String),
    Inline { content: String },
}

/// One check as declared in the `checks` map of a configuration document.
///
/// The id is injected from the map key at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckConfig {
    /// Unique id, set from the map key.
    #[serde(skip)]
    pub id: String,

    /// Provider kind executed for this check.
    #[serde(rename = "type")]
    pub check_type: String,

    #[serde(default)]
    pub group: Option<String>,

    #[serde(default)]
    pub schema: Option<SchemaRef>,

    #[serde(default)]
    pub template: Option<TemplateRef>,

    /// Dependency tokens; a token is a check id or an OR group `"a|b|c"`.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Event filter. `None` means all events, `Some([])` disables the check.
    #[serde(default)]
    pub on: Option<Vec<String>>,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Gate expression; falsy or erroring skips the check.
    #[serde(default, rename = "if")]
    pub if_condition: Option<String>,

    /// Failure expression evaluated after the check completes.
    #[serde(default)]
    pub fail_if: Option<String>,

    #[serde(default)]
    pub failure_conditions: Vec<FailureCondition>,

    /// Marks this check as a forEach producer: an array output fans out to
    /// map-mode dependents.
    #[serde(default, rename = "forEach")]
    pub for_each: bool,

    /// Explicit fan-out mode; resolved heuristically per provider when unset.
    #[serde(default)]
    pub fanout: Option<FanoutMode>,

    /// Failed runs of this check still satisfy dependents.
    #[serde(default)]
    pub continue_on_failure: bool,

    #[serde(default)]
    pub criticality: Criticality,

    #[serde(default)]
    pub on_success: Option<RoutingBlock>,

    #[serde(default)]
    pub on_fail: Option<RoutingBlock>,

    #[serde(default)]
    pub on_finish: Option<RoutingBlock>,

    /// Session annotation; checks sharing a session run sequentially.
    #[serde(default)]
    pub session: Option<String>,

    /// Per-check timeout in seconds; providers fall back to their default.
    #[serde(default)]
    pub timeout: Option<u64>,

    // Provider parameters. Which keys apply is the provider's concern;
    // `Provider::supported_keys` documents them.
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default, rename = "appendPrompt")]
    pub append_prompt: Option<String>,
    #[serde(default)]
    pub exec: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub value_js: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub transform: Option<String>,
    #[serde(default)]
    pub transform_js: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
}

impl CheckConfig {
    /// Minimal check used by services and tests.
    pub fn new(id: impl Into<String>, check_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            check_type: check_type.into(),
            group: None,
            schema: None,
            template: None,
            depends_on: Vec::new(),
            on: None,
            tags: Vec::new(),
            if_condition: None,
            fail_if: None,
            failure_conditions: Vec::new(),
            for_each: false,
            fanout: None,
            continue_on_failure: false,
            criticality: Criticality::default(),
            on_success: None,
            on_fail: None,
            on_finish: None,
            session: None,
            timeout: None,
            prompt: None,
            append_prompt: None,
            exec: None,
            url: None,
            body: None,
            headers: HashMap::new(),
            operation: None,
            key: None,
            value: None,
            value_js: None,
            namespace: None,
            transform: None,
            transform_js: None,
            env: HashMap::new(),
            message: None,
            level: None,
        }
    }

    /// Effective fan-out mode: explicit wins, otherwise log/memory/script/
    /// workflow/noop aggregate and everything else maps.
    pub fn effective_fanout(&self) -> FanoutMode {
        self.fanout.unwrap_or_else(|| {
            if REDUCE_BY_DEFAULT.contains(&self.check_type.as_str()) {
                FanoutMode::Reduce
            } else {
                FanoutMode::Map
            }
        })
    }

    /// `Some([])` disables the check entirely.
    pub fn is_disabled(&self) -> bool {
        matches!(&self.on, Some(events) if events.is_empty())
    }

    /// Whether this check runs for the given trigger event.
    pub fn runs_on(&self, event: &str) -> bool {
        match &self.on {
            None => true,
            Some(events) => events.iter().any(|e| e == event),
        }
    }

    /// Declared retry budget from the `on_fail` block.
    pub fn retry_config(&self) -> Option<&RetryConfig> {
        self.on_fail.as_ref().and_then(|block| block.retry.as_ref())
    }

    /// Parse `depends_on` into OR groups; a token without `|` is a
    /// single-option group.
    pub fn dependency_groups(&self) -> Vec<Vec<String>> {
        self.depends_on
            .iter()
            .map(|token| {
                token
                    .split('|')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .filter(|group: &Vec<String>| !group.is_empty())
            .collect()
    }

    /// All checks referenced from dependency tokens.
    pub fn dependency_options(&self) -> Vec<String> {
        self.dependency_groups().into_iter().flatten().collect()
    }
}
