//! Error types for the vigil execution engine.
//!
//! Each enum covers one failure domain. Expression and template errors are
//! deliberately non-fatal at the run level: `fail_if` errors evaluate to
//! false, `if` errors skip the check, template errors yield empty content.

use thiserror::Error;

/// Errors raised while loading, merging, or validating a configuration
/// document.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file was not found at the specified path.
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    /// Invalid YAML syntax in a configuration file.
    #[error("Invalid YAML in {path}: {reason}")]
    InvalidYaml { path: String, reason: String },

    /// A check references a provider type the registry does not know.
    #[error("Check '{check}' uses unknown provider type '{provider}'")]
    UnknownProviderType { check: String, provider: String },

    /// A `depends_on` token names a check that does not exist.
    #[error("Check '{check}' depends on undeclared check '{dependency}'")]
    UnknownDependency { check: String, dependency: String },

    /// A check lists itself in `depends_on`.
    #[error("Check '{0}' depends on itself")]
    SelfDependency(String),

    /// Dependency graph contains a cycle.
    #[error("Dependency cycle detected involving check '{0}'")]
    DependencyCycle(String),

    /// `extends` chain loops back on itself.
    #[error("extends cycle detected at '{0}'")]
    ExtendsCycle(String),

    /// `extends` chain exceeded the maximum depth.
    #[error("extends chain exceeds maximum depth of {0}")]
    ExtendsTooDeep(usize),

    /// Remote `extends` URL encountered while remote resolution is disabled.
    #[error("Remote extends '{0}' is disabled; enable allow_remote_extends to permit it")]
    RemoteExtendsDisabled(String),

    /// Failed to fetch a remote `extends` document.
    #[error("Failed to fetch remote extends '{url}': {reason}")]
    RemoteExtendsFailed { url: String, reason: String },

    /// A field carries a value outside its allowed range or shape.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// A check provider rejected its configuration.
    #[error("Check '{check}' failed provider validation: {reason}")]
    ProviderValidation { check: String, reason: String },

    /// I/O error while reading configuration.
    #[error("I/O error reading config: {0}")]
    Io(String),
}

/// Errors raised by the expression sandbox.
///
/// Every variant maps to exactly one kind string surfaced in telemetry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    /// The expression could not be tokenized or parsed.
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    /// An identifier was not present in the evaluation context.
    #[error("reference error: '{0}' is not defined")]
    Reference(String),

    /// An operation was applied to a value of the wrong type.
    #[error("type error: {0}")]
    Type(String),

    /// The instruction or wall-clock budget was exhausted.
    #[error("evaluation exceeded budget ({0})")]
    Timeout(String),
}

impl SandboxError {
    /// Stable kind string for telemetry and issue rule ids.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Syntax { .. } => "syntax_error",
            Self::Reference(_) => "reference_error",
            Self::Type(_) => "type_error",
            Self::Timeout(_) => "timeout",
        }
    }
}

/// Errors raised by provider execution.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Requested provider type is not registered.
    #[error("Unknown provider type: {0}")]
    UnknownProvider(String),

    /// Provider exists but reports itself unavailable (missing binary,
    /// missing credential, no wired client).
    #[error("Provider '{provider}' unavailable: {reason}")]
    Unavailable { provider: String, reason: String },

    /// Subprocess exited non-zero or could not be spawned.
    #[error("Subprocess failed: {0}")]
    Subprocess(String),

    /// Network-level failure before an HTTP status was received.
    #[error("Network error: {0}")]
    Network(String),

    /// HTTP endpoint returned a non-2xx status.
    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },

    /// Structured output was required but the payload did not parse.
    #[error("JSON parse failure: {0}")]
    JsonParse(String),

    /// Provider output failed the declared schema.
    #[error("Schema validation failed: {0}")]
    SchemaValidation(String),

    /// Provider did not finish within its timeout.
    #[error("Provider timed out after {0} seconds")]
    Timeout(u64),

    /// Sandbox evaluation inside a provider failed.
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    /// Run was cancelled while the provider was executing.
    #[error("Cancelled")]
    Cancelled,

    /// Check configuration is missing a key the provider requires.
    #[error("Missing required key '{key}' for provider '{provider}'")]
    MissingKey { provider: String, key: String },
}

impl ProviderError {
    /// Returns true if this error is transient and could succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Returns true if retrying cannot help.
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Errors raised by the routing engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// The run-wide goto/forward budget was exhausted.
    #[error("Routing loop budget of {budget} exceeded at check '{check}'")]
    LoopBudgetExceeded { check: String, budget: u32 },

    /// A goto target does not name a declared check.
    #[error("Invalid goto target '{target}' from check '{check}'")]
    InvalidGotoTarget { check: String, target: String },
}

/// Umbrella error for the engine. Maps one-to-one onto the taxonomy used in
/// run results: configuration, sandbox, provider, routing, cancellation, and
/// invariant violations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Run cancelled: {0}")]
    Cancelled(String),

    /// An engine invariant was violated. Aborts the run with a
    /// `system/error` issue.
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_error_kinds_are_stable() {
        assert_eq!(
            SandboxError::Syntax { offset: 3, message: "x".into() }.kind(),
            "syntax_error"
        );
        assert_eq!(SandboxError::Reference("y".into()).kind(), "reference_error");
        assert_eq!(SandboxError::Type("bad".into()).kind(), "type_error");
        assert_eq!(SandboxError::Timeout("ops".into()).kind(), "timeout");
    }

    #[test]
    fn provider_error_transience() {
        assert!(ProviderError::Network("reset".into()).is_transient());
        assert!(ProviderError::Timeout(30).is_transient());
        assert!(ProviderError::Http { status: 503, body: String::new() }.is_transient());
        assert!(ProviderError::Http { status: 429, body: String::new() }.is_transient());
        assert!(!ProviderError::Http { status: 400, body: String::new() }.is_transient());
        assert!(ProviderError::JsonParse("eof".into()).is_permanent());
        assert!(ProviderError::UnknownProvider("nope".into()).is_permanent());
    }

    #[test]
    fn config_error_display_names_the_check() {
        let err = ConfigError::UnknownDependency {
            check: "security".into(),
            dependency: "fetch".into(),
        };
        assert_eq!(
            err.to_string(),
            "Check 'security' depends on undeclared check 'fetch'"
        );
    }

    #[test]
    fn routing_error_display() {
        let err = RoutingError::LoopBudgetExceeded { check: "a".into(), budget: 10 };
        assert_eq!(err.to_string(), "Routing loop budget of 10 exceeded at check 'a'");
    }
}
