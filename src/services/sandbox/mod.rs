//! Sandboxed evaluator for user expressions (`if`, `fail_if`, `goto_js`,
//! `value_js`, `transform_js`).
//!
//! Expressions see a fixed read-only context and nothing else: no file
//! system, no process spawning, no network, no module loading. Each
//! evaluation is bounded by an instruction budget and a wall clock.

mod interp;
mod lexer;
mod parser;

pub use interp::truthy;

use serde_json::{Map, Value};
use tracing::debug;

use crate::domain::errors::SandboxError;
use crate::domain::models::issue::Issue;
use crate::domain::models::run::{IssueCounts, RunInput};

use interp::{Budget, Interpreter};
use parser::parse;

const DEFAULT_MAX_OPS: u64 = 1_000_000;
const DEFAULT_MAX_WALL_MS: u64 = 250;

/// The expression sandbox. Cheap to construct; stateless between calls.
#[derive(Debug, Clone)]
pub struct Sandbox {
    max_ops: u64,
    max_wall_ms: u64,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self { max_ops: DEFAULT_MAX_OPS, max_wall_ms: DEFAULT_MAX_WALL_MS }
    }
}

impl Sandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_budget(max_ops: u64, max_wall_ms: u64) -> Self {
        Self { max_ops, max_wall_ms }
    }

    /// Evaluate an expression against a context object.
    pub fn eval(&self, source: &str, context: &Value) -> Result<Value, SandboxError> {
        let expr = parse(source)?;
        let mut interp = Interpreter::new(context, Budget::new(self.max_ops, self.max_wall_ms));
        interp.eval(&expr)
    }

    /// Evaluate to a boolean via truthiness.
    pub fn eval_bool(&self, source: &str, context: &Value) -> Result<bool, SandboxError> {
        Ok(truthy(&self.eval(source, context)?))
    }

    /// Fail-secure `fail_if` semantics: evaluation errors are false.
    pub fn eval_fail_if(&self, source: &str, context: &Value) -> bool {
        match self.eval_bool(source, context) {
            Ok(result) => result,
            Err(err) => {
                debug!(kind = err.kind(), error = %err, "fail_if expression error treated as false");
                false
            }
        }
    }

    /// Fail-secure `if` semantics: evaluation errors skip the check, which
    /// the caller expresses by treating the result as false.
    pub fn eval_if(&self, source: &str, context: &Value) -> Result<bool, SandboxError> {
        self.eval_bool(source, context)
    }
}

/// Builder for the fixed, read-only expression context.
///
/// Field names are part of the expression language surface; keep them
/// stable.
#[derive(Debug, Default, Clone)]
pub struct EvalContextBuilder {
    map: Map<String, Value>,
}

impl EvalContextBuilder {
    pub fn new() -> Self {
        let mut map = Map::new();
        map.insert("output".into(), Value::Null);
        map.insert("outputs".into(), Value::Object(Map::new()));
        map.insert("outputs_raw".into(), Value::Object(Map::new()));
        map.insert("memory".into(), Value::Object(Map::new()));
        map.insert("inputs".into(), Value::Null);
        map.insert("env".into(), Value::Object(Map::new()));
        map.insert("issues".into(), Value::Array(Vec::new()));
        map.insert("metadata".into(), Value::Null);
        map.insert("debug".into(), Value::Bool(false));
        Self { map }
    }

    /// Current result output, where applicable.
    pub fn output(mut self, output: Value) -> Self {
        self.map.insert("output".into(), output);
        self
    }

    /// Map of check id → most recent scope-appropriate output.
    pub fn outputs(mut self, outputs: Map<String, Value>) -> Self {
        self.map.insert("outputs".into(), Value::Object(outputs));
        self
    }

    /// Map of check id → aggregate/root output for forEach producers.
    pub fn outputs_raw(mut self, outputs: Map<String, Value>) -> Self {
        self.map.insert("outputs_raw".into(), Value::Object(outputs));
        self
    }

    /// Read-only snapshot of the memory namespace.
    pub fn memory(mut self, snapshot: Value) -> Self {
        self.map.insert("memory".into(), snapshot);
        self
    }

    pub fn inputs(mut self, inputs: Value) -> Self {
        self.map.insert("inputs".into(), inputs);
        self
    }

    /// Environment snapshot taken at invocation time.
    pub fn env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        let map: Map<String, Value> =
            env.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
        self.map.insert("env".into(), Value::Object(map));
        self
    }

    /// Issues visible to the expression, plus derived severity counts.
    pub fn issues(mut self, issues: &[Issue]) -> Self {
        let mut counts = IssueCounts::default();
        for issue in issues {
            counts.add(issue.severity);
        }
        let values: Vec<Value> = issues
            .iter()
            .map(|i| serde_json::to_value(i).unwrap_or(Value::Null))
            .collect();
        self.map.insert("issues".into(), Value::Array(values));
        self.map.insert(
            "issueCounts".into(),
            serde_json::to_value(counts).unwrap_or(Value::Null),
        );
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.map.insert("metadata".into(), metadata);
        self
    }

    /// Branch, files, event, and author fields from the run input.
    pub fn run_input(mut self, input: &RunInput) -> Self {
        self.map.insert("branch".into(), Value::String(input.head_branch.clone()));
        self.map
            .insert("baseBranch".into(), Value::String(input.base_branch.clone()));
        let files: Vec<Value> = input
            .files
            .iter()
            .map(|f| Value::String(f.path.clone()))
            .collect();
        self.map.insert("filesCount".into(), Value::from(files.len()));
        self.map.insert("filesChanged".into(), Value::Array(files));
        self.map.insert("event".into(), Value::String(input.event.clone()));
        if let Some(assoc) = &input.author_association {
            self.map
                .insert("authorAssociation".into(), Value::String(assoc.clone()));
        }
        if !input.metadata.is_null() {
            self.map.insert("metadata".into(), input.metadata.clone());
        }
        self.map.insert("debug".into(), Value::Bool(input.debug));
        self
    }

    /// Identity of the check the expression belongs to.
    pub fn check(mut self, name: &str, schema: Option<&str>, group: Option<&str>) -> Self {
        self.map.insert("checkName".into(), Value::String(name.to_string()));
        self.map.insert(
            "schema".into(),
            schema.map_or(Value::Null, |s| Value::String(s.to_string())),
        );
        self.map.insert(
            "group".into(),
            group.map_or(Value::Null, |g| Value::String(g.to_string())),
        );
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.map.insert("debug".into(), Value::Bool(debug));
        self
    }

    pub fn build(self) -> Value {
        Value::Object(self.map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::issue::Severity;
    use serde_json::json;

    #[test]
    fn fail_if_errors_are_false() {
        let sandbox = Sandbox::new();
        let ctx = EvalContextBuilder::new().build();
        assert!(!sandbox.eval_fail_if("undefined_fn()", &ctx));
        assert!(!sandbox.eval_fail_if("(((", &ctx));
        assert!(sandbox.eval_fail_if("1 == 1", &ctx));
    }

    #[test]
    fn if_errors_propagate_for_skip() {
        let sandbox = Sandbox::new();
        let ctx = EvalContextBuilder::new().build();
        assert!(sandbox.eval_if("missing_identifier", &ctx).is_err());
        assert!(sandbox.eval_if("true", &ctx).unwrap());
    }

    #[test]
    fn context_exposes_outputs_and_counts() {
        let sandbox = Sandbox::new();
        let mut outputs = Map::new();
        outputs.insert("fetch".into(), json!({"items": [1, 2]}));
        let issues = vec![
            Issue::new("a/x", "boom", Severity::Critical),
            Issue::new("a/y", "warn", Severity::Warning),
        ];
        let ctx = EvalContextBuilder::new()
            .outputs(outputs)
            .issues(&issues)
            .build();
        assert!(sandbox.eval_bool("outputs.fetch.items.length == 2", &ctx).unwrap());
        assert!(sandbox.eval_bool("issueCounts.critical == 1", &ctx).unwrap());
        assert!(sandbox.eval_bool("hasIssue('critical')", &ctx).unwrap());
    }

    #[test]
    fn run_input_fields_surface() {
        let mut input = RunInput::manual();
        input.head_branch = "feature/x".into();
        input.base_branch = "main".into();
        input.author_association = Some("owner".into());
        input.files.push(crate::domain::models::run::FileChange {
            path: "src/main.rs".into(),
            status: crate::domain::models::run::FileStatus::Modified,
            additions: 1,
            deletions: 0,
            patch: None,
        });
        let ctx = EvalContextBuilder::new().run_input(&input).build();
        let sandbox = Sandbox::new();
        assert!(sandbox.eval_bool("branch.startsWith('feature/')", &ctx).unwrap());
        assert!(sandbox.eval_bool("filesCount == 1", &ctx).unwrap());
        assert!(sandbox.eval_bool("isOwner()", &ctx).unwrap());
        assert!(sandbox.eval_bool("hasFileMatching('src/**')", &ctx).unwrap());
    }

    #[test]
    fn timeout_budget_enforced() {
        let sandbox = Sandbox::with_budget(100, 250);
        let ctx = EvalContextBuilder::new().build();
        let err = sandbox.eval("1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1+1", &ctx);
        assert!(matches!(err, Err(SandboxError::Timeout(_))));
    }
}
