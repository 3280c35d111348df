//! Engine configuration document.
//!
//! The top-level structure users author in YAML: engine-wide settings plus
//! the `checks` map. Merge semantics for `extends` chains live here so the
//! loader stays a thin I/O shell.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::check::{CheckConfig, FailureCondition};
use crate::domain::errors::ConfigError;

/// `extends` accepts a single reference or a list, each a local path or URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtendsRef {
    One(String),
    Many(Vec<String>),
}

impl ExtendsRef {
    pub fn refs(&self) -> Vec<&str> {
        match self {
            Self::One(s) => vec![s.as_str()],
            Self::Many(list) => list.iter().map(String::as_str).collect(),
        }
    }
}

/// Routing-engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Maximum routing-triggered re-executions per run.
    pub max_loops: u32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self { max_loops: 10 }
    }
}

/// Memory-store settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Default namespace for unqualified keys.
    pub namespace: Option<String>,
    /// Optional JSON file the store persists to.
    pub persist_file: Option<String>,
}

/// Tag filter applied when selecting the requested check set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl TagFilter {
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// A check passes when it carries at least one included tag (or the
    /// include list is empty) and no excluded tag.
    pub fn matches(&self, tags: &[String]) -> bool {
        if self.exclude.iter().any(|t| tags.contains(t)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|t| tags.contains(t))
    }
}

/// The full configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub version: Option<String>,
    pub extends: Option<ExtendsRef>,
    pub env: BTreeMap<String, String>,
    pub ai_model: Option<String>,
    pub ai_provider: Option<String>,
    pub max_parallelism: Option<usize>,
    pub fail_fast: Option<bool>,
    /// Global fail_if applied to checks without their own.
    pub fail_if: Option<String>,
    pub failure_conditions: Vec<FailureCondition>,
    pub memory: MemoryConfig,
    pub routing: RoutingConfig,
    pub output: Option<Value>,
    pub tag_filter: TagFilter,
    pub checks: BTreeMap<String, CheckConfig>,
}

impl EngineConfig {
    /// Parse a YAML document and inject check ids from map keys.
    pub fn from_yaml(source: &str, origin: &str) -> Result<Self, ConfigError> {
        let mut config: Self =
            serde_yaml::from_str(source).map_err(|e| ConfigError::InvalidYaml {
                path: origin.to_string(),
                reason: e.to_string(),
            })?;
        config.assign_ids();
        Ok(config)
    }

    pub fn assign_ids(&mut self) {
        for (id, check) in &mut self.checks {
            check.id = id.clone();
        }
    }

    pub fn check(&self, id: &str) -> Option<&CheckConfig> {
        self.checks.get(id)
    }

    /// Structural validation: dependency targets exist, no self-deps, no
    /// cycles (every OR option counts as an edge).
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (id, check) in &self.checks {
            for option in check.dependency_options() {
                if option == *id {
                    return Err(ConfigError::SelfDependency(id.clone()));
                }
                if !self.checks.contains_key(&option) {
                    return Err(ConfigError::UnknownDependency {
                        check: id.clone(),
                        dependency: option,
                    });
                }
            }
        }
        self.detect_cycle()
    }

    fn detect_cycle(&self) -> Result<(), ConfigError> {
        // Kahn over the full option graph; leftovers mean a cycle.
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (id, check) in &self.checks {
            in_degree.entry(id.as_str()).or_insert(0);
            for option in check.dependency_options() {
                if let Some((opt_key, _)) = self.checks.get_key_value(option.as_str()) {
                    *in_degree.entry(id.as_str()).or_insert(0) += 1;
                    dependents.entry(opt_key.as_str()).or_default().push(id.as_str());
                }
            }
        }
        let mut queue: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = queue.pop() {
            visited += 1;
            if let Some(deps) = dependents.get(id) {
                for dep in deps {
                    let degree = in_degree.get_mut(dep).expect("dependent tracked");
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push(*dep);
                    }
                }
            }
        }
        if visited != self.checks.len() {
            let stuck = in_degree
                .iter()
                .find(|(_, d)| **d > 0)
                .map(|(id, _)| (*id).to_string())
                .unwrap_or_default();
            return Err(ConfigError::DependencyCycle(stuck));
        }
        Ok(())
    }

    /// Merge an overlay document onto `self` and return the result.
    ///
    /// Scalars overwrite, objects deep-merge, arrays replace. A check whose
    /// merged `on` is the empty list is removed. `appendPrompt` appends to
    /// the parent prompt with one blank line.
    pub fn merged_with(&self, overlay: &Self) -> Result<Self, ConfigError> {
        let base = serde_json::to_value(self).map_err(to_invalid)?;
        let over = serde_json::to_value(overlay).map_err(to_invalid)?;
        Self::from_merged_value(merge_documents(base, over))
    }

    /// Finalize a raw merged document: deserialize, resolve `appendPrompt`
    /// against the merged prompt, drop disabled checks, assign ids.
    ///
    /// The loader merges raw YAML values through [`merge_documents`] before
    /// calling this, so partial overlay documents (a check override without
    /// `type`) merge cleanly.
    pub fn from_merged_value(merged: Value) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_value(merged).map_err(to_invalid)?;
        for check in config.checks.values_mut() {
            if let Some(appended) = check.append_prompt.take() {
                check.prompt = Some(match check.prompt.take() {
                    Some(parent) => format!("{parent}\n\n{appended}"),
                    None => appended,
                });
            }
        }
        config.checks.retain(|_, check| !check.is_disabled());
        config.extends = None;
        config.assign_ids();
        Ok(config)
    }
}

fn to_invalid(err: serde_json::Error) -> ConfigError {
    ConfigError::InvalidValue { field: "<merge>".into(), reason: err.to_string() }
}

/// Deep merge of two raw configuration documents: objects recurse,
/// everything else (scalars, arrays) overwrites. Null overlay values are
/// treated as "not set" and keep the base value.
pub fn merge_documents(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(over_map)) => {
            let mut merged: Map<String, Value> = base_map;
            for (key, over_value) in over_map {
                // Null overlay values mean "not set" for our serialized
                // Option fields; keep the base value.
                if over_value.is_null() {
                    continue;
                }
                let entry = merged.remove(&key);
                let next = match entry {
                    Some(base_value) => merge_documents(base_value, over_value),
                    None => over_value,
                };
                merged.insert(key, next);
            }
            Value::Object(merged)
        }
        (_, overlay) => overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> EngineConfig {
        EngineConfig::from_yaml(yaml, "test.yaml").unwrap()
    }

    #[test]
    fn parses_document_and_assigns_ids() {
        let config = parse(
            r#"
version: "1.0"
max_parallelism: 3
routing:
  max_loops: 5
checks:
  fetch:
    type: command
    exec: "git diff"
  review:
    type: ai
    prompt: "review it"
    depends_on: [fetch]
"#,
        );
        assert_eq!(config.routing.max_loops, 5);
        assert_eq!(config.checks["fetch"].id, "fetch");
        assert_eq!(config.checks["review"].depends_on, vec!["fetch"]);
        config.validate().unwrap();
    }

    #[test]
    fn validation_rejects_unknown_dependency() {
        let config = parse(
            r#"
checks:
  a:
    type: log
    depends_on: [ghost]
"#,
        );
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDependency { .. }));
    }

    #[test]
    fn validation_rejects_cycles_through_or_groups() {
        let config = parse(
            r#"
checks:
  a:
    type: log
    depends_on: ["b|c"]
  b:
    type: log
    depends_on: [a]
  c:
    type: log
    depends_on: [a]
"#,
        );
        assert!(matches!(config.validate(), Err(ConfigError::DependencyCycle(_))));
    }

    #[test]
    fn merge_scalars_overwrite_objects_deep_merge_arrays_replace() {
        let base = parse(
            r#"
max_parallelism: 2
env:
  A: one
  B: two
checks:
  lint:
    type: command
    exec: "lint"
    tags: [fast, ci]
"#,
        );
        let overlay = parse(
            r#"
max_parallelism: 8
env:
  B: override
checks:
  lint:
    tags: [slow]
"#,
        );
        // Overlay checks omit `type`; the merged document restores it from
        // the base, so parse leniency is provided by merging raw values.
        let overlay = EngineConfig {
            checks: {
                let mut map = base.checks.clone();
                let mut lint = map.remove("lint").unwrap();
                lint.tags = vec!["slow".into()];
                map.insert("lint".into(), lint);
                map
            },
            ..overlay
        };
        let merged = base.merged_with(&overlay).unwrap();
        assert_eq!(merged.max_parallelism, Some(8));
        assert_eq!(merged.env["A"], "one");
        assert_eq!(merged.env["B"], "override");
        assert_eq!(merged.checks["lint"].tags, vec!["slow"]);
        assert_eq!(merged.checks["lint"].exec.as_deref(), Some("lint"));
    }

    #[test]
    fn merge_empty_on_removes_check() {
        let base = parse(
            r#"
checks:
  lint:
    type: command
    exec: "lint"
  review:
    type: log
    message: hi
"#,
        );
        let mut overlay = base.clone();
        overlay.checks.get_mut("lint").unwrap().on = Some(vec![]);
        let merged = base.merged_with(&overlay).unwrap();
        assert!(!merged.checks.contains_key("lint"));
        assert!(merged.checks.contains_key("review"));
    }

    #[test]
    fn merge_append_prompt() {
        let base = parse(
            r#"
checks:
  review:
    type: ai
    prompt: "Base prompt."
"#,
        );
        let mut overlay = base.clone();
        {
            let review = overlay.checks.get_mut("review").unwrap();
            review.prompt = None;
            review.append_prompt = Some("Extra instructions.".into());
        }
        let merged = base.merged_with(&overlay).unwrap();
        assert_eq!(
            merged.checks["review"].prompt.as_deref(),
            Some("Base prompt.\n\nExtra instructions.")
        );
        assert!(merged.checks["review"].append_prompt.is_none());
    }

    #[test]
    fn raw_merge_accepts_partial_check_overrides() {
        let base: Value = serde_json::json!({
            "checks": {
                "lint": { "type": "command", "exec": "lint", "tags": ["fast"] }
            }
        });
        let overlay: Value = serde_json::json!({
            "checks": {
                "lint": { "tags": ["slow"] },
                "extra": { "type": "log", "message": "added" }
            }
        });
        let merged = EngineConfig::from_merged_value(merge_documents(base, overlay)).unwrap();
        assert_eq!(merged.checks["lint"].check_type, "command");
        assert_eq!(merged.checks["lint"].tags, vec!["slow"]);
        assert_eq!(merged.checks["extra"].message.as_deref(), Some("added"));
    }

    #[test]
    fn tag_filter_matching() {
        let filter = TagFilter {
            include: vec!["ci".into()],
            exclude: vec!["slow".into()],
        };
        assert!(filter.matches(&["ci".into()]));
        assert!(!filter.matches(&["ci".into(), "slow".into()]));
        assert!(!filter.matches(&["local".into()]));

        let open = TagFilter::default();
        assert!(open.matches(&[]));
    }
}
