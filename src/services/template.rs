//! Template rendering for check content.
//!
//! Templates resolve in order: inline content, a `.liquid` file under the
//! project root, then a built-in template for the check's schema. Rendering
//! never fails the check: errors are logged once and yield no content.

use serde_json::Value;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use tera::Tera;
use tracing::warn;

use crate::domain::models::check::{CheckConfig, SchemaRef, TemplateRef};
use crate::domain::models::issue::ReviewSummary;
use crate::domain::models::run::PermissionLevel;

/// Mandated suffix for template files.
pub const TEMPLATE_SUFFIX: &str = ".liquid";

/// Upper bound for `readfile` payloads.
const READFILE_MAX_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathRejection {
    Empty,
    Absolute,
    ParentTraversal,
    HomeReference,
    NulByte,
    WrongSuffix,
}

impl std::fmt::Display for PathRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            Self::Empty => "empty path",
            Self::Absolute => "absolute path",
            Self::ParentTraversal => "parent traversal",
            Self::HomeReference => "home reference",
            Self::NulByte => "NUL byte",
            Self::WrongSuffix => "missing .liquid suffix",
        };
        f.write_str(reason)
    }
}

/// Template renderer confined to a project root.
#[derive(Debug, Clone)]
pub struct TemplateService {
    project_root: PathBuf,
    /// Candidate directories searched for built-in schema templates.
    builtin_dirs: Vec<PathBuf>,
}

impl TemplateService {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let mut builtin_dirs = Vec::new();
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                builtin_dirs.push(dir.join("templates"));
            }
        }
        builtin_dirs.push(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("templates"));
        Self { project_root: project_root.into(), builtin_dirs }
    }

    pub fn with_builtin_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.builtin_dirs = dirs;
        self
    }

    /// Validate a user-supplied template path and confine it to the project
    /// root.
    pub fn resolve_template_path(&self, raw: &str) -> Result<PathBuf, PathRejection> {
        Self::sanitize(raw, true)?;
        Ok(self.project_root.join(raw))
    }

    fn sanitize(raw: &str, require_suffix: bool) -> Result<(), PathRejection> {
        if raw.is_empty() {
            return Err(PathRejection::Empty);
        }
        if raw.contains('\0') {
            return Err(PathRejection::NulByte);
        }
        if raw.starts_with('~') {
            return Err(PathRejection::HomeReference);
        }
        let path = Path::new(raw);
        if path.is_absolute() {
            return Err(PathRejection::Absolute);
        }
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(PathRejection::ParentTraversal);
        }
        if require_suffix && !raw.ends_with(TEMPLATE_SUFFIX) {
            return Err(PathRejection::WrongSuffix);
        }
        Ok(())
    }

    /// Render an inline template string against a data object.
    pub fn render_str(&self, source: &str, data: &Value) -> Result<String, tera::Error> {
        let mut tera = Tera::default();
        register_extensions(&mut tera, self.project_root.clone());
        tera.add_raw_template("inline", source)?;
        let context = match data {
            Value::Object(_) => tera::Context::from_value(data.clone())?,
            _ => tera::Context::new(),
        };
        tera.render("inline", &context)
    }

    /// Find the template source for a check: inline content, project file,
    /// then built-in schema template.
    fn template_source(&self, check: &CheckConfig) -> Option<String> {
        match &check.template {
            Some(TemplateRef::Inline { content }) => return Some(content.clone()),
            Some(TemplateRef::Path(path)) => {
                match self.resolve_template_path(path) {
                    Ok(resolved) => match std::fs::read_to_string(&resolved) {
                        Ok(source) => return Some(source),
                        Err(err) => {
                            warn!(check = %check.id, path = %resolved.display(), error = %err,
                                  "template file unreadable");
                            return None;
                        }
                    },
                    Err(rejection) => {
                        warn!(check = %check.id, path = %path, reason = %rejection,
                              "template path rejected");
                        return None;
                    }
                }
            }
            None => {}
        }

        // Built-in template for the schema, searched across candidate dirs.
        let schema = check.schema.as_ref().and_then(SchemaRef::label)?;
        for dir in &self.builtin_dirs {
            let candidate = dir.join(format!("{schema}{TEMPLATE_SUFFIX}"));
            if let Ok(source) = std::fs::read_to_string(&candidate) {
                return Some(source);
            }
        }
        None
    }

    /// Render the content for a completed check. Never errors; template
    /// problems are logged and produce no content.
    pub fn render_check_content(
        &self,
        check: &CheckConfig,
        summary: &ReviewSummary,
        data: &Value,
    ) -> Option<String> {
        // `plain` bypasses templating entirely.
        if check.schema.as_ref().is_some_and(SchemaRef::is_plain) {
            return Some(
                summary
                    .issues
                    .first()
                    .map(|i| i.message.clone())
                    .unwrap_or_default(),
            );
        }

        if let Some(source) = self.template_source(check) {
            return match self.render_str(&source, data) {
                Ok(rendered) => Some(rendered),
                Err(err) => {
                    warn!(check = %check.id, error = %err, "template render failed");
                    None
                }
            };
        }

        // Default for non-plain schemas with findings: a bullet list.
        if !summary.issues.is_empty() {
            let lines: Vec<String> = summary
                .issues
                .iter()
                .map(|i| match (&i.file, i.line) {
                    (Some(file), Some(line)) => {
                        format!("- [{}] {} ({file}:{line})", i.severity, i.message)
                    }
                    (Some(file), None) => format!("- [{}] {} ({file})", i.severity, i.message),
                    _ => format!("- [{}] {}", i.severity, i.message),
                })
                .collect();
            return Some(lines.join("\n"));
        }

        None
    }
}

/// Register the whitelisted filter/function extension set.
fn register_extensions(tera: &mut Tera, project_root: PathBuf) {
    tera.register_filter("parse_json", parse_json_filter);
    tera.register_filter("safe_label", safe_label_filter);
    tera.register_filter("safe_label_list", safe_label_list_filter);
    tera.register_filter("unescape_newlines", unescape_newlines_filter);
    tera.register_filter("has_min_permission", has_min_permission_filter);
    tera.register_function("readfile", ReadFile { project_root });
}

fn parse_json_filter(
    value: &Value,
    _args: &HashMap<String, Value>,
) -> tera::Result<Value> {
    let text = value
        .as_str()
        .ok_or_else(|| tera::Error::msg("parse_json expects a string"))?;
    serde_json::from_str(text).map_err(|e| tera::Error::msg(format!("parse_json: {e}")))
}

fn safe_label(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ':' || *c == '/')
        .collect()
}

fn safe_label_filter(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    let text = value
        .as_str()
        .ok_or_else(|| tera::Error::msg("safe_label expects a string"))?;
    Ok(Value::String(safe_label(text)))
}

fn safe_label_list_filter(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    let items = value
        .as_array()
        .ok_or_else(|| tera::Error::msg("safe_label_list expects an array"))?;
    let labels: Vec<String> = items
        .iter()
        .filter_map(Value::as_str)
        .map(safe_label)
        .filter(|s| !s.is_empty())
        .collect();
    Ok(Value::String(labels.join(", ")))
}

fn unescape_newlines_filter(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    let text = value
        .as_str()
        .ok_or_else(|| tera::Error::msg("unescape_newlines expects a string"))?;
    Ok(Value::String(text.replace("\\n", "\n")))
}

/// `author_association | has_min_permission(level="member")`
fn has_min_permission_filter(
    value: &Value,
    args: &HashMap<String, Value>,
) -> tera::Result<Value> {
    let association = value.as_str().unwrap_or("none");
    let level = args
        .get("level")
        .and_then(Value::as_str)
        .ok_or_else(|| tera::Error::msg("has_min_permission requires level="))?;
    Ok(Value::Bool(
        PermissionLevel::parse(association) >= PermissionLevel::parse(level),
    ))
}

/// `readfile(path="docs/notes.md")` — bounded, confined to the project root.
struct ReadFile {
    project_root: PathBuf,
}

impl tera::Function for ReadFile {
    fn call(&self, args: &HashMap<String, Value>) -> tera::Result<Value> {
        let raw = args
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| tera::Error::msg("readfile requires path="))?;
        TemplateService::sanitize(raw, false)
            .map_err(|r| tera::Error::msg(format!("readfile path rejected: {r}")))?;
        let full = self.project_root.join(raw);
        let meta = std::fs::metadata(&full)
            .map_err(|e| tera::Error::msg(format!("readfile: {e}")))?;
        if meta.len() > READFILE_MAX_BYTES {
            return Err(tera::Error::msg("readfile: file exceeds size bound"));
        }
        let content = std::fs::read_to_string(&full)
            .map_err(|e| tera::Error::msg(format!("readfile: {e}")))?;
        Ok(Value::String(content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::issue::{Issue, Severity};
    use serde_json::json;
    use std::io::Write;

    fn service() -> TemplateService {
        TemplateService::new(".").with_builtin_dirs(vec![])
    }

    #[test]
    fn renders_inline_with_data() {
        let rendered = service()
            .render_str("hi {{ output }}", &json!({"output": "x"}))
            .unwrap();
        assert_eq!(rendered, "hi x");
    }

    #[test]
    fn rejects_hostile_paths() {
        let svc = service();
        assert_eq!(svc.resolve_template_path(""), Err(PathRejection::Empty));
        assert_eq!(
            svc.resolve_template_path("/etc/passwd.liquid"),
            Err(PathRejection::Absolute)
        );
        assert_eq!(
            svc.resolve_template_path("../up.liquid"),
            Err(PathRejection::ParentTraversal)
        );
        assert_eq!(
            svc.resolve_template_path("a/../../b.liquid"),
            Err(PathRejection::ParentTraversal)
        );
        assert_eq!(
            svc.resolve_template_path("~/home.liquid"),
            Err(PathRejection::HomeReference)
        );
        assert_eq!(
            svc.resolve_template_path("plain.txt"),
            Err(PathRejection::WrongSuffix)
        );
        assert!(svc.resolve_template_path("sub/tpl.liquid").is_ok());
    }

    #[test]
    fn plain_schema_returns_first_issue_message() {
        let mut check = CheckConfig::new("a", "ai");
        check.schema = Some(SchemaRef::Name("plain".into()));
        let summary = ReviewSummary::empty().with_issues(vec![
            Issue::new("a/x", "first finding", Severity::Warning),
            Issue::new("a/y", "second", Severity::Info),
        ]);
        let content = service()
            .render_check_content(&check, &summary, &json!({}))
            .unwrap();
        assert_eq!(content, "first finding");

        let empty = service()
            .render_check_content(&check, &ReviewSummary::empty(), &json!({}))
            .unwrap();
        assert_eq!(empty, "");
    }

    #[test]
    fn default_bullet_list_for_issues_without_template() {
        let check = CheckConfig::new("a", "ai");
        let summary = ReviewSummary::empty().with_issues(vec![Issue::new(
            "a/x",
            "watch out",
            Severity::Error,
        )
        .with_file("src/lib.rs", Some(10))]);
        let content = service()
            .render_check_content(&check, &summary, &json!({}))
            .unwrap();
        assert_eq!(content, "- [error] watch out (src/lib.rs:10)");
    }

    #[test]
    fn render_errors_yield_none() {
        let mut check = CheckConfig::new("a", "log");
        check.template = Some(TemplateRef::Inline {
            content: "{{ broken ".into(),
        });
        let summary = ReviewSummary::empty();
        assert!(service()
            .render_check_content(&check, &summary, &json!({}))
            .is_none());
    }

    #[test]
    fn filters_behave() {
        let svc = service();
        let rendered = svc
            .render_str("{{ label | safe_label }}", &json!({"label": "a b!c:d/e#"}))
            .unwrap();
        assert_eq!(rendered, "abc:d/e");

        let rendered = svc
            .render_str(
                "{{ labels | safe_label_list }}",
                &json!({"labels": ["x y", "a:b"]}),
            )
            .unwrap();
        assert_eq!(rendered, "xy, a:b");

        let rendered = svc
            .render_str(
                "{{ text | unescape_newlines }}",
                &json!({"text": "a\\nb"}),
            )
            .unwrap();
        assert_eq!(rendered, "a\nb");

        let rendered = svc
            .render_str(
                "{% set parsed = raw | parse_json %}{{ parsed.k }}",
                &json!({"raw": "{\"k\": 42}"}),
            )
            .unwrap();
        assert_eq!(rendered, "42");

        let rendered = svc
            .render_str(
                "{{ assoc | has_min_permission(level=\"member\") }}",
                &json!({"assoc": "owner"}),
            )
            .unwrap();
        assert_eq!(rendered, "true");
    }

    #[test]
    fn readfile_is_confined_and_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("note.txt")).unwrap();
        writeln!(file, "hello").unwrap();

        let svc = TemplateService::new(dir.path()).with_builtin_dirs(vec![]);
        let rendered = svc
            .render_str("{{ readfile(path=\"note.txt\") }}", &json!({}))
            .unwrap();
        assert_eq!(rendered.trim(), "hello");

        assert!(svc
            .render_str("{{ readfile(path=\"../escape.txt\") }}", &json!({}))
            .is_err());
        assert!(svc
            .render_str("{{ readfile(path=\"/etc/passwd\") }}", &json!({}))
            .is_err());
    }

    #[test]
    fn builtin_schema_template_lookup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("code-review.liquid"),
            "{{ issues | length }} findings",
        )
        .unwrap();

        let mut check = CheckConfig::new("a", "ai");
        check.schema = Some(SchemaRef::Name("code-review".into()));
        let svc = TemplateService::new(".").with_builtin_dirs(vec![dir.path().to_path_buf()]);
        let summary = ReviewSummary::empty();
        let content = svc
            .render_check_content(&check, &summary, &json!({"issues": [1, 2]}))
            .unwrap();
        assert_eq!(content, "2 findings");
    }
}
