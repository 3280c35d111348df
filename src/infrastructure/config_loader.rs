//! Configuration loading: YAML file, `extends` chain resolution, and an
//! environment-variable overlay.
//!
//! Precedence (lowest to highest): extends chain (depth-first, earlier
//! refs first), the document itself, then `VIGIL_*` environment variables.

use figment::providers::{Env, Serialized};
use figment::Figment;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::domain::errors::ConfigError;
use crate::domain::models::config::{merge_documents, EngineConfig, ExtendsRef};

const MAX_EXTENDS_DEPTH: usize = 10;

/// Loader options.
#[derive(Debug, Clone, Default)]
pub struct LoaderOptions {
    /// Permit `extends` refs that are http(s) URLs.
    pub allow_remote_extends: bool,
}

pub struct ConfigLoader {
    options: LoaderOptions,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new(LoaderOptions::default())
    }
}

impl ConfigLoader {
    pub fn new(options: LoaderOptions) -> Self {
        Self { options }
    }

    /// Load a configuration document, resolving its `extends` chain, and
    /// overlay `VIGIL_*` environment variables.
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<EngineConfig, ConfigError> {
        let path = path.as_ref();
        let mut visited = HashSet::new();
        let merged = self.load_value(path, &mut visited, 0).await?;
        let config = EngineConfig::from_merged_value(merged)?;

        // Environment overlay via figment, mirroring the hierarchical
        // pattern used for process-level settings.
        let config: EngineConfig = Figment::new()
            .merge(Serialized::defaults(config))
            .merge(Env::prefixed("VIGIL_").split("__"))
            .extract()
            .map_err(|e| ConfigError::InvalidValue {
                field: "<env overlay>".into(),
                reason: e.to_string(),
            })?;

        let mut config = config;
        config.assign_ids();
        config.validate()?;
        Ok(config)
    }

    /// Parse one document and fold its `extends` chain underneath it.
    async fn load_value(
        &self,
        path: &Path,
        visited: &mut HashSet<String>,
        depth: usize,
    ) -> Result<Value, ConfigError> {
        if depth > MAX_EXTENDS_DEPTH {
            return Err(ConfigError::ExtendsTooDeep(MAX_EXTENDS_DEPTH));
        }
        let canonical = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf())
            .to_string_lossy()
            .into_owned();
        if !visited.insert(canonical.clone()) {
            return Err(ConfigError::ExtendsCycle(canonical));
        }

        let source = std::fs::read_to_string(path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound(path.display().to_string())
            } else {
                ConfigError::Io(err.to_string())
            }
        })?;
        let value = self
            .fold_extends(&source, &canonical, path.parent(), visited, depth)
            .await?;
        visited.remove(&canonical);
        Ok(value)
    }

    async fn fold_extends(
        &self,
        source: &str,
        origin: &str,
        base_dir: Option<&Path>,
        visited: &mut HashSet<String>,
        depth: usize,
    ) -> Result<Value, ConfigError> {
        let yaml: serde_yaml::Value =
            serde_yaml::from_str(source).map_err(|e| ConfigError::InvalidYaml {
                path: origin.to_string(),
                reason: e.to_string(),
            })?;
        let mut document: Value =
            serde_json::to_value(yaml).map_err(|e| ConfigError::InvalidYaml {
                path: origin.to_string(),
                reason: e.to_string(),
            })?;

        let extends = document
            .as_object_mut()
            .and_then(|map| map.remove("extends"))
            .and_then(|v| serde_json::from_value::<ExtendsRef>(v).ok());

        let Some(extends) = extends else {
            return Ok(document);
        };

        let mut base = Value::Object(serde_json::Map::new());
        for reference in extends.refs() {
            debug!(reference, depth, "resolving extends");
            let parent = if reference.starts_with("http://") || reference.starts_with("https://")
            {
                self.fetch_remote(reference, visited, depth).await?
            } else {
                let resolved = match base_dir {
                    Some(dir) => dir.join(reference),
                    None => PathBuf::from(reference),
                };
                Box::pin(self.load_value(&resolved, visited, depth + 1)).await?
            };
            base = merge_documents(base, parent);
        }

        Ok(merge_documents(base, document))
    }

    async fn fetch_remote(
        &self,
        url: &str,
        visited: &mut HashSet<String>,
        depth: usize,
    ) -> Result<Value, ConfigError> {
        if !self.options.allow_remote_extends {
            return Err(ConfigError::RemoteExtendsDisabled(url.to_string()));
        }
        if !visited.insert(url.to_string()) {
            return Err(ConfigError::ExtendsCycle(url.to_string()));
        }
        let body = reqwest::get(url)
            .await
            .map_err(|e| ConfigError::RemoteExtendsFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?
            .error_for_status()
            .map_err(|e| ConfigError::RemoteExtendsFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?
            .text()
            .await
            .map_err(|e| ConfigError::RemoteExtendsFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        let value = Box::pin(self.fold_extends(&body, url, None, visited, depth + 1)).await?;
        visited.remove(url);
        Ok(value)
    }
}

/// Validate a document without running it; returns the loaded config on
/// success so callers can report check counts.
pub async fn validate_file(
    path: impl AsRef<Path>,
    options: LoaderOptions,
) -> Result<EngineConfig, ConfigError> {
    ConfigLoader::new(options).load(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn loads_simple_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "vigil.yaml",
            r#"
max_parallelism: 2
checks:
  hello:
    type: log
    message: "hi"
"#,
        );
        let config = ConfigLoader::default().load(&path).await.unwrap();
        assert_eq!(config.max_parallelism, Some(2));
        assert_eq!(config.checks["hello"].id, "hello");
    }

    #[tokio::test]
    async fn extends_merges_parent_first() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "base.yaml",
            r#"
env:
  SHARED: base
  KEPT: yes
checks:
  lint:
    type: command
    exec: "lint"
"#,
        );
        let path = write_file(
            dir.path(),
            "child.yaml",
            r#"
extends: base.yaml
env:
  SHARED: child
checks:
  lint:
    timeout: 5
"#,
        );
        let config = ConfigLoader::default().load(&path).await.unwrap();
        assert_eq!(config.env["SHARED"], "child");
        assert_eq!(config.env["KEPT"], "yes");
        assert_eq!(config.checks["lint"].check_type, "command");
        assert_eq!(config.checks["lint"].timeout, Some(5));
    }

    #[tokio::test]
    async fn extends_empty_on_disables_inherited_check() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "base.yaml",
            r#"
checks:
  noisy:
    type: log
    message: "x"
  kept:
    type: log
    message: "y"
"#,
        );
        let path = write_file(
            dir.path(),
            "child.yaml",
            r#"
extends: base.yaml
checks:
  noisy:
    on: []
"#,
        );
        let config = ConfigLoader::default().load(&path).await.unwrap();
        assert!(!config.checks.contains_key("noisy"));
        assert!(config.checks.contains_key("kept"));
    }

    #[tokio::test]
    async fn extends_cycle_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.yaml", "extends: b.yaml\n");
        let path = write_file(dir.path(), "b.yaml", "extends: a.yaml\n");
        let err = ConfigLoader::default().load(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::ExtendsCycle(_)));
    }

    #[tokio::test]
    async fn remote_extends_requires_opt_in() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "remote.yaml",
            "extends: https://example.invalid/base.yaml\n",
        );
        let err = ConfigLoader::default().load(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::RemoteExtendsDisabled(_)));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let err = ConfigLoader::default()
            .load("/definitely/not/here.yaml")
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn validation_runs_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "bad.yaml",
            r#"
checks:
  a:
    type: log
    message: "x"
    depends_on: [ghost]
"#,
        );
        let err = ConfigLoader::default().load(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDependency { .. }));
    }
}
