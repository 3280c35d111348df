//! Command provider: runs a templated shell line, captures stdout, and
//! applies the optional transform pipeline.
//!
//! Pipeline order: template-render the command, execute with a bounded
//! timeout, attempt a JSON parse of stdout, apply `transform` (template)
//! and then `transform_js` (sandbox). `transform_js` always receives the
//! raw stdout text as `output`.

use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::domain::errors::{ConfigError, ProviderError};
use crate::domain::models::check::CheckConfig;
use crate::domain::models::event::telemetry;
use crate::domain::models::issue::ReviewSummary;
use crate::domain::models::run::RunInput;
use crate::domain::ports::provider::{require_key, DependencyResults, Provider, ProviderContext};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Default)]
pub struct CommandProvider;

impl CommandProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Provider for CommandProvider {
    fn name(&self) -> &'static str {
        "command"
    }

    fn description(&self) -> &'static str {
        "Executes a shell command and captures its output"
    }

    fn validate_config(&self, check: &CheckConfig) -> Result<(), ConfigError> {
        if check.exec.is_none() {
            return Err(ConfigError::ProviderValidation {
                check: check.id.clone(),
                reason: "command checks require 'exec'".into(),
            });
        }
        Ok(())
    }

    #[instrument(skip_all, fields(check = %check.id))]
    async fn execute(
        &self,
        _run: &RunInput,
        check: &CheckConfig,
        _deps: &DependencyResults,
        ctx: &ProviderContext,
    ) -> Result<ReviewSummary, ProviderError> {
        let exec = require_key(self.name(), "exec", check.exec.as_ref())?;
        let command_line = ctx
            .templates
            .render_str(exec, &ctx.template_data)
            .unwrap_or_else(|_| exec.clone());

        if let Some(bus) = &ctx.events {
            bus.telemetry(
                ctx.session_id,
                telemetry::TOOL_CALL,
                serde_json::json!({
                    "check": check.id,
                    "scope": ctx.scope.to_string(),
                    "command": command_line,
                }),
            );
        }

        let stdout = self.run_command(&command_line, check, ctx).await?;
        let trimmed = stdout.trim().to_string();

        // Attempt structured output, fall back to the raw text.
        let mut output: Value = serde_json::from_str(&trimmed)
            .unwrap_or_else(|_| Value::String(trimmed.clone()));

        if let Some(transform) = &check.transform {
            let mut data = ctx.template_data.clone();
            if let Value::Object(map) = &mut data {
                map.insert("output".into(), output.clone());
            }
            match ctx.templates.render_str(transform, &data) {
                Ok(rendered) => {
                    let rendered = rendered.trim().to_string();
                    output = serde_json::from_str(&rendered)
                        .unwrap_or_else(|_| Value::String(rendered));
                }
                Err(err) => {
                    debug!(check = %check.id, error = %err, "transform template failed");
                }
            }
        }

        if let Some(transform_js) = &check.transform_js {
            // transform_js always sees the raw stdout text, not the parsed
            // or template-transformed value.
            let mut data = ctx.template_data.clone();
            if let Value::Object(map) = &mut data {
                map.insert("output".into(), Value::String(stdout.clone()));
            }
            output = ctx.sandbox.eval(transform_js, &data)?;
        }

        Ok(ReviewSummary::empty().with_output(output))
    }

    fn supported_keys(&self) -> &'static [&'static str] {
        &["exec", "env", "timeout", "transform", "transform_js"]
    }
}

impl CommandProvider {
    async fn run_command(
        &self,
        command_line: &str,
        check: &CheckConfig,
        ctx: &ProviderContext,
    ) -> Result<String, ProviderError> {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(command_line)
            .current_dir(&ctx.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &ctx.env {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|e| ProviderError::Subprocess(format!("spawn failed: {e}")))?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let timeout_secs = check.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);

        let wait = async {
            let mut stdout = String::new();
            let mut stderr = String::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_string(&mut stdout).await;
            }
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_string(&mut stderr).await;
            }
            let status = child
                .wait()
                .await
                .map_err(|e| ProviderError::Subprocess(format!("wait failed: {e}")))?;
            if !status.success() {
                let code = status.code().unwrap_or(-1);
                return Err(ProviderError::Subprocess(format!(
                    "exit code {code}: {}",
                    stderr.trim()
                )));
            }
            Ok(stdout)
        };

        tokio::select! {
            result = timeout(Duration::from_secs(timeout_secs), wait) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(ProviderError::Timeout(timeout_secs)),
                }
            }
            () = ctx.cancel.cancelled() => {
                // Dropping the wait future kills the child (kill_on_drop).
                Err(ProviderError::Cancelled)
            }
        }
    }
}
