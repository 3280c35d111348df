//! Vigil CLI entry point

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use vigil::cli::{exit_code, exit_code_for, Cli, Commands};
use vigil::domain::models::run::{RunInput, RunOptions, SkipReason};
use vigil::infrastructure::config_loader::{ConfigLoader, LoaderOptions};
use vigil::infrastructure::logging::{self, LogFormat};
use vigil::services::event_bus::NdjsonSink;
use vigil::services::runner::EngineRunner;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let format = if cli.json_logs { LogFormat::Json } else { LogFormat::Pretty };
    logging::init(format, cli.verbose);

    match cli.command {
        Commands::Validate { config, allow_remote_extends } => {
            let loader = ConfigLoader::new(LoaderOptions { allow_remote_extends });
            match loader.load(&config).await {
                Ok(loaded) => {
                    println!("ok: {} checks declared", loaded.checks.len());
                    Ok(())
                }
                Err(err) => {
                    eprintln!("configuration invalid: {err}");
                    std::process::exit(exit_code::CONFIG_INVALID);
                }
            }
        }
        Commands::Run {
            config,
            checks,
            cwd,
            event,
            fail_fast,
            max_parallelism,
            allow_remote_extends,
            output_json,
            ndjson_events,
        } => {
            let loader = ConfigLoader::new(LoaderOptions { allow_remote_extends });
            let loaded = match loader.load(&config).await {
                Ok(loaded) => loaded,
                Err(err) => {
                    eprintln!("configuration invalid: {err}");
                    std::process::exit(exit_code::CONFIG_INVALID);
                }
            };

            let options = RunOptions {
                working_dir: cwd.clone(),
                max_parallelism: max_parallelism
                    .or(loaded.max_parallelism)
                    .unwrap_or(4),
                fail_fast: fail_fast || loaded.fail_fast.unwrap_or(false),
                requested_checks: checks,
            };

            let mut runner = EngineRunner::new(loaded, cwd);
            if ndjson_events {
                runner = runner.with_event_sink(Arc::new(NdjsonSink::new(std::io::stderr())));
            }

            let mut input = RunInput::manual();
            input.event = event;

            let result = runner
                .run(input, options)
                .await
                .context("engine run failed")?;

            let fail_fast_triggered = result
                .execution_statistics
                .as_ref()
                .is_some_and(|stats| {
                    stats
                        .values()
                        .any(|s| s.skip_reason == Some(SkipReason::FailFast))
                });

            if output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_summary(&result);
            }

            std::process::exit(exit_code_for(&result, fail_fast_triggered));
        }
    }
}

fn print_summary(result: &vigil::domain::models::run::AnalysisResult) {
    println!(
        "{} checks executed in {}ms",
        result.checks_executed.len(),
        result.execution_time_ms
    );
    for issue in &result.review_summary.issues {
        match (&issue.file, issue.line) {
            (Some(file), Some(line)) => {
                println!("[{}] {} — {} ({file}:{line})", issue.severity, issue.rule_id, issue.message);
            }
            _ => println!("[{}] {} — {}", issue.severity, issue.rule_id, issue.message),
        }
    }
    if let Some(stats) = &result.execution_statistics {
        for (id, s) in stats {
            if s.skipped {
                let reason = s
                    .skip_reason
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "unknown".into());
                println!("skipped {id}: {reason}");
            }
        }
    }
}
