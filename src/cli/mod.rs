//! CLI surface: argument parsing and exit-code mapping.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::domain::models::run::AnalysisResult;

/// Exit codes surfaced by the binary.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const CONFIG_INVALID: i32 = 1;
    pub const LOOP_BUDGET_EXCEEDED: i32 = 2;
    pub const FATAL_EXECUTION_ERROR: i32 = 3;
    pub const FAIL_FAST: i32 = 4;
}

#[derive(Parser, Debug)]
#[command(name = "vigil", version, about = "Configuration-driven analysis and automation engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute the checks of a configuration document.
    Run {
        /// Path to the configuration document.
        #[arg(short, long, default_value = ".vigil.yaml")]
        config: PathBuf,

        /// Run only these checks (and their dependencies). Repeatable.
        #[arg(long = "check")]
        checks: Vec<String>,

        /// Working directory for command providers and templates.
        #[arg(long, default_value = ".")]
        cwd: PathBuf,

        /// Trigger event name.
        #[arg(long, default_value = "manual")]
        event: String,

        /// Stop scheduling new levels after the first failed check.
        #[arg(long)]
        fail_fast: bool,

        /// Maximum concurrent checks per level.
        #[arg(long)]
        max_parallelism: Option<usize>,

        /// Allow http(s) `extends` references.
        #[arg(long)]
        allow_remote_extends: bool,

        /// Print the full result as JSON.
        #[arg(long)]
        output_json: bool,

        /// Stream engine events as NDJSON to stderr.
        #[arg(long)]
        ndjson_events: bool,
    },

    /// Validate a configuration document without executing it.
    Validate {
        #[arg(short, long, default_value = ".vigil.yaml")]
        config: PathBuf,

        #[arg(long)]
        allow_remote_extends: bool,
    },
}

/// Map a finished run to the documented exit codes.
pub fn exit_code_for(result: &AnalysisResult, fail_fast_triggered: bool) -> i32 {
    if result.has_system_error() {
        return exit_code::FATAL_EXECUTION_ERROR;
    }
    if result.loop_budget_exceeded() {
        return exit_code::LOOP_BUDGET_EXCEEDED;
    }
    if fail_fast_triggered {
        return exit_code::FAIL_FAST;
    }
    exit_code::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::issue::{Issue, ReviewSummary, Severity};
    use std::collections::HashMap;

    fn result_with(issues: Vec<Issue>) -> AnalysisResult {
        AnalysisResult {
            repository_info: None,
            review_summary: ReviewSummary { issues, ..ReviewSummary::empty() },
            execution_time_ms: 1,
            timestamp: chrono::Utc::now(),
            checks_executed: vec![],
            execution_statistics: None,
            output_history: HashMap::new(),
            debug: None,
        }
    }

    #[test]
    fn exit_codes_rank_severity() {
        assert_eq!(exit_code_for(&result_with(vec![]), false), exit_code::SUCCESS);
        assert_eq!(exit_code_for(&result_with(vec![]), true), exit_code::FAIL_FAST);

        let loops = result_with(vec![Issue::new(
            "a/routing/loop_budget_exceeded",
            "budget",
            Severity::Error,
        )]);
        assert_eq!(exit_code_for(&loops, false), exit_code::LOOP_BUDGET_EXCEEDED);

        let fatal = result_with(vec![Issue::new("system/error", "boom", Severity::Critical)]);
        assert_eq!(exit_code_for(&fatal, true), exit_code::FATAL_EXECUTION_ERROR);
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::parse_from([
            "vigil", "run", "--config", "conf.yaml", "--check", "lint", "--check", "test",
            "--fail-fast", "--output-json",
        ]);
        match cli.command {
            Commands::Run { config, checks, fail_fast, output_json, .. } => {
                assert_eq!(config, PathBuf::from("conf.yaml"));
                assert_eq!(checks, vec!["lint", "test"]);
                assert!(fail_fast);
                assert!(output_json);
            }
            Commands::Validate { .. } => panic!("expected run"),
        }
    }
}
