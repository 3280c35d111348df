//! Run-level models: inputs, mutable run state, statistics, and the final
//! analysis result returned to the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use uuid::Uuid;

use super::issue::{Issue, ReviewSummary, Severity};
use super::scope::Scope;

/// Status of one changed file in the run input bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Added,
    Modified,
    Removed,
    Renamed,
}

/// One changed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub status: FileStatus,
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub deletions: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
}

/// Repository context when the run originates from a hosted repo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub owner: String,
    pub name: String,
}

/// Author permission levels, ordered weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    None,
    FirstTimer,
    Contributor,
    Collaborator,
    Member,
    Owner,
}

impl PermissionLevel {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "owner" => Self::Owner,
            "member" => Self::Member,
            "collaborator" => Self::Collaborator,
            "contributor" => Self::Contributor,
            "first_timer" | "first_time_contributor" => Self::FirstTimer,
            _ => Self::None,
        }
    }
}

/// The per-run input bundle handed to the engine by its caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunInput {
    pub title: String,
    pub author: String,
    /// Raw association string, e.g. `owner`, `member`, `collaborator`.
    pub author_association: Option<String>,
    pub base_branch: String,
    pub head_branch: String,
    pub files: Vec<FileChange>,
    /// Trigger event, e.g. `manual`, `pr_opened`, `pr_updated`.
    pub event: String,
    pub repository: Option<RepositoryInfo>,
    /// Free-form metadata exposed to expressions.
    pub metadata: Value,
    pub debug: bool,
}

impl RunInput {
    pub fn manual() -> Self {
        Self { event: "manual".into(), metadata: Value::Null, ..Self::default() }
    }

    pub fn permission(&self) -> PermissionLevel {
        self.author_association
            .as_deref()
            .map_or(PermissionLevel::None, PermissionLevel::parse)
    }

    pub fn file_paths(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.path.as_str()).collect()
    }
}

/// Caller-controlled run options.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub working_dir: PathBuf,
    pub max_parallelism: usize,
    pub fail_fast: bool,
    /// Explicit check selection; empty means every eligible check.
    pub requested_checks: Vec<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            max_parallelism: 4,
            fail_fast: false,
            requested_checks: Vec::new(),
        }
    }
}

/// Why a check was skipped. Order encodes precedence: when several reasons
/// apply, the strongest (lowest discriminant) is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    PolicyDenied,
    IfCondition,
    DependencyFailed,
    ForEachEmpty,
    FailFast,
}

impl SkipReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PolicyDenied => "policy_denied",
            Self::IfCondition => "if_condition",
            Self::DependencyFailed => "dependency_failed",
            Self::ForEachEmpty => "forEach_empty",
            Self::FailFast => "fail_fast",
        }
    }

    /// Keep the stronger of two reasons.
    pub fn strongest(a: Self, b: Self) -> Self {
        std::cmp::min(a, b)
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Issue counts bucketed by severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueCounts {
    pub critical: usize,
    pub error: usize,
    pub warning: usize,
    pub info: usize,
}

impl IssueCounts {
    pub fn add(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::Error => self.error += 1,
            Severity::Warning => self.warning += 1,
            Severity::Info => self.info += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.critical + self.error + self.warning + self.info
    }
}

/// Per-check aggregate statistics, created lazily on first reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckStats {
    pub total_runs: u32,
    pub successful_runs: u32,
    pub failed_runs: u32,
    pub skipped: bool,
    pub skip_reason: Option<SkipReason>,
    /// The condition text that caused an `if` skip, when applicable.
    pub skip_condition: Option<String>,
    pub total_duration_ms: u64,
    pub per_iteration_duration_ms: Vec<u64>,
    pub outputs_produced: u32,
    /// First few forEach items, for result summaries.
    pub for_each_preview: Vec<Value>,
    pub issues_by_severity: IssueCounts,
    pub error_message: Option<String>,
}

impl CheckStats {
    /// Record one completed invocation.
    pub fn record_run(&mut self, success: bool, duration_ms: u64) {
        self.total_runs += 1;
        if success {
            self.successful_runs += 1;
        } else {
            self.failed_runs += 1;
        }
        self.total_duration_ms += duration_ms;
        self.per_iteration_duration_ms.push(duration_ms);
    }

    pub fn record_skip(&mut self, reason: SkipReason, condition: Option<String>) {
        self.skipped = true;
        self.skip_reason = Some(match self.skip_reason {
            Some(existing) => SkipReason::strongest(existing, reason),
            None => reason,
        });
        if condition.is_some() {
            self.skip_condition = condition;
        }
    }

    pub fn record_issues(&mut self, issues: &[Issue]) {
        for issue in issues {
            self.issues_by_severity.add(issue.severity);
        }
    }

    /// Invariant: a check that only ever failed belongs in the failed set.
    pub fn is_completely_failed(&self) -> bool {
        self.total_runs > 0 && self.successful_runs == 0 && self.failed_runs > 0
    }
}

/// A routing-requested forward run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardRun {
    pub origin: String,
    pub target: String,
    /// Event to run the target under; inherits the run event when absent.
    pub event: Option<String>,
}

/// Mutable state of one engine run.
#[derive(Debug, Default)]
pub struct RunState {
    pub session_id: Uuid,
    /// Wave counter; incremented each planning pass.
    pub wave: u64,
    pub completed: HashSet<String>,
    /// Checks completed in the current wave; drives `if` visibility and
    /// prevents double execution within a wave.
    pub current_wave_completions: HashSet<String>,
    pub skipped: HashMap<String, SkipReason>,
    pub failed: HashSet<String>,
    pub active: HashSet<String>,
    pub stats: HashMap<String, CheckStats>,
    pub routing_loop_count: u32,
    /// Guard against duplicate forward-run emission: (origin, target, wave).
    pub forward_guard: HashSet<(String, String, u64)>,
    pub pending_forward: Vec<ForwardRun>,
    /// Per-item scope overrides scheduled by routing for the next run of a
    /// check.
    pub scope_overrides: HashMap<String, Scope>,
    /// Event overrides from `goto_event`, applied to the target's next run.
    pub event_overrides: HashMap<String, String>,
    /// Logical (fail_if) retry counts per check.
    pub logical_retries: HashMap<String, u32>,
    pub fail_fast_triggered: bool,
}

impl RunState {
    pub fn new(session_id: Uuid) -> Self {
        Self { session_id, ..Self::default() }
    }

    pub fn stats_mut(&mut self, check_id: &str) -> &mut CheckStats {
        self.stats.entry(check_id.to_string()).or_default()
    }

    pub fn is_skipped(&self, check_id: &str) -> bool {
        self.skipped.contains_key(check_id)
    }

    pub fn is_failed(&self, check_id: &str) -> bool {
        self.failed.contains(check_id)
    }

    /// Register a forward run unless the (origin, target, wave) guard has
    /// already fired.
    pub fn request_forward(&mut self, origin: &str, target: &str, event: Option<String>) -> bool {
        let key = (origin.to_string(), target.to_string(), self.wave);
        if !self.forward_guard.insert(key) {
            return false;
        }
        self.pending_forward.push(ForwardRun {
            origin: origin.to_string(),
            target: target.to_string(),
            event,
        });
        true
    }
}

/// Final result of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository_info: Option<RepositoryInfo>,
    pub review_summary: ReviewSummary,
    pub execution_time_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub checks_executed: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_statistics: Option<HashMap<String, CheckStats>>,
    /// Per-session output history: check id → outputs in commit order.
    pub output_history: HashMap<String, Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<Value>,
}

impl AnalysisResult {
    /// True when any issue is a routing loop-budget breach.
    pub fn loop_budget_exceeded(&self) -> bool {
        self.review_summary
            .issues
            .iter()
            .any(|i| i.rule_id.ends_with("/routing/loop_budget_exceeded"))
    }

    /// True when a top-level system error aborted the run.
    pub fn has_system_error(&self) -> bool {
        self.review_summary.issues.iter().any(|i| i.rule_id == "system/error")
    }
}
