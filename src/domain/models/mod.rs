//! Domain models: pure data with validation, no infrastructure concerns.

pub mod check;
pub mod config;
pub mod event;
pub mod issue;
pub mod journal;
pub mod run;
pub mod scope;

pub use check::{
    CheckConfig, Criticality, FailureCondition, FanoutMode, RetryConfig, RoutingBlock, SchemaRef,
    TemplateRef,
};
pub use config::{EngineConfig, ExtendsRef, MemoryConfig, RoutingConfig, TagFilter};
pub use event::{telemetry, EngineEvent, EnginePayload};
pub use issue::{Issue, ReviewSummary, Severity};
pub use journal::JournalEntry;
pub use run::{
    AnalysisResult, CheckStats, FileChange, FileStatus, ForwardRun, IssueCounts, PermissionLevel,
    RepositoryInfo, RunInput, RunOptions, RunState, SkipReason,
};
pub use scope::{Scope, ScopeSegment};
