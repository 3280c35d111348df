//! Engine lifecycle and telemetry events.
//!
//! Events flow through the event bus to pluggable sinks. Lifecycle events
//! mirror the state machine; telemetry events carry the stable dotted names
//! consumed by trace tooling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::scope::Scope;

/// Stable telemetry event names.
pub mod telemetry {
    pub const ITERATION_START: &str = "iteration.start";
    pub const TOOL_CALL: &str = "tool.call";
    pub const AI_REQUEST: &str = "ai.request";
    pub const FAIL_IF_EVALUATED: &str = "fail_if.evaluated";
    pub const FAIL_IF_TRIGGERED: &str = "fail_if.triggered";
    pub const FOREACH_ITEM: &str = "foreach.item";
    pub const STATE_SNAPSHOT: &str = "state.snapshot";
}

/// Lifecycle and telemetry payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnginePayload {
    CheckScheduled {
        check_id: String,
        wave: u64,
    },
    CheckCompleted {
        check_id: String,
        scope: Scope,
        success: bool,
        duration_ms: u64,
        issue_count: usize,
    },
    CheckErrored {
        check_id: String,
        scope: Scope,
        error: String,
    },
    LevelReady {
        wave: u64,
        checks: Vec<String>,
    },
    LevelDepleted {
        wave: u64,
    },
    ForwardRunRequested {
        origin: String,
        target: String,
        wave: u64,
    },
    WaveRetry {
        wave: u64,
    },
    /// Named telemetry point with free-form fields.
    Telemetry {
        name: String,
        fields: Value,
    },
}

impl EnginePayload {
    /// Short label used for NDJSON sinks and log lines.
    pub fn label(&self) -> &str {
        match self {
            Self::CheckScheduled { .. } => "check.scheduled",
            Self::CheckCompleted { .. } => "check.completed",
            Self::CheckErrored { .. } => "check.errored",
            Self::LevelReady { .. } => "level.ready",
            Self::LevelDepleted { .. } => "level.depleted",
            Self::ForwardRunRequested { .. } => "forward_run.requested",
            Self::WaveRetry { .. } => "wave.retry",
            Self::Telemetry { name, .. } => name,
        }
    }
}

/// Envelope with sequencing and session metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub sequence: u64,
    pub session_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EnginePayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_stable() {
        let payload = EnginePayload::Telemetry {
            name: telemetry::FAIL_IF_TRIGGERED.into(),
            fields: Value::Null,
        };
        assert_eq!(payload.label(), "fail_if.triggered");
        assert_eq!(
            EnginePayload::LevelDepleted { wave: 1 }.label(),
            "level.depleted"
        );
    }
}
