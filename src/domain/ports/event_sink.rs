//! Pluggable sink for engine events.

use crate::domain::models::event::EngineEvent;

/// Receives every lifecycle and telemetry event. Implementations must be
/// cheap and non-blocking; slow sinks should buffer internally.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &EngineEvent);
}

/// Sink that drops everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &EngineEvent) {}
}
