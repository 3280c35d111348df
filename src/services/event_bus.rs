//! Event bus: sequenced lifecycle and telemetry event distribution.
//!
//! Broadcast-based fan-out with monotonic sequence numbers plus
//! synchronous delivery to registered sinks (NDJSON writer, metrics).
//! Publishing never blocks on slow subscribers; lagging broadcast
//! receivers miss events rather than stalling the engine.

use chrono::Utc;
use serde_json::Value;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::domain::models::event::{EngineEvent, EnginePayload};
use crate::domain::ports::event_sink::EventSink;

/// Event bus configuration.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Broadcast channel capacity before lagging receivers drop events.
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { channel_capacity: 1024 }
    }
}

pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
    sequence: AtomicU64,
    sinks: Mutex<Vec<Arc<dyn EventSink>>>,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Arc<Self> {
        let (sender, _) = broadcast::channel(config.channel_capacity);
        Arc::new(Self {
            sender,
            sequence: AtomicU64::new(0),
            sinks: Mutex::new(Vec::new()),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(EventBusConfig::default())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.sinks.lock().expect("sink registry poisoned").push(sink);
    }

    /// Publish a payload for a session. Returns the sequenced envelope.
    pub fn publish(&self, session_id: Uuid, payload: EnginePayload) -> EngineEvent {
        let event = EngineEvent {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            session_id,
            timestamp: Utc::now(),
            payload,
        };
        for sink in self.sinks.lock().expect("sink registry poisoned").iter() {
            sink.emit(&event);
        }
        let _ = self.sender.send(event.clone());
        event
    }

    /// Publish a named telemetry point.
    pub fn telemetry(&self, session_id: Uuid, name: &str, fields: Value) -> EngineEvent {
        self.publish(
            session_id,
            EnginePayload::Telemetry { name: name.to_string(), fields },
        )
    }
}

/// NDJSON sink writing one event per line to any writer.
pub struct NdjsonSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> NdjsonSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer: Mutex::new(writer) }
    }
}

impl<W: Write + Send> EventSink for NdjsonSink<W> {
    fn emit(&self, event: &EngineEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            let mut writer = self.writer.lock().expect("ndjson writer poisoned");
            let _ = writeln!(writer, "{line}");
        }
    }
}

/// Sink that retains events in memory, for tests and debug bundles.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().expect("collector poisoned").clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|e| e.payload.label().to_string())
            .collect()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: &EngineEvent) {
        self.events.lock().expect("collector poisoned").push(event.clone());
    }
}
