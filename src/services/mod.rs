//! Execution-core services.

pub mod context_view;
pub mod dispatcher;
pub mod event_bus;
pub mod gating;
pub mod journal;
pub mod memory_service;
pub mod planner;
pub mod retry;
pub mod routing;
pub mod runner;
pub mod sandbox;
pub mod stats;
pub mod template;

pub use context_view::ContextView;
pub use dispatcher::{LevelDispatcher, LevelOutcome};
pub use event_bus::{CollectingSink, EventBus, EventBusConfig, NdjsonSink};
pub use gating::{DependencyGate, GateDecision};
pub use journal::ExecutionJournal;
pub use memory_service::MemoryStore;
pub use planner::{Plan, WavePlanner};
pub use retry::RetryPolicy;
pub use routing::{RoutingEngine, RoutingOutcome};
pub use runner::{EngineRunner, ExecutionHooks};
pub use sandbox::{EvalContextBuilder, Sandbox};
pub use stats::MetricsRegistry;
pub use template::TemplateService;
