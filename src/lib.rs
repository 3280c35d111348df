//! Vigil - configuration-driven analysis and automation engine
//!
//! Users declare a directed graph of checks in a configuration document;
//! each check invokes a typed provider (AI model, shell command, HTTP call,
//! scripted expression, memory op, log emitter), and the engine coordinates
//! execution: wave planning, dependency gating with OR groups, forEach
//! fan-out, conditional gating, failure handling, rerouting with a loop
//! budget, and a commit-ordered journal providing scoped context views.

pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod providers;
pub mod services;

// Re-export key types for convenience
pub use domain::errors::{EngineError, EngineResult};
pub use domain::models::{AnalysisResult, EngineConfig, RunInput, RunOptions};
pub use services::runner::{EngineRunner, ExecutionHooks};
