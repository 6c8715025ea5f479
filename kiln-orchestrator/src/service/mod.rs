//! Service Module
//!
//! Business logic layer for the orchestrator.
//! Services orchestrate between repositories, the filesystem and the
//! external collaborators (source control, build shell, release targets).

pub mod cancel;
pub mod configuration;
pub mod controller;
pub mod engine;
pub mod history;
pub mod log_sink;
pub mod package;
pub mod process;
pub mod release;
pub mod scheduler;
pub mod source;
pub mod trigger;

// Re-export for convenience
pub use configuration as configuration_service;
pub use engine::{Engine, EngineError};
pub use history::HistoryStore;
pub use log_sink::LogSink;
pub use trigger::TriggerDispatcher;
