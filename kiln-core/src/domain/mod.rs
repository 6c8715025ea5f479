//! Core domain types
//!
//! This module contains the core domain structures used across Kiln services.
//! These types represent the fundamental business entities and are shared between
//! the orchestrator (for persistence and execution) and clients (for display).

pub mod configuration;
pub mod log;
pub mod release;
pub mod run;
pub mod trigger;
