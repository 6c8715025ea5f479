//! Data Transfer Objects for inter-service communication
//!
//! This module contains DTOs used for communication between the orchestrator
//! API and its clients (CLI, console). DTOs are lightweight request and
//! response bodies built around the domain types.

pub mod batch;
pub mod configuration;
pub mod log;
pub mod page;
pub mod run;
