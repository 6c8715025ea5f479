//! Kiln Core
//!
//! Core types and abstractions for the Kiln build orchestration system.
//!
//! This crate contains:
//! - Domain types: Core business entities (BuildConfiguration, Run, etc.)
//! - DTOs: Data transfer objects for inter-service communication

pub mod domain;
pub mod dto;
