//! Kiln Orchestrator
//!
//! Build orchestration engine: admits runs of build configurations, drives
//! each run through fetch, build, package and release, keeps the run
//! history and serves the HTTP API used by the console and the CLI.

pub mod api;
pub mod config;
pub mod db;
pub mod repository;
pub mod service;
pub mod storage;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
