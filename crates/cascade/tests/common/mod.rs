//! Shared test utilities for cascade integration tests.
//!
//! This module provides:
//! - `TestHarness`: an in-memory database, a manual clock, a scripted
//!   collaborator and a recording continuation trigger wired into an
//!   `Orchestrator`
//! - Builders for configurations, content records and job requests

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{Reply, ScriptedGenerator, TestHarness};
