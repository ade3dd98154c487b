//! Common test utilities shared across the integration suites.
//!
//! This module provides:
//! - Fixtures (agents, actions, pipelines, wired-up controllers)
//! - Custom assertions over collected event streams
//! - Helpers for draining the event channel and polling run state

pub mod assertions;
pub mod fixtures;

#[allow(unused_imports)]
pub use assertions::*;
#[allow(unused_imports)]
pub use fixtures::*;
