//! # rk-protocol
//!
//! Core protocol definitions and data models for relay-kit.
//!
//! This crate defines all shared data structures used for:
//! - Pipeline, phase, and action definitions (read-only engine input)
//! - Runtime run state, progress, and history models
//! - Human-approval checkpoint (gavel) requests and verdict payloads
//! - The canonical error vocabulary used by all control-flow decisions
//! - Lifecycle events emitted to any observer
//!
//! ## Modules
//!
//! - [`pipeline_models`]: Pipeline definitions and action configuration
//! - [`agent_models`]: Agent configuration and generation parameters
//! - [`run_models`]: Run status, progress, step records, and history
//! - [`gavel_models`]: Checkpoint requests and reviewer modifications
//! - [`error_models`]: `PipelineError` and its classification
//! - [`events`]: Engine-to-observer event stream
//!
//! ## Design Principles
//!
//! - Minimal dependencies: serde, thiserror, uuid, chrono
//! - Independent compilation: no dependencies on other relay-kit crates

pub mod agent_models;
pub mod error_models;
pub mod events;
pub mod gavel_models;
pub mod pipeline_models;
pub mod run_models;

// Re-export all public types for convenience
pub use agent_models::*;
pub use error_models::*;
pub use events::*;
pub use gavel_models::*;
pub use pipeline_models::*;
pub use run_models::*;
