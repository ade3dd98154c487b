//! # rk-core
//!
//! Core execution engine for relay-kit: declarative multi-stage pipelines
//! with retries, pause/resume/abort, human-approval checkpoints, and
//! non-destructive preview.
//!
//! This crate provides:
//! - The run controller and per-run lifecycle management
//! - Phase and step execution over pluggable resolver/inference/store seams
//! - Gavel (human approval) coordination
//! - Dry-run preview with intercepted store writes
//!
//! ## Modules
//!
//! - [`run`]: Run controller, run state, and the cooperative control signal
//! - [`phase`]: Sequential phase execution and output consolidation
//! - [`executor`]: The four-stage step pipeline and retry wrapper
//! - [`gavel`]: Human-approval checkpoint coordination
//! - [`preview`]: Dry-run execution and reporting
//! - [`resolver`]: Prompt template resolution
//! - [`inference`]: Inference client seam and test double
//! - [`store`]: Persistent collection seam and in-memory implementation

pub mod errors;
pub mod executor;
pub mod gavel;
pub mod inference;
pub mod phase;
pub mod preview;
pub mod resolver;
pub mod run;
pub mod store;
