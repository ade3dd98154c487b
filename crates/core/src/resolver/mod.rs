//! Prompt resolution seam.
//!
//! The engine consumes an external prompt resolver through the
//! [`PromptResolver`] trait; the built-in [`TokenResolver`] is both the
//! default implementation and the fallback when a configured resolver fails.

mod token;

pub use token::TokenResolver;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

use crate::store::StoreSnapshot;

/// Errors surfaced by prompt resolution. Normalized to `Prompt`-kind
/// pipeline errors at the executor boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Unresolved tokens: {0:?}")]
    UnresolvedTokens(Vec<String>),
    #[error("Nested token resolution exceeded depth {0}")]
    DepthExceeded(usize),
    #[error("Resolver failed: {0}")]
    Failed(String),
}

/// Options controlling a single resolve call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// Retain unresolved placeholders instead of erroring on them.
    pub preserve_unresolved: bool,
}

/// Everything a template may draw on: the step's input, the prior output,
/// named variables, pipeline/step metadata, an optional store snapshot,
/// and run timing.
#[derive(Debug, Clone, Default)]
pub struct ResolveContext {
    pub input: Value,
    pub previous_output: Option<Value>,
    pub variables: HashMap<String, Value>,
    pub pipeline_id: String,
    pub pipeline_name: String,
    pub step_id: String,
    pub step_name: String,
    pub store_snapshot: Option<StoreSnapshot>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Turns a template plus a context into resolved text.
///
/// Implementations must tolerate partially-resolvable templates when
/// `preserve_unresolved` is set.
#[async_trait]
pub trait PromptResolver: Send + Sync {
    async fn resolve(
        &self,
        template: &str,
        ctx: &ResolveContext,
        opts: &ResolveOptions,
    ) -> Result<String, ResolveError>;
}
