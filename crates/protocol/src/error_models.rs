//! The canonical error vocabulary.
//!
//! Every failure surfaced by any execution stage is normalized into a
//! [`PipelineError`] at the step executor boundary, so all downstream
//! consumers reason about one shape regardless of origin. Classification is
//! set at the point of origin — never inferred from message text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The origin classification of a pipeline failure.
///
/// `kind` is the authoritative field for all control-flow decisions:
/// whether to retry, whether a phase may continue past the error, and which
/// terminal status the run reaches.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad configuration. Never retried.
    Validation,
    /// Misconfigured or unknown agent.
    Agent,
    /// Prompt resolution failure (including nested-token depth overflow).
    Prompt,
    /// Inference call failure. Retryable.
    Llm,
    /// Malformed model output.
    Parse,
    /// Persistence failure.
    Store,
    /// The invocation exceeded its deadline. Retryable.
    Timeout,
    /// User-initiated cancellation or gavel rejection. Never retried,
    /// never continued past.
    Cancelled,
    /// Fallback for failures with no better classification.
    Unknown,
}

impl ErrorKind {
    /// Whether the retry wrapper may re-attempt this failure.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Llm | ErrorKind::Timeout)
    }

    /// Default recoverability: may the phase continue to the next action
    /// without retrying? Overridable per error at construction.
    pub fn default_recoverable(self) -> bool {
        matches!(self, ErrorKind::Parse | ErrorKind::Prompt)
    }

    /// Short human-readable label used in rolled-up summaries.
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Agent => "agent",
            ErrorKind::Prompt => "prompt",
            ErrorKind::Llm => "LLM",
            ErrorKind::Parse => "parse",
            ErrorKind::Store => "store",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// The normalized error every layer above the step executor sees.
#[derive(Serialize, Deserialize, Error, Debug, Clone, PartialEq, Eq)]
#[error("{} error: {message}", kind.label())]
pub struct PipelineError {
    pub kind: ErrorKind,

    /// Whether the phase may record this error and continue.
    pub recoverable: bool,

    /// Whether the retry wrapper may re-attempt. Derived from `kind`.
    pub retryable: bool,

    pub message: String,

    /// The action that produced the error, when known.
    #[serde(default)]
    pub step_id: Option<String>,
}

impl PipelineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        // Cancellation always wins over continue-on-error.
        let recoverable = kind != ErrorKind::Cancelled && kind.default_recoverable();
        Self {
            kind,
            recoverable,
            retryable: kind.is_retryable(),
            message: message.into(),
            step_id: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    /// Override the kind-derived recoverability. Ignored for `Cancelled`,
    /// which is unconditionally non-recoverable.
    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        if self.kind != ErrorKind::Cancelled {
            self.recoverable = recoverable;
        }
        self
    }

    /// Human-readable message derived from the classification, independent
    /// of the raw cause text.
    pub fn user_message(&self) -> String {
        let what = match self.kind {
            ErrorKind::Validation => "The step configuration is invalid",
            ErrorKind::Agent => "The agent is misconfigured",
            ErrorKind::Prompt => "The prompt could not be resolved",
            ErrorKind::Llm => "The model call failed",
            ErrorKind::Parse => "The model output could not be parsed",
            ErrorKind::Store => "Persistent storage failed",
            ErrorKind::Timeout => "The step timed out",
            ErrorKind::Cancelled => "The run was cancelled",
            ErrorKind::Unknown => "An unexpected failure occurred",
        };
        match &self.step_id {
            Some(id) => format!("{what} (step '{id}')"),
            None => what.to_string(),
        }
    }
}

/// Roll a collection of errors up into a summary string, e.g.
/// "2 LLM errors, 1 prompt error".
pub fn summarize_errors(errors: &[PipelineError]) -> String {
    if errors.is_empty() {
        return "no errors".to_string();
    }
    let mut counts: Vec<(ErrorKind, usize)> = Vec::new();
    for error in errors {
        match counts.iter_mut().find(|(k, _)| *k == error.kind) {
            Some((_, n)) => *n += 1,
            None => counts.push((error.kind, 1)),
        }
    }
    counts
        .iter()
        .map(|(kind, n)| {
            let plural = if *n == 1 { "" } else { "s" };
            format!("{n} {} error{plural}", kind.label())
        })
        .collect::<Vec<_>>()
        .join(", ")
}
