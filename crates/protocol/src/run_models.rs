//! Runtime run state models.
//!
//! One run is one execution of a pipeline definition. Its state lives in
//! memory for the lifetime of the process; terminal runs are copied into a
//! bounded history for inspection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error_models::PipelineError;
use crate::pipeline_models::ActionKind;

/// The lifecycle status of a run.
///
/// `Idle` is initial; `Running` and `Paused` alternate during execution;
/// `Completed`, `Error`, and `Aborted` are terminal — no transitions out.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Error,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Error | RunStatus::Aborted
        )
    }

    /// Active runs block a new `start_run` for the same pipeline.
    pub fn is_active(self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::Paused)
    }
}

/// Progress counters reported alongside lifecycle events.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct RunProgress {
    pub percentage: f32,
    pub phases_completed: usize,
    pub phases_total: usize,
    pub actions_completed: usize,
    pub actions_total: usize,
}

impl RunProgress {
    pub fn new(phases_total: usize, actions_total: usize) -> Self {
        Self {
            percentage: 0.0,
            phases_completed: 0,
            phases_total,
            actions_completed: 0,
            actions_total,
        }
    }

    /// Recompute the percentage from the action counters.
    pub fn update(&mut self) {
        self.percentage = if self.actions_total == 0 {
            100.0
        } else {
            (self.actions_completed as f32 / self.actions_total as f32) * 100.0
        };
    }
}

/// One entry in the append-only per-run step log.
///
/// Every executed action produces exactly one record — success or normalized
/// error — before the next action begins.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StepRecord {
    pub action_id: String,
    pub action_name: String,
    pub kind: ActionKind,

    /// The parsed output, absent when the step failed.
    pub output: Option<Value>,

    /// The normalized error, absent when the step succeeded.
    pub error: Option<PipelineError>,

    /// Attempts consumed, including the successful one.
    pub attempts: u32,

    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl StepRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// The finalized output of a completed run, per its delivery mode.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "delivery", rename_all = "snake_case")]
pub enum FinalOutput {
    /// Synthesis: the last phase's consolidated output is the content.
    Content { value: Value },
    /// Compilation: an optimized prompt for the caller's own generation.
    CompiledPrompt { prompt: String },
    /// Injection: the resolved token table for template substitution.
    Injection { tokens: std::collections::HashMap<String, Value> },
}

/// A point-in-time record of a run.
///
/// Live runs are sampled into one on inspection; terminal runs leave one
/// behind in the controller's bounded history once their working state is
/// discarded.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub pipeline_id: String,
    pub status: RunStatus,
    pub progress: RunProgress,
    pub final_output: Option<FinalOutput>,
    pub step_results: Vec<StepRecord>,
    pub errors: Vec<PipelineError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_and_active_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Error.is_terminal());
        assert!(RunStatus::Aborted.is_terminal());
        assert!(!RunStatus::Running.is_terminal());

        assert!(RunStatus::Running.is_active());
        assert!(RunStatus::Paused.is_active());
        assert!(!RunStatus::Idle.is_active());
        assert!(!RunStatus::Completed.is_active());
    }

    #[test]
    fn test_progress_percentage() {
        let mut progress = RunProgress::new(2, 4);
        progress.actions_completed = 1;
        progress.update();
        assert!((progress.percentage - 25.0).abs() < f32::EPSILON);

        progress.actions_completed = 4;
        progress.update();
        assert!((progress.percentage - 100.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_empty_pipeline_progress_is_complete() {
        let mut progress = RunProgress::new(0, 0);
        progress.update();
        assert!((progress.percentage - 100.0).abs() < f32::EPSILON);
    }
}
