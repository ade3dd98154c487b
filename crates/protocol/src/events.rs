//! Engine lifecycle events.
//!
//! Events are the engine's observability surface: every layer emits them
//! into a `tokio::sync::mpsc` channel and any observer (UI, logs, tests)
//! consumes the stream. Emission is fire-and-forget; a closed channel
//! never affects execution.
//!
//! Uses tagged enum serialization:
//! ```json
//! {
//!   "type": "stepRetry",
//!   "payload": { "run_id": "...", "step_id": "draft", "attempt": 2, ... }
//! }
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error_models::PipelineError;

/// Which of the four step sub-stages a progress event precedes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    PromptResolving,
    LlmCalling,
    OutputParsing,
    StoreWriting,
    StepComplete,
}

/// Status updates sent from the engine to any observer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Event {
    /// A run has been created and started.
    RunStarted { run_id: Uuid, pipeline_id: String },

    /// A run finished all phases and delivered its output.
    RunCompleted {
        run_id: Uuid,
        pipeline_id: String,
        duration_ms: u64,
    },

    /// A run halted on an unrecovered error. Partial results are retained.
    RunError {
        run_id: Uuid,
        pipeline_id: String,
        error: PipelineError,
    },

    /// Cancellation has been signalled; the in-flight step is unwinding.
    RunAborting { run_id: Uuid },

    /// The run reached its terminal aborted state.
    RunAborted { run_id: Uuid, pipeline_id: String },

    RunPaused { run_id: Uuid },

    RunResumed { run_id: Uuid },

    StepStarted {
        run_id: Uuid,
        step_id: String,
        step_index: usize,
        total_steps: usize,
    },

    StepCompleted {
        run_id: Uuid,
        step_id: String,
        step_index: usize,
        total_steps: usize,
    },

    StepError {
        run_id: Uuid,
        step_id: String,
        step_index: usize,
        total_steps: usize,
        error: PipelineError,
    },

    /// Emitted before each re-attempt of a retryable failure.
    StepRetry {
        run_id: Uuid,
        step_id: String,
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
    },

    /// Emitted at each of the four step sub-stages.
    Progress {
        run_id: Uuid,
        phase: String,
        stage: ProgressStage,
        percentage: f32,
        actions_completed: usize,
        actions_total: usize,
    },

    GavelRequested { gavel_id: Uuid, run_id: Uuid },

    GavelApproved { gavel_id: Uuid, run_id: Uuid },

    GavelRejected { gavel_id: Uuid, run_id: Uuid },

    GavelSkipped { gavel_id: Uuid, run_id: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagged_serialization() {
        let event = Event::RunStarted {
            run_id: Uuid::new_v4(),
            pipeline_id: "p1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "runStarted");
        assert_eq!(json["payload"]["pipeline_id"], "p1");
    }

    #[test]
    fn test_step_retry_payload_fields() {
        let event = Event::StepRetry {
            run_id: Uuid::new_v4(),
            step_id: "draft".to_string(),
            attempt: 2,
            max_attempts: 3,
            delay_ms: 2000,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stepRetry");
        assert_eq!(json["payload"]["attempt"], 2);
        assert_eq!(json["payload"]["delay_ms"], 2000);
    }

    #[test]
    fn test_progress_stage_snake_case() {
        let json = serde_json::to_value(ProgressStage::PromptResolving).unwrap();
        assert_eq!(json, "prompt_resolving");
    }
}
