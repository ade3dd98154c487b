//! Run state, execution context, and the cooperative control signal.
//!
//! A `RunState`/`ExecutionContext` pair is created at `start_run`, mutated
//! throughout phase and step execution, and copied into history when the run
//! reaches a terminal status; the working pair is discarded afterwards.
//! Steps append to the context; they never replace it.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use rk_protocol::error_models::PipelineError;
use rk_protocol::events::Event;
use rk_protocol::run_models::{FinalOutput, RunProgress, RunRecord, RunStatus, StepRecord};

/// Per-run scratch state carried across steps.
///
/// `step_results` is append-only: step *i+1* never begins before step *i*'s
/// result (success or normalized error) has been appended.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub input: Value,
    pub previous_output: Option<Value>,
    pub variables: HashMap<String, Value>,
    pub step_results: Vec<StepRecord>,
    pub errors: Vec<PipelineError>,
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub preview: bool,
    pub verbose: bool,
    pub continue_on_error: bool,
}

impl ExecutionContext {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            previous_output: None,
            variables: HashMap::new(),
            step_results: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            started_at: Utc::now(),
            preview: false,
            verbose: false,
            continue_on_error: false,
        }
    }
}

/// The mutable state of one pipeline execution.
#[derive(Debug, Clone)]
pub struct RunState {
    pub run_id: Uuid,
    pub pipeline_id: String,
    pub pipeline_name: String,
    pub status: RunStatus,
    pub current_phase_index: usize,
    pub current_action_index: usize,
    pub progress: RunProgress,
    /// Named outputs explicitly tagged for export, visible to later steps.
    pub globals: HashMap<String, Value>,
    /// Consolidated output per completed phase, keyed by phase id.
    pub phase_outputs: HashMap<String, Value>,
    pub final_output: Option<FinalOutput>,
    pub context: ExecutionContext,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunState {
    pub fn new(
        pipeline_id: String,
        pipeline_name: String,
        input: Value,
        phases_total: usize,
        actions_total: usize,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            pipeline_id,
            pipeline_name,
            status: RunStatus::Idle,
            current_phase_index: 0,
            current_action_index: 0,
            progress: RunProgress::new(phases_total, actions_total),
            globals: HashMap::new(),
            phase_outputs: HashMap::new(),
            final_output: None,
            context: ExecutionContext::new(input),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Copy this run into a record: a point-in-time sample for a live run,
    /// the bounded-history entry for a terminal one.
    pub fn to_record(&self) -> RunRecord {
        RunRecord {
            run_id: self.run_id,
            pipeline_id: self.pipeline_id.clone(),
            status: self.status,
            progress: self.progress,
            final_output: self.final_output.clone(),
            step_results: self.context.step_results.clone(),
            errors: self.context.errors.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// The cooperative control signal observed at suspension points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Run,
    Pause,
    Cancel,
}

/// Per-run control channel: pause/resume/cancel flags the drive loop and
/// retry wrapper observe between phases, between steps, and before every
/// retry attempt. Cancellation is never pre-emptive — an in-flight call
/// completes (or times out) before the flag is honored.
#[derive(Debug)]
pub struct RunControl {
    tx: watch::Sender<ControlSignal>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ControlSignal::Run);
        Self { tx }
    }

    pub fn current(&self) -> ControlSignal {
        *self.tx.borrow()
    }

    pub fn pause(&self) {
        let _ = self.tx.send(ControlSignal::Pause);
    }

    pub fn resume(&self) {
        // Cancel is sticky; resume only undoes a pause.
        self.tx.send_if_modified(|signal| {
            if *signal == ControlSignal::Pause {
                *signal = ControlSignal::Run;
                true
            } else {
                false
            }
        });
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(ControlSignal::Cancel);
    }

    pub fn is_cancelled(&self) -> bool {
        self.current() == ControlSignal::Cancel
    }

    /// Fail fast when cancellation has been signalled.
    pub fn ensure_not_cancelled(&self) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            Err(PipelineError::cancelled("run aborted"))
        } else {
            Ok(())
        }
    }

    /// Block while paused; error out when cancelled. Runs block here at
    /// phase and step boundaries, never mid-step.
    pub async fn checkpoint(&self) -> Result<(), PipelineError> {
        let mut rx = self.tx.subscribe();
        loop {
            let signal = *rx.borrow_and_update();
            match signal {
                ControlSignal::Run => return Ok(()),
                ControlSignal::Cancel => {
                    return Err(PipelineError::cancelled("run aborted"));
                }
                ControlSignal::Pause => {
                    if rx.changed().await.is_err() {
                        // Controller dropped; treat as cancellation.
                        return Err(PipelineError::cancelled("controller dropped"));
                    }
                }
            }
        }
    }

    /// Resolves only when cancellation is signalled. Used to race against
    /// scheduled retry delays so cancellation always wins over a retry.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() == ControlSignal::Cancel {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Fire-and-forget event emission. A closed observer never affects
/// execution.
pub async fn emit(events_tx: &mpsc::Sender<Event>, event: Event) {
    let _ = events_tx.send(event).await;
}
