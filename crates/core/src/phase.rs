//! Phase execution.
//!
//! A phase runs its actions strictly in order: step *i+1* never begins
//! before step *i*'s record has been appended to the run context. The
//! control signal is observed at every step boundary, so pause and abort
//! take effect between steps, never mid-step.

use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;

use rk_protocol::error_models::{ErrorKind, PipelineError};
use rk_protocol::events::Event;
use rk_protocol::pipeline_models::{ActionKind, ConsolidationPolicy, OutputTarget, PhaseDefinition};
use rk_protocol::run_models::{RunStatus, StepRecord};

use crate::executor::{StepExecutor, StepSnapshot, StepSuccess};
use crate::run::state::{emit, RunControl, RunState};

/// One completed action's output, as seen by consolidation.
struct PhaseOutput {
    action_id: String,
    value: Value,
    export: bool,
}

pub struct PhaseRunner {
    executor: Arc<StepExecutor>,
    events_tx: mpsc::Sender<Event>,
}

impl PhaseRunner {
    pub fn new(executor: Arc<StepExecutor>, events_tx: mpsc::Sender<Event>) -> Self {
        Self {
            executor,
            events_tx,
        }
    }

    /// Run one phase to completion and return its consolidated output.
    ///
    /// The shared state is locked only in short critical sections around
    /// snapshot construction and result application, never across an await.
    pub async fn run_phase(
        &self,
        phase: &PhaseDefinition,
        phase_index: usize,
        state: &Arc<Mutex<RunState>>,
        control: &RunControl,
    ) -> Result<Value, PipelineError> {
        let mut phase_outputs: Vec<PhaseOutput> = Vec::new();

        for (action_index, action) in phase.actions.iter().enumerate() {
            control.checkpoint().await?;

            let snap = {
                let mut guard = lock_state(state);
                guard.current_phase_index = phase_index;
                guard.current_action_index = action_index;
                build_snapshot(&guard, phase, action_index)
            };

            emit(
                &self.events_tx,
                Event::StepStarted {
                    run_id: snap.run_id,
                    step_id: action.id.clone(),
                    step_index: snap.step_index,
                    total_steps: snap.total_steps,
                },
            )
            .await;

            // A checkpoint wait is externally indistinguishable from a
            // pause, so surface it as one.
            let is_gavel = action.kind == ActionKind::UserGavel;
            if is_gavel {
                lock_state(state).status = RunStatus::Paused;
            }

            let started = Instant::now();
            let result = self.executor.execute_action(action, &snap, control).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            if is_gavel {
                let mut guard = lock_state(state);
                if guard.status == RunStatus::Paused {
                    guard.status = RunStatus::Running;
                }
            }

            match result {
                Ok(success) => {
                    {
                        let mut guard = lock_state(state);
                        apply_success(&mut guard, action, &success, duration_ms);
                    }
                    phase_outputs.push(PhaseOutput {
                        action_id: action.id.clone(),
                        value: success.output,
                        export: action.export,
                    });

                    emit(
                        &self.events_tx,
                        Event::StepCompleted {
                            run_id: snap.run_id,
                            step_id: action.id.clone(),
                            step_index: snap.step_index,
                            total_steps: snap.total_steps,
                        },
                    )
                    .await;
                }
                Err(failure) => {
                    let error = failure.error;
                    if error.kind == ErrorKind::Cancelled {
                        return Err(error);
                    }

                    let halt = {
                        let mut guard = lock_state(state);
                        guard.context.step_results.push(StepRecord {
                            action_id: action.id.clone(),
                            action_name: action.name.clone(),
                            kind: action.kind,
                            output: None,
                            error: Some(error.clone()),
                            attempts: failure.attempts,
                            duration_ms,
                            completed_at: chrono::Utc::now(),
                        });
                        guard.context.errors.push(error.clone());
                        // The phase goes on when the failure is tolerated or
                        // the error itself is recoverable.
                        let tolerated = phase.continue_on_error || guard.context.continue_on_error;
                        !(tolerated || error.recoverable)
                    };

                    emit(
                        &self.events_tx,
                        Event::StepError {
                            run_id: snap.run_id,
                            step_id: action.id.clone(),
                            step_index: snap.step_index,
                            total_steps: snap.total_steps,
                            error: error.clone(),
                        },
                    )
                    .await;

                    if halt {
                        return Err(error);
                    }
                }
            }
        }

        let consolidated = consolidate(phase, &phase_outputs)?;
        {
            let mut guard = lock_state(state);
            guard
                .phase_outputs
                .insert(phase.id.clone(), consolidated.clone());
            guard.context.previous_output = Some(consolidated.clone());
            guard.progress.phases_completed += 1;
            guard.progress.update();
        }
        Ok(consolidated)
    }
}

fn lock_state(state: &Arc<Mutex<RunState>>) -> std::sync::MutexGuard<'_, RunState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn build_snapshot(guard: &RunState, phase: &PhaseDefinition, action_index: usize) -> StepSnapshot {
    // Exported globals are visible to token lookup alongside the phase-local
    // variables; locals shadow globals on collision.
    let mut variables = guard.globals.clone();
    variables.extend(guard.context.variables.clone());

    StepSnapshot {
        run_id: guard.run_id,
        pipeline_id: guard.pipeline_id.clone(),
        pipeline_name: guard.pipeline_name.clone(),
        phase_id: phase.id.clone(),
        phase_name: phase.name.clone(),
        step_index: action_index,
        total_steps: phase.actions.len(),
        input: guard.context.input.clone(),
        previous_output: guard.context.previous_output.clone(),
        variables,
        progress: guard.progress,
        started_at: guard.context.started_at,
    }
}

/// Append the step record and route the output per the action's target.
fn apply_success(
    guard: &mut RunState,
    action: &rk_protocol::pipeline_models::ActionDefinition,
    success: &StepSuccess,
    duration_ms: u64,
) {
    guard.context.step_results.push(StepRecord {
        action_id: action.id.clone(),
        action_name: action.name.clone(),
        kind: action.kind,
        output: Some(success.output.clone()),
        error: None,
        attempts: success.attempts,
        duration_ms,
        completed_at: chrono::Utc::now(),
    });
    guard.context.warnings.extend(success.warnings.clone());

    match &action.output {
        OutputTarget::NextStep => {
            guard.context.previous_output = Some(success.output.clone());
        }
        OutputTarget::Variable { name } => {
            guard
                .context
                .variables
                .insert(name.clone(), success.output.clone());
        }
        // The write already happened inside the executor; the chain input
        // is left untouched.
        OutputTarget::Store { .. } => {}
    }

    if action.export {
        guard
            .globals
            .insert(action.id.clone(), success.output.clone());
    }

    guard.progress.actions_completed += 1;
    guard.progress.update();
}

/// Reduce the phase's step outputs to one value per its policy.
fn consolidate(phase: &PhaseDefinition, outputs: &[PhaseOutput]) -> Result<Value, PipelineError> {
    match &phase.consolidation {
        ConsolidationPolicy::LastAction => Ok(outputs
            .last()
            .map(|out| out.value.clone())
            .unwrap_or(Value::Null)),
        // Merge covers only the actions that declare an export; object
        // outputs merge field-by-field, scalars are keyed by action id.
        ConsolidationPolicy::Merge => {
            let mut merged = Map::new();
            for out in outputs.iter().filter(|out| out.export) {
                match &out.value {
                    Value::Object(fields) => {
                        for (key, field) in fields {
                            merged.insert(key.clone(), field.clone());
                        }
                    }
                    other => {
                        merged.insert(out.action_id.clone(), other.clone());
                    }
                }
            }
            Ok(Value::Object(merged))
        }
        ConsolidationPolicy::Designated { action_id } => outputs
            .iter()
            .find(|out| &out.action_id == action_id)
            .map(|out| out.value.clone())
            .ok_or_else(|| {
                PipelineError::validation(format!(
                    "phase '{}' designates action '{action_id}' which produced no output",
                    phase.id
                ))
            }),
    }
}
