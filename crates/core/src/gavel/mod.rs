//! Checkpoint (gavel) coordination.
//!
//! A gavel step suspends its run and exposes the in-flight output to an
//! external reviewer. The pending decision is an explicit oneshot channel
//! keyed by gavel id; approving, rejecting, or skipping resolves it as a
//! message-passing operation. At most one gavel may be active per run.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use rk_protocol::error_models::PipelineError;
use rk_protocol::events::Event;
use rk_protocol::gavel_models::{apply_modifications, GavelConfig, GavelModifications, GavelRequest};

use crate::run::state::{emit, RunControl};

/// A reviewer's decision on a pending gavel.
#[derive(Debug)]
pub enum GavelVerdict {
    Approved(Option<GavelModifications>),
    Rejected(Option<String>),
    Skipped,
}

struct PendingGavel {
    request: GavelRequest,
    decision_tx: oneshot::Sender<GavelVerdict>,
}

/// Tracks pending review requests across all runs of one controller.
pub struct GavelCoordinator {
    pending: Mutex<HashMap<Uuid, PendingGavel>>,
    events_tx: mpsc::Sender<Event>,
}

impl GavelCoordinator {
    pub fn new(events_tx: mpsc::Sender<Event>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            events_tx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, PendingGavel>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Suspend the calling step until a verdict arrives.
    ///
    /// Returns the (possibly edited) output on approval or skip; a
    /// rejection cancels the owning run and surfaces as a `Cancelled`
    /// error. With `timeout_ms` set and no decision in time, a skippable
    /// gavel auto-skips; a non-skippable one keeps waiting indefinitely.
    pub async fn request_gavel(
        &self,
        run_id: Uuid,
        config: &GavelConfig,
        current_output: Value,
        control: &RunControl,
    ) -> Result<Value, PipelineError> {
        let request = GavelRequest {
            gavel_id: Uuid::new_v4(),
            run_id,
            prompt: config.prompt.clone(),
            current_output: current_output.clone(),
            editable_fields: config.editable_fields.clone(),
            can_skip: config.can_skip,
            timeout_ms: config.timeout_ms,
            created_at: Utc::now(),
        };
        let gavel_id = request.gavel_id;

        let (decision_tx, decision_rx) = oneshot::channel();
        {
            let mut pending = self.lock();
            if pending.values().any(|p| p.request.run_id == run_id) {
                return Err(PipelineError::validation(format!(
                    "run {run_id} already has an active gavel"
                )));
            }
            pending.insert(
                gavel_id,
                PendingGavel {
                    request,
                    decision_tx,
                },
            );
        }
        emit(&self.events_tx, Event::GavelRequested { gavel_id, run_id }).await;

        let verdict = self
            .await_verdict(gavel_id, config, decision_rx, control)
            .await;
        // The entry is removed by whichever path resolved it; make sure an
        // abandoned wait does not leak it.
        self.lock().remove(&gavel_id);

        match verdict? {
            GavelVerdict::Approved(modifications) => {
                let output = match modifications {
                    Some(mods) => {
                        apply_modifications(&current_output, &mods, &config.editable_fields)
                    }
                    None => current_output,
                };
                Ok(output)
            }
            GavelVerdict::Skipped => Ok(current_output),
            GavelVerdict::Rejected(reason) => {
                control.cancel();
                Err(PipelineError::cancelled(format!(
                    "review rejected: {}",
                    reason.unwrap_or_else(|| "no reason given".to_string())
                )))
            }
        }
    }

    async fn await_verdict(
        &self,
        gavel_id: Uuid,
        config: &GavelConfig,
        decision_rx: oneshot::Receiver<GavelVerdict>,
        control: &RunControl,
    ) -> Result<GavelVerdict, PipelineError> {
        let run_id = {
            let pending = self.lock();
            pending.get(&gavel_id).map(|p| p.request.run_id)
        };

        match config.timeout_ms {
            Some(timeout_ms) if config.can_skip => {
                let deadline = tokio::time::Duration::from_millis(timeout_ms);
                tokio::select! {
                    verdict = decision_rx => {
                        verdict.map_err(|_| PipelineError::cancelled("gavel channel closed"))
                    }
                    _ = control.cancelled() => Err(PipelineError::cancelled("run aborted")),
                    _ = tokio::time::sleep(deadline) => {
                        self.lock().remove(&gavel_id);
                        if let Some(run_id) = run_id {
                            emit(&self.events_tx, Event::GavelSkipped { gavel_id, run_id }).await;
                        }
                        Ok(GavelVerdict::Skipped)
                    }
                }
            }
            // Without skip permission there is no forced decision; the run
            // stays paused until a verdict or an abort.
            _ => {
                tokio::select! {
                    verdict = decision_rx => {
                        verdict.map_err(|_| PipelineError::cancelled("gavel channel closed"))
                    }
                    _ = control.cancelled() => Err(PipelineError::cancelled("run aborted")),
                }
            }
        }
    }

    /// Approve a pending gavel, optionally merging reviewer edits.
    pub async fn approve_gavel(
        &self,
        gavel_id: Uuid,
        modifications: Option<GavelModifications>,
    ) -> Result<(), PipelineError> {
        let pending = self.take(gavel_id)?;
        let run_id = pending.request.run_id;
        let _ = pending.decision_tx.send(GavelVerdict::Approved(modifications));
        emit(&self.events_tx, Event::GavelApproved { gavel_id, run_id }).await;
        Ok(())
    }

    /// Reject a pending gavel. Rejection is not a step retry: it aborts the
    /// owning run entirely.
    pub async fn reject_gavel(
        &self,
        gavel_id: Uuid,
        reason: Option<String>,
    ) -> Result<(), PipelineError> {
        let pending = self.take(gavel_id)?;
        let run_id = pending.request.run_id;
        let _ = pending.decision_tx.send(GavelVerdict::Rejected(reason));
        emit(&self.events_tx, Event::GavelRejected { gavel_id, run_id }).await;
        Ok(())
    }

    /// Skip a pending gavel; valid only when the gavel allows skipping.
    pub async fn skip_gavel(&self, gavel_id: Uuid) -> Result<(), PipelineError> {
        {
            let pending = self.lock();
            match pending.get(&gavel_id) {
                Some(p) if !p.request.can_skip => {
                    return Err(PipelineError::validation(format!(
                        "gavel {gavel_id} does not allow skipping"
                    )));
                }
                Some(_) => {}
                None => {
                    return Err(PipelineError::validation(format!(
                        "no pending gavel {gavel_id}"
                    )));
                }
            }
        }
        let pending = self.take(gavel_id)?;
        let run_id = pending.request.run_id;
        let _ = pending.decision_tx.send(GavelVerdict::Skipped);
        emit(&self.events_tx, Event::GavelSkipped { gavel_id, run_id }).await;
        Ok(())
    }

    /// The pending request for a run, if any.
    pub fn get_active_gavel(&self, run_id: Uuid) -> Option<GavelRequest> {
        let pending = self.lock();
        pending
            .values()
            .find(|p| p.request.run_id == run_id)
            .map(|p| p.request.clone())
    }

    fn take(&self, gavel_id: Uuid) -> Result<PendingGavel, PipelineError> {
        self.lock()
            .remove(&gavel_id)
            .ok_or_else(|| PipelineError::validation(format!("no pending gavel {gavel_id}")))
    }
}
