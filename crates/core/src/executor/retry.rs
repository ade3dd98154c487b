//! Retry wrapper around a single step.
//!
//! Only errors whose kind is marked retryable are retried; everything else
//! surfaces immediately. Delays grow exponentially from the policy's base,
//! and cancellation is checked before every attempt and during every delay.

use tokio::time::{sleep, Duration};

use rk_protocol::error_models::PipelineError;
use rk_protocol::events::Event;
use rk_protocol::pipeline_models::ActionDefinition;

use super::{StepExecutor, StepFailure, StepSnapshot, StepSuccess};
use crate::run::state::{emit, RunControl};

/// Hard ceiling on attempts regardless of the declared policy.
const MAX_ATTEMPTS_CEILING: u32 = 3;

pub(super) async fn execute_with_retry(
    executor: &StepExecutor,
    action: &ActionDefinition,
    snap: &StepSnapshot,
    control: &RunControl,
) -> Result<StepSuccess, StepFailure> {
    let max_attempts = action.retry.max_attempts.clamp(1, MAX_ATTEMPTS_CEILING);
    let mut warnings = Vec::new();
    // Attempts actually executed so far; carried into the failure result so
    // the step record reflects the real cost of the step.
    let mut attempts: u32 = 0;

    loop {
        if let Err(error) = control.ensure_not_cancelled() {
            return Err(StepFailure { error, attempts });
        }
        attempts += 1;

        match executor
            .execute_once(action, snap, control, &mut warnings)
            .await
        {
            Ok((output, resolved_prompt, usage)) => {
                return Ok(StepSuccess {
                    output,
                    attempts,
                    warnings,
                    resolved_prompt,
                    usage,
                })
            }
            Err(error) => {
                if !error.retryable || attempts >= max_attempts {
                    return Err(StepFailure { error, attempts });
                }

                let delay_ms = action
                    .retry
                    .base_delay_ms
                    .saturating_mul(1u64 << (attempts - 1));

                emit(
                    &executor.events_tx,
                    Event::StepRetry {
                        run_id: snap.run_id,
                        step_id: action.id.clone(),
                        attempt: attempts + 1,
                        max_attempts,
                        delay_ms,
                    },
                )
                .await;

                tokio::select! {
                    _ = sleep(Duration::from_millis(delay_ms)) => {}
                    _ = control.cancelled() => {
                        return Err(StepFailure {
                            error: PipelineError::cancelled("run aborted"),
                            attempts,
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_ceiling_clamps_policy() {
        assert_eq!(10u32.clamp(1, MAX_ATTEMPTS_CEILING), 3);
        assert_eq!(0u32.clamp(1, MAX_ATTEMPTS_CEILING), 1);
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let base: u64 = 100;
        assert_eq!(base.saturating_mul(1 << 0), 100);
        assert_eq!(base.saturating_mul(1 << 1), 200);
        assert_eq!(base.saturating_mul(1 << 2), 400);
    }
}
