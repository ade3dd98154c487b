//! Custom assertion helpers over collected event streams.

// Not every suite uses every helper.
#![allow(dead_code)]

use rk_protocol::events::Event;

pub fn has_run_started(events: &[Event]) -> bool {
    events.iter().any(|e| matches!(e, Event::RunStarted { .. }))
}

pub fn has_run_completed(events: &[Event]) -> bool {
    events.iter().any(|e| matches!(e, Event::RunCompleted { .. }))
}

pub fn has_run_aborted(events: &[Event]) -> bool {
    events.iter().any(|e| matches!(e, Event::RunAborted { .. }))
}

pub fn has_run_error(events: &[Event]) -> bool {
    events.iter().any(|e| matches!(e, Event::RunError { .. }))
}

pub fn count_step_retries(events: &[Event], step: &str) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, Event::StepRetry { step_id, .. } if step_id == step))
        .count()
}

/// Ids of started steps, in emission order.
pub fn started_step_ids(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::StepStarted { step_id, .. } => Some(step_id.clone()),
            _ => None,
        })
        .collect()
}

pub fn has_step_error(events: &[Event], step: &str) -> bool {
    events
        .iter()
        .any(|e| matches!(e, Event::StepError { step_id, .. } if step_id == step))
}

pub fn has_gavel_requested(events: &[Event]) -> bool {
    events.iter().any(|e| matches!(e, Event::GavelRequested { .. }))
}

pub fn has_gavel_skipped(events: &[Event]) -> bool {
    events.iter().any(|e| matches!(e, Event::GavelSkipped { .. }))
}

/// Check the overall shape of a run's event stream: started first, exactly
/// one terminal event, and it comes last.
pub fn assert_run_event_sequence(events: &[Event]) {
    assert!(!events.is_empty(), "event sequence is empty");
    assert!(
        matches!(events[0], Event::RunStarted { .. }),
        "first event should be RunStarted, got: {:?}",
        events[0]
    );

    let terminal_count = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                Event::RunCompleted { .. } | Event::RunAborted { .. } | Event::RunError { .. }
            )
        })
        .count();
    assert_eq!(terminal_count, 1, "expected exactly one terminal event");

    let last = events.last().expect("non-empty");
    assert!(
        matches!(
            last,
            Event::RunCompleted { .. } | Event::RunAborted { .. } | Event::RunError { .. }
        ),
        "last event should be terminal, got: {last:?}"
    );
}

/// Every StepCompleted for step *i* must precede StepStarted for step *i+1*.
pub fn assert_steps_strictly_sequential(events: &[Event]) {
    let mut in_flight: Option<String> = None;
    for event in events {
        match event {
            Event::StepStarted { step_id, .. } => {
                assert!(
                    in_flight.is_none(),
                    "step '{step_id}' started while '{}' was in flight",
                    in_flight.as_deref().unwrap_or("?")
                );
                in_flight = Some(step_id.clone());
            }
            Event::StepCompleted { step_id, .. } | Event::StepError { step_id, .. } => {
                assert_eq!(
                    in_flight.as_deref(),
                    Some(step_id.as_str()),
                    "step '{step_id}' finished without a matching start"
                );
                in_flight = None;
            }
            _ => {}
        }
    }
}
