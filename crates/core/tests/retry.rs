//! Retry behavior: transient failures recover, bounds hold, non-retryable
//! errors surface immediately, and cancellation beats a scheduled retry.

mod common;

use common::assertions::*;
use common::fixtures::*;
use rk_core::inference::{InferenceClient, MockInferenceClient};
use rk_protocol::events::Event;
use rk_protocol::run_models::RunStatus;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_flaky_llm_recovers_on_third_attempt() {
    let client = Arc::new(MockInferenceClient::flaky(2, "recovered"));
    let counted = Arc::clone(&client);
    let (controller, mut events_rx) = controller_with(client as Arc<dyn InferenceClient>);
    controller
        .register_pipeline(single_phase_pipeline("p1", vec![standard_action("draft")]))
        .unwrap();

    let run_id = controller.start_run("p1", json!("go")).await.unwrap();
    let events = collect_events_until_terminal(&mut events_rx, Duration::from_secs(5)).await;

    assert!(has_run_completed(&events));
    assert_eq!(count_step_retries(&events, "draft"), 2);
    assert_eq!(counted.call_count(), 3);

    let record = controller.get_run_state(run_id).unwrap();
    assert_eq!(record.step_results[0].attempts, 3);
    assert_eq!(final_content(&controller, run_id), Some(json!("recovered")));
}

#[tokio::test]
async fn test_retry_attempts_are_bounded() {
    let client = Arc::new(MockInferenceClient::always_failing());
    let counted = Arc::clone(&client);
    let (controller, mut events_rx) = controller_with(client as Arc<dyn InferenceClient>);
    controller
        .register_pipeline(single_phase_pipeline("p1", vec![standard_action("draft")]))
        .unwrap();

    let run_id = controller.start_run("p1", json!("go")).await.unwrap();
    let events = collect_events_until_terminal(&mut events_rx, Duration::from_secs(5)).await;

    assert!(has_run_error(&events));
    // Three attempts means exactly two retries.
    assert_eq!(count_step_retries(&events, "draft"), 2);
    assert_eq!(counted.call_count(), 3);

    let record = controller.get_run_state(run_id).unwrap();
    assert_eq!(record.status, RunStatus::Error);
    // The failed step's record carries every attempt it burned.
    assert_eq!(record.step_results[0].attempts, 3);
}

#[tokio::test]
async fn test_retry_delays_grow_exponentially() {
    let client: Arc<dyn InferenceClient> = Arc::new(MockInferenceClient::always_failing());
    let (controller, mut events_rx) = controller_with(client);
    controller
        .register_pipeline(single_phase_pipeline("p1", vec![standard_action("draft")]))
        .unwrap();

    controller.start_run("p1", json!("go")).await.unwrap();
    let events = collect_events_until_terminal(&mut events_rx, Duration::from_secs(5)).await;

    let delays: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            Event::StepRetry { delay_ms, .. } => Some(*delay_ms),
            _ => None,
        })
        .collect();
    // Fixture base delay is 10ms.
    assert_eq!(delays, vec![10, 20]);
}

#[tokio::test]
async fn test_agent_error_is_not_retried() {
    let client = Arc::new(MockInferenceClient::always("out"));
    let counted = Arc::clone(&client);
    let (controller, mut events_rx) = controller_with(client as Arc<dyn InferenceClient>);

    let mut bad = standard_action("bad");
    bad.agent = Some("nobody".to_string());
    controller
        .register_pipeline(single_phase_pipeline("p1", vec![bad]))
        .unwrap();

    controller.start_run("p1", json!("go")).await.unwrap();
    let events = collect_events_until_terminal(&mut events_rx, Duration::from_secs(5)).await;

    assert!(has_run_error(&events));
    assert_eq!(count_step_retries(&events, "bad"), 0);
    assert_eq!(counted.call_count(), 0);
}

#[tokio::test]
async fn test_abort_wins_over_scheduled_retry() {
    let client = Arc::new(MockInferenceClient::flaky(5, "never"));
    let counted = Arc::clone(&client);
    let (controller, mut events_rx) = controller_with(client as Arc<dyn InferenceClient>);

    let mut slow = standard_action("slow");
    slow.retry.base_delay_ms = 5_000;
    controller
        .register_pipeline(single_phase_pipeline("p1", vec![slow]))
        .unwrap();

    let run_id = controller.start_run("p1", json!("go")).await.unwrap();

    // Wait for the first retry to be scheduled, then abort mid-backoff.
    let mut pre_abort = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(100), events_rx.recv()).await {
            Ok(Some(event)) => {
                let is_retry = matches!(&event, Event::StepRetry { .. });
                pre_abort.push(event);
                if is_retry {
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => continue,
        }
    }
    assert!(pre_abort.iter().any(|e| matches!(e, Event::StepRetry { .. })));

    let abort_start = tokio::time::Instant::now();
    controller.abort_run(run_id).await.unwrap();
    let events = collect_events_until_terminal(&mut events_rx, Duration::from_secs(5)).await;

    assert!(has_run_aborted(&events));
    // The abort must not wait out the 5s backoff.
    assert!(abort_start.elapsed() < Duration::from_secs(2));
    assert_eq!(counted.call_count(), 1);
    assert_eq!(
        controller.get_run_state(run_id).unwrap().status,
        RunStatus::Aborted
    );
}
