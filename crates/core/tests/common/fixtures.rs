//! Test fixtures: agents, actions, pipelines, and wired-up controllers.

// Not every suite uses every helper.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use rk_core::inference::InferenceClient;
use rk_core::run::RunController;
use rk_core::store::{MemoryStore, Store};
use rk_protocol::agent_models::{AgentConfig, GenerationConfig};
use rk_protocol::events::Event;
use rk_protocol::gavel_models::GavelConfig;
use rk_protocol::pipeline_models::{
    ActionDefinition, ActionKind, ConsolidationPolicy, DeliveryMode, PhaseDefinition,
    PipelineDefinition, PromptConfig, RetryPolicy,
};
use rk_protocol::run_models::RunStatus;
use serde_json::Value;

pub fn test_agent(name: &str) -> AgentConfig {
    AgentConfig {
        name: name.to_string(),
        description: format!("Test agent {name}"),
        model: "mock-model".to_string(),
        system_prompt: String::new(),
        generation: GenerationConfig::default(),
    }
}

/// A standard LLM action driven by the `writer` agent, with fast retries
/// so failing tests don't sit in backoff.
pub fn standard_action(id: &str) -> ActionDefinition {
    ActionDefinition {
        id: id.to_string(),
        name: format!("Step {id}"),
        kind: ActionKind::Standard,
        input: Default::default(),
        prompt: Some(PromptConfig::Text {
            text: "Write about: {{input}}".to_string(),
        }),
        template: None,
        output: Default::default(),
        shape: Default::default(),
        execution: Default::default(),
        participants: Vec::new(),
        agent: Some("writer".to_string()),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 10,
        },
        timeout_ms: None,
        export: false,
        gavel: None,
    }
}

pub fn gavel_action(id: &str, can_skip: bool, timeout_ms: Option<u64>) -> ActionDefinition {
    ActionDefinition {
        kind: ActionKind::UserGavel,
        prompt: None,
        agent: None,
        gavel: Some(GavelConfig {
            prompt: "Approve this output?".to_string(),
            editable_fields: Vec::new(),
            can_skip,
            timeout_ms,
        }),
        ..standard_action(id)
    }
}

pub fn single_phase_pipeline(id: &str, actions: Vec<ActionDefinition>) -> PipelineDefinition {
    PipelineDefinition {
        id: id.to_string(),
        name: format!("Pipeline {id}"),
        phases: vec![PhaseDefinition {
            id: "main".to_string(),
            name: "Main".to_string(),
            actions,
            continue_on_error: false,
            consolidation: ConsolidationPolicy::LastAction,
        }],
        delivery: DeliveryMode::Synthesis,
    }
}

/// A controller wired to the given client, a fresh in-memory store, and a
/// registered `writer` agent. Returns the event receiver alongside it.
pub fn controller_with(
    client: Arc<dyn InferenceClient>,
) -> (Arc<RunController>, mpsc::Receiver<Event>) {
    controller_with_store(client, Arc::new(MemoryStore::new()))
}

pub fn controller_with_store(
    client: Arc<dyn InferenceClient>,
    store: Arc<dyn Store>,
) -> (Arc<RunController>, mpsc::Receiver<Event>) {
    let (events_tx, events_rx) = mpsc::channel(256);
    let controller = Arc::new(RunController::new(client, store, events_tx));
    controller.register_agent(test_agent("writer"));
    (controller, events_rx)
}

/// Drain events until a terminal run event arrives or the timeout expires.
pub async fn collect_events_until_terminal(
    rx: &mut mpsc::Receiver<Event>,
    timeout: Duration,
) -> Vec<Event> {
    let mut events = Vec::new();
    let start = tokio::time::Instant::now();

    while start.elapsed() < timeout {
        match tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
            Ok(Some(event)) => {
                let is_terminal = matches!(
                    &event,
                    Event::RunCompleted { .. } | Event::RunAborted { .. } | Event::RunError { .. }
                );
                events.push(event);
                if is_terminal {
                    break;
                }
            }
            Ok(None) => break,  // Channel closed
            Err(_) => continue, // Poll timeout, keep waiting
        }
    }

    events
}

/// Poll until the run reaches the wanted status. Returns false on timeout.
pub async fn wait_for_status(
    controller: &Arc<RunController>,
    run_id: Uuid,
    status: RunStatus,
    timeout: Duration,
) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if controller
            .get_run_state(run_id)
            .map(|s| s.status == status)
            .unwrap_or(false)
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Poll until a gavel is pending for the run. Returns its id.
pub async fn wait_for_gavel(
    controller: &Arc<RunController>,
    run_id: Uuid,
    timeout: Duration,
) -> Option<Uuid> {
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if let Some(request) = controller.get_active_gavel(run_id) {
            return Some(request.gavel_id);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}

/// The final output value of a completed synthesis run.
pub fn final_content(controller: &Arc<RunController>, run_id: Uuid) -> Option<Value> {
    match controller.get_output(run_id)? {
        rk_protocol::run_models::FinalOutput::Content { value } => Some(value),
        _ => None,
    }
}
