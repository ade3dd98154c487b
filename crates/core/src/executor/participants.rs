//! Multi-participant orchestration.
//!
//! A step that names several agents runs them under one of four modes:
//! sequential hand-off, parallel fan-out with a merged result, round-robin
//! over a shared transcript, or consensus (parallel drafts synthesized by
//! the first participant).

use std::sync::Arc;
use tokio::task::JoinSet;

use rk_protocol::agent_models::AgentConfig;
use rk_protocol::error_models::{ErrorKind, PipelineError};
use rk_protocol::pipeline_models::OrchestrationMode;

use crate::inference::{Completion, InferenceClient, TokenUsage};

pub(super) async fn orchestrate(
    client: Arc<dyn InferenceClient>,
    mode: OrchestrationMode,
    agents: Vec<AgentConfig>,
    prompt: String,
) -> Result<(String, TokenUsage), PipelineError> {
    match mode {
        OrchestrationMode::Sequential => sequential(client, agents, prompt).await,
        OrchestrationMode::Parallel => {
            let (responses, usage) = fan_out(client, &agents, &prompt).await?;
            Ok((responses.join("\n\n---\n\n"), usage))
        }
        OrchestrationMode::RoundRobin => round_robin(client, agents, prompt).await,
        OrchestrationMode::Consensus => consensus(client, agents, prompt).await,
    }
}

async fn call_agent(
    client: &Arc<dyn InferenceClient>,
    agent: &AgentConfig,
    prompt: &str,
) -> Result<Completion, PipelineError> {
    let full_prompt = if agent.system_prompt.is_empty() {
        prompt.to_string()
    } else {
        format!("{}\n\n{prompt}", agent.system_prompt)
    };
    Ok(client.generate(&full_prompt, &agent.generation).await?)
}

/// Each participant sees the base prompt plus the previous participant's
/// response; the last response is the step output.
async fn sequential(
    client: Arc<dyn InferenceClient>,
    agents: Vec<AgentConfig>,
    prompt: String,
) -> Result<(String, TokenUsage), PipelineError> {
    let mut usage = TokenUsage::default();
    let mut previous: Option<String> = None;

    for agent in &agents {
        let agent_prompt = match &previous {
            Some(prior) => format!("{prompt}\n\nPrevious response:\n{prior}"),
            None => prompt.clone(),
        };
        let completion = call_agent(&client, agent, &agent_prompt).await?;
        usage.add(completion.usage);
        previous = Some(completion.text);
    }

    previous.ok_or_else(|| {
        PipelineError::new(ErrorKind::Agent, "orchestration ran with no participants")
    })
    .map(|text| (text, usage))
}

/// All participants run concurrently; results are collected in declaration
/// order after every call settles, and the first failure (if any) wins.
async fn fan_out(
    client: Arc<dyn InferenceClient>,
    agents: &[AgentConfig],
    prompt: &str,
) -> Result<(Vec<String>, TokenUsage), PipelineError> {
    let mut set: JoinSet<(usize, Result<Completion, PipelineError>)> = JoinSet::new();
    for (index, agent) in agents.iter().enumerate() {
        let client = Arc::clone(&client);
        let agent = agent.clone();
        let prompt = prompt.to_string();
        set.spawn(async move {
            let result = call_agent(&client, &agent, &prompt).await;
            (index, result)
        });
    }

    let mut slots: Vec<Option<Result<Completion, PipelineError>>> =
        (0..agents.len()).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        let (index, result) = joined.map_err(|e| {
            PipelineError::new(ErrorKind::Unknown, format!("participant task failed: {e}"))
        })?;
        slots[index] = Some(result);
    }

    let mut responses = Vec::with_capacity(agents.len());
    let mut usage = TokenUsage::default();
    for slot in slots {
        let completion = slot.ok_or_else(|| {
            PipelineError::new(ErrorKind::Unknown, "participant task vanished")
        })??;
        usage.add(completion.usage);
        responses.push(completion.text);
    }
    Ok((responses, usage))
}

/// Sequential turns over a shared transcript labeled by agent name.
async fn round_robin(
    client: Arc<dyn InferenceClient>,
    agents: Vec<AgentConfig>,
    prompt: String,
) -> Result<(String, TokenUsage), PipelineError> {
    let mut usage = TokenUsage::default();
    let mut transcript = String::new();
    let mut last = None;

    for agent in &agents {
        let agent_prompt = if transcript.is_empty() {
            prompt.clone()
        } else {
            format!("{prompt}\n\nDiscussion so far:\n{transcript}")
        };
        let completion = call_agent(&client, agent, &agent_prompt).await?;
        usage.add(completion.usage);
        transcript.push_str(&format!("{}: {}\n", agent.name, completion.text));
        last = Some(completion.text);
    }

    last.ok_or_else(|| {
        PipelineError::new(ErrorKind::Agent, "orchestration ran with no participants")
    })
    .map(|text| (text, usage))
}

/// Parallel drafts, then the first participant synthesizes one answer.
async fn consensus(
    client: Arc<dyn InferenceClient>,
    agents: Vec<AgentConfig>,
    prompt: String,
) -> Result<(String, TokenUsage), PipelineError> {
    let synthesizer = agents.first().cloned().ok_or_else(|| {
        PipelineError::new(ErrorKind::Agent, "orchestration ran with no participants")
    })?;

    let (drafts, mut usage) = fan_out(Arc::clone(&client), &agents, &prompt).await?;

    let mut synthesis_prompt = String::from(
        "Synthesize a single consensus response from the drafts below.\n",
    );
    for (index, draft) in drafts.iter().enumerate() {
        synthesis_prompt.push_str(&format!("\nDraft {}:\n{draft}\n", index + 1));
    }

    let completion = call_agent(&client, &synthesizer, &synthesis_prompt).await?;
    usage.add(completion.usage);
    Ok((completion.text, usage))
}
