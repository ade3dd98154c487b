//! Step execution.
//!
//! The innermost reusable unit: one action runs as a four-stage pipeline —
//! input resolution, prompt resolution, invocation, output handling — with a
//! progress event before each stage. The whole pipeline is wrapped in the
//! retry policy, and every failure leaving this module is a normalized
//! [`PipelineError`].

mod participants;
mod retry;

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use rk_protocol::agent_models::AgentConfig;
use rk_protocol::error_models::{ErrorKind, PipelineError};
use rk_protocol::events::{Event, ProgressStage};
use rk_protocol::pipeline_models::{
    ActionDefinition, ActionKind, InputSource, OutputShape, OutputTarget, PromptConfig,
    PromptFragment,
};
use rk_protocol::run_models::RunProgress;

use crate::gavel::GavelCoordinator;
use crate::inference::{InferenceClient, TokenUsage};
use crate::resolver::{PromptResolver, ResolveContext, ResolveOptions, TokenResolver};
use crate::run::state::{emit, RunControl};
use crate::store::{Store, StoreSnapshot};

/// An immutable view of run state handed to one step execution.
///
/// The executor never touches the shared run state directly; the phase
/// runner builds this snapshot under a short lock and applies the result
/// afterwards.
#[derive(Debug, Clone)]
pub struct StepSnapshot {
    pub run_id: Uuid,
    pub pipeline_id: String,
    pub pipeline_name: String,
    pub phase_id: String,
    pub phase_name: String,
    pub step_index: usize,
    pub total_steps: usize,
    pub input: Value,
    pub previous_output: Option<Value>,
    pub variables: HashMap<String, Value>,
    pub progress: RunProgress,
    pub started_at: DateTime<Utc>,
}

/// The result of a successful step.
#[derive(Debug, Clone)]
pub struct StepSuccess {
    pub output: Value,
    /// Attempts consumed, including the successful one.
    pub attempts: u32,
    pub warnings: Vec<String>,
    /// The resolved prompt, retained for preview display and cost
    /// estimation. Absent for kinds that never build one.
    pub resolved_prompt: Option<String>,
    pub usage: TokenUsage,
}

/// The result of a failed step: the normalized error together with the
/// attempts the retry wrapper consumed before giving up.
#[derive(Debug, Clone)]
pub struct StepFailure {
    pub error: PipelineError,
    pub attempts: u32,
}

/// Executes single actions against the collaborator seams.
pub struct StepExecutor {
    resolver: Option<Arc<dyn PromptResolver>>,
    fallback: TokenResolver,
    client: Arc<dyn InferenceClient>,
    store: Arc<dyn Store>,
    agents: Arc<HashMap<String, AgentConfig>>,
    presets: Arc<HashMap<String, String>>,
    gavels: Arc<GavelCoordinator>,
    events_tx: mpsc::Sender<Event>,
    preview: bool,
}

impl StepExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        resolver: Option<Arc<dyn PromptResolver>>,
        client: Arc<dyn InferenceClient>,
        store: Arc<dyn Store>,
        agents: Arc<HashMap<String, AgentConfig>>,
        presets: Arc<HashMap<String, String>>,
        gavels: Arc<GavelCoordinator>,
        events_tx: mpsc::Sender<Event>,
    ) -> Self {
        Self {
            resolver,
            fallback: TokenResolver::new(),
            client,
            store,
            agents,
            presets,
            gavels,
            events_tx,
            preview: false,
        }
    }

    /// Switch into non-destructive preview execution: store writes are
    /// expected to be intercepted by the installed store, and the
    /// inference client is never invoked.
    pub fn with_preview(mut self, preview: bool) -> Self {
        self.preview = preview;
        self
    }

    /// Execute one action under its retry policy.
    ///
    /// Cancellation is checked before every attempt and always wins over a
    /// scheduled retry.
    pub async fn execute_action(
        &self,
        action: &ActionDefinition,
        snap: &StepSnapshot,
        control: &RunControl,
    ) -> Result<StepSuccess, StepFailure> {
        retry::execute_with_retry(self, action, snap, control)
            .await
            .map_err(|failure| StepFailure {
                error: failure.error.with_step(&action.id),
                attempts: failure.attempts,
            })
    }

    /// One attempt of the four-stage pipeline.
    async fn execute_once(
        &self,
        action: &ActionDefinition,
        snap: &StepSnapshot,
        control: &RunControl,
        warnings: &mut Vec<String>,
    ) -> Result<(Value, Option<String>, TokenUsage), PipelineError> {
        // Stage 1 + 2: input and prompt resolution.
        self.progress(snap, ProgressStage::PromptResolving).await;
        let (input_value, store_snapshot) = self.resolve_input(action, snap).await?;
        let ctx = self.resolve_context(action, snap, input_value.clone(), store_snapshot);
        let resolved_prompt = self.resolve_prompt(action, &ctx, warnings).await?;

        // Stage 3: invocation.
        self.progress(snap, ProgressStage::LlmCalling).await;
        let (raw, usage) = self
            .invoke(action, snap, control, &input_value, resolved_prompt.as_deref(), warnings)
            .await?;

        // Stage 4a: parsing.
        self.progress(snap, ProgressStage::OutputParsing).await;
        let parsed = parse_output(action.shape, raw)?;

        // Stage 4b: routing. A store write is the only externally visible
        // side effect a step can have.
        let routing_stage = match &action.output {
            OutputTarget::Store { .. } => ProgressStage::StoreWriting,
            _ => ProgressStage::StepComplete,
        };
        self.progress(snap, routing_stage).await;
        if let OutputTarget::Store { store_id, key } = &action.output {
            self.store.write(store_id, key, parsed.clone()).await?;
        }

        Ok((parsed, resolved_prompt, usage))
    }

    async fn resolve_input(
        &self,
        action: &ActionDefinition,
        snap: &StepSnapshot,
    ) -> Result<(Value, Option<StoreSnapshot>), PipelineError> {
        match &action.input {
            InputSource::PipelineInput => Ok((snap.input.clone(), None)),
            InputSource::PreviousStep => Ok((
                snap.previous_output.clone().unwrap_or(Value::Null),
                None,
            )),
            InputSource::StoreData { store_id, key } => {
                let snapshot = self.store.snapshot(store_id).await?;
                let value = match key.as_deref() {
                    Some(key) => self.store.read(store_id, Some(key)).await?,
                    None => serde_json::to_value(&snapshot.data)
                        .map_err(|e| PipelineError::new(ErrorKind::Store, e.to_string()))?,
                };
                Ok((value, Some(snapshot)))
            }
            InputSource::StepPrompt => {
                let text = template_text_raw(action).unwrap_or_default();
                Ok((Value::String(text), None))
            }
            InputSource::Custom { value } => Ok((value.clone(), None)),
        }
    }

    fn resolve_context(
        &self,
        action: &ActionDefinition,
        snap: &StepSnapshot,
        input: Value,
        store_snapshot: Option<StoreSnapshot>,
    ) -> ResolveContext {
        ResolveContext {
            input,
            previous_output: snap.previous_output.clone(),
            variables: snap.variables.clone(),
            pipeline_id: snap.pipeline_id.clone(),
            pipeline_name: snap.pipeline_name.clone(),
            step_id: action.id.clone(),
            step_name: action.name.clone(),
            store_snapshot,
            started_at: Some(snap.started_at),
        }
    }

    /// Build and resolve the step's prompt.
    ///
    /// If an external resolver is configured and fails, fall back to the
    /// built-in token substitution and record a warning rather than failing
    /// the step.
    async fn resolve_prompt(
        &self,
        action: &ActionDefinition,
        ctx: &ResolveContext,
        warnings: &mut Vec<String>,
    ) -> Result<Option<String>, PipelineError> {
        let template = match self.template_text(action, ctx)? {
            Some(template) => template,
            None => return Ok(None),
        };

        let opts = ResolveOptions {
            preserve_unresolved: true,
        };

        if let Some(resolver) = &self.resolver {
            match resolver.resolve(&template, ctx, &opts).await {
                Ok(resolved) => return Ok(Some(resolved)),
                Err(error) => {
                    warnings.push(format!(
                        "prompt resolver failed for step '{}', using fallback: {error}",
                        action.id
                    ));
                }
            }
        }

        let resolved = self.fallback.resolve(&template, ctx, &opts).await?;
        Ok(Some(resolved))
    }

    /// Assemble the template text for the step's authoring mode, with the
    /// legacy inline `template` field as the fallback.
    fn template_text(
        &self,
        action: &ActionDefinition,
        ctx: &ResolveContext,
    ) -> Result<Option<String>, PipelineError> {
        match &action.prompt {
            Some(PromptConfig::Text { text }) => Ok(Some(text.clone())),
            Some(PromptConfig::Preset { name }) => self
                .presets
                .get(name)
                .cloned()
                .map(Some)
                .ok_or_else(|| {
                    PipelineError::new(ErrorKind::Prompt, format!("unknown prompt preset '{name}'"))
                }),
            Some(PromptConfig::Fragments { fragments }) => {
                let mut parts = Vec::new();
                for fragment in fragments {
                    match fragment {
                        PromptFragment::Text { text } => parts.push(text.clone()),
                        PromptFragment::Token { token } => parts.push(format!("{{{{{token}}}}}")),
                        PromptFragment::Conditional { when, then } => {
                            let set = ctx
                                .variables
                                .get(when)
                                .map(|v| !v.is_null() && v != &Value::String(String::new()))
                                .unwrap_or(false);
                            if set {
                                parts.push(then.clone());
                            }
                        }
                    }
                }
                Ok(Some(parts.join("\n")))
            }
            None => Ok(action.template.clone()),
        }
    }

    /// Stage 3 dispatch over the closed kind set.
    async fn invoke(
        &self,
        action: &ActionDefinition,
        snap: &StepSnapshot,
        control: &RunControl,
        input_value: &Value,
        prompt: Option<&str>,
        warnings: &mut Vec<String>,
    ) -> Result<(Value, TokenUsage), PipelineError> {
        match action.kind {
            // Engine-local kinds: no inference call.
            ActionKind::System | ActionKind::CrudPipeline => {
                let output = match prompt {
                    Some(text) => Value::String(text.to_string()),
                    None => input_value.clone(),
                };
                Ok((output, TokenUsage::default()))
            }

            ActionKind::UserGavel => {
                let current = snap.previous_output.clone().unwrap_or(Value::Null);
                if self.preview {
                    warnings.push(format!(
                        "checkpoint '{}' skipped in preview mode",
                        action.id
                    ));
                    return Ok((current, TokenUsage::default()));
                }
                let config = action.gavel.as_ref().ok_or_else(|| {
                    PipelineError::validation(format!(
                        "gavel action '{}' is missing its gavel config",
                        action.id
                    ))
                })?;
                let output = self
                    .gavels
                    .request_gavel(snap.run_id, config, current, control)
                    .await?;
                Ok((output, TokenUsage::default()))
            }

            // Rag retrieval happens in input resolution: a `StoreData`
            // input folds the store snapshot into the resolve context, so
            // by this point the three kinds invoke identically.
            ActionKind::Standard | ActionKind::CharacterWorkshop | ActionKind::RagPipeline => {
                let agents = self.validate_agents(action)?;
                let prompt = require_prompt(action, prompt)?;
                self.generate(action, &agents, prompt).await
            }

            ActionKind::DeliberativeRag => {
                let agents = self.validate_agents(action)?;
                let prompt = require_prompt(action, prompt)?;
                if self.preview {
                    return Ok((
                        placeholder_output(action),
                        TokenUsage {
                            prompt_tokens: (prompt.len() / 4) as u32,
                            completion_tokens: 0,
                        },
                    ));
                }
                // Draft pass, then a refine pass over the draft.
                let (draft, mut usage) = self
                    .timed_generate(action, &agents, prompt.to_string())
                    .await?;
                let refine_prompt = format!(
                    "Refine the draft below. Keep what works, fix what does not.\n\nDraft:\n{}",
                    draft.as_str().unwrap_or_default()
                );
                let (refined, refine_usage) = self
                    .timed_generate(action, &agents, refine_prompt)
                    .await?;
                usage.add(refine_usage);
                Ok((refined, usage))
            }
        }
    }

    /// Validate agent configuration before any network call; a broken
    /// configuration fails fast with a `validation` error.
    fn validate_agents(&self, action: &ActionDefinition) -> Result<Vec<AgentConfig>, PipelineError> {
        let names: Vec<&String> = if action.participants.is_empty() {
            match &action.agent {
                Some(name) => vec![name],
                None => {
                    return Err(PipelineError::new(
                        ErrorKind::Agent,
                        format!("action '{}' names no agent or participants", action.id),
                    ))
                }
            }
        } else {
            action.participants.iter().collect()
        };

        let has_step_prompt = action.prompt.is_some() || action.template.is_some();
        let mut configs = Vec::with_capacity(names.len());
        for name in names {
            let config = self.agents.get(name).ok_or_else(|| {
                PipelineError::new(ErrorKind::Agent, format!("unknown agent '{name}'"))
            })?;
            if !config.is_usable(has_step_prompt) {
                return Err(PipelineError::validation(format!(
                    "agent '{name}' is not usable: missing generation parameters or prompt source"
                )));
            }
            configs.push(config.clone());
        }
        Ok(configs)
    }

    async fn generate(
        &self,
        action: &ActionDefinition,
        agents: &[AgentConfig],
        prompt: &str,
    ) -> Result<(Value, TokenUsage), PipelineError> {
        if self.preview {
            // Preview never touches the network; synthesize from the
            // declared output shape.
            return Ok((
                placeholder_output(action),
                TokenUsage {
                    prompt_tokens: (prompt.len() / 4) as u32,
                    completion_tokens: 0,
                },
            ));
        }
        self.timed_generate(action, agents, prompt.to_string()).await
    }

    /// Race the orchestrated invocation against the step timeout.
    async fn timed_generate(
        &self,
        action: &ActionDefinition,
        agents: &[AgentConfig],
        prompt: String,
    ) -> Result<(Value, TokenUsage), PipelineError> {
        let call = participants::orchestrate(
            Arc::clone(&self.client),
            action.execution,
            agents.to_vec(),
            prompt,
        );

        let (text, usage) = match action.timeout_ms {
            Some(timeout_ms) => {
                let deadline = tokio::time::Duration::from_millis(timeout_ms);
                match tokio::time::timeout(deadline, call).await {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(PipelineError::new(
                            ErrorKind::Timeout,
                            format!("step '{}' exceeded {timeout_ms}ms", action.id),
                        ))
                    }
                }
            }
            None => call.await?,
        };

        Ok((Value::String(text), usage))
    }

    async fn progress(&self, snap: &StepSnapshot, stage: ProgressStage) {
        emit(
            &self.events_tx,
            Event::Progress {
                run_id: snap.run_id,
                phase: snap.phase_name.clone(),
                stage,
                percentage: snap.progress.percentage,
                actions_completed: snap.progress.actions_completed,
                actions_total: snap.progress.actions_total,
            },
        )
        .await;
    }
}

fn require_prompt<'a>(
    action: &ActionDefinition,
    prompt: Option<&'a str>,
) -> Result<&'a str, PipelineError> {
    prompt.ok_or_else(|| {
        PipelineError::validation(format!("action '{}' has no prompt source", action.id))
    })
}

/// The raw template text without conditional evaluation, used when the step
/// takes its own unresolved template as input.
fn template_text_raw(action: &ActionDefinition) -> Option<String> {
    match &action.prompt {
        Some(PromptConfig::Text { text }) => Some(text.clone()),
        Some(PromptConfig::Preset { name }) => Some(format!("{{{{preset:{name}}}}}")),
        Some(PromptConfig::Fragments { fragments }) => Some(
            fragments
                .iter()
                .map(|f| match f {
                    PromptFragment::Text { text } => text.clone(),
                    PromptFragment::Token { token } => format!("{{{{{token}}}}}"),
                    PromptFragment::Conditional { then, .. } => then.clone(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        None => action.template.clone(),
    }
}

/// Parse the raw result according to the step's declared output shape.
fn parse_output(shape: OutputShape, raw: Value) -> Result<Value, PipelineError> {
    let text = match raw {
        Value::String(text) => text,
        structured => return Ok(structured),
    };

    match shape {
        OutputShape::Text => Ok(Value::String(text)),
        OutputShape::Json => {
            let stripped = strip_code_fences(&text);
            serde_json::from_str(stripped).map_err(|e| {
                PipelineError::new(ErrorKind::Parse, format!("invalid JSON output: {e}"))
            })
        }
        OutputShape::List => {
            let stripped = strip_code_fences(&text);
            if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(stripped) {
                return Ok(Value::Array(items));
            }
            let items: Vec<Value> = text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(|line| Value::String(line.to_string()))
                .collect();
            Ok(Value::Array(items))
        }
    }
}

/// Simulated completion used by preview mode instead of a network call.
fn placeholder_output(action: &ActionDefinition) -> Value {
    match action.shape {
        OutputShape::Text => Value::String(format!("[preview] simulated output of '{}'", action.name)),
        OutputShape::Json => serde_json::json!({ "preview": true, "action": action.id }),
        OutputShape::List => serde_json::json!([
            format!("[preview] {} item 1", action.name),
            format!("[preview] {} item 2", action.name),
        ]),
    }
}

fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_suffix("```").unwrap_or(inner);
    // Drop a language tag on the opening fence.
    match inner.find('\n') {
        Some(newline) => inner[newline..].trim(),
        None => inner.trim(),
    }
}
