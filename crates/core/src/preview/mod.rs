//! Preview (dry-run) execution.
//!
//! A preview walks every step of a pipeline without calling the inference
//! client and without mutating any store: prompts are resolved for real,
//! completions are synthesized placeholders, and writes are captured by an
//! intercepting store layer. The result is a report of what a live run
//! would do, including the problems it would hit.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

use rk_protocol::agent_models::AgentConfig;
use rk_protocol::error_models::PipelineError;
use rk_protocol::events::Event;
use rk_protocol::pipeline_models::{ActionKind, OutputTarget, PipelineDefinition};
use rk_protocol::run_models::RunProgress;

use crate::executor::{StepExecutor, StepSnapshot};
use crate::gavel::GavelCoordinator;
use crate::inference::InferenceClient;
use crate::resolver::PromptResolver;
use crate::run::state::RunControl;
use crate::store::{Store, StoreError, StoreSnapshot};

const PROMPT_EXCERPT_LEN: usize = 200;

/// Rough blended price per token used for the cost estimate.
const COST_PER_TOKEN_USD: f64 = 2e-6;

/// One write a live run would have performed.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PreviewWrite {
    pub store_id: String,
    pub key: String,
    pub value: Value,
}

/// A store layer that records writes instead of applying them.
///
/// Reads consult the recorded writes first so later steps in the same
/// preview observe a consistent view, then fall through to the backing
/// store.
pub struct PreviewStore {
    inner: Arc<dyn Store>,
    writes: Mutex<Vec<PreviewWrite>>,
}

impl PreviewStore {
    pub fn new(inner: Arc<dyn Store>) -> Self {
        Self {
            inner,
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn writes(&self) -> Vec<PreviewWrite> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PreviewWrite>> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn overlay(&self, store_id: &str, key: &str) -> Option<Value> {
        self.lock()
            .iter()
            .rev()
            .find(|w| w.store_id == store_id && w.key == key)
            .map(|w| w.value.clone())
    }
}

#[async_trait]
impl Store for PreviewStore {
    async fn read(&self, store_id: &str, key: Option<&str>) -> Result<Value, StoreError> {
        if let Some(key) = key {
            if let Some(value) = self.overlay(store_id, key) {
                return Ok(value);
            }
        }
        self.inner.read(store_id, key).await
    }

    async fn write(&self, store_id: &str, key: &str, value: Value) -> Result<(), StoreError> {
        self.lock().push(PreviewWrite {
            store_id: store_id.to_string(),
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    async fn snapshot(&self, store_id: &str) -> Result<StoreSnapshot, StoreError> {
        let mut snapshot = match self.inner.snapshot(store_id).await {
            Ok(snapshot) => snapshot,
            // A store that exists only through previewed writes still
            // snapshots cleanly.
            Err(StoreError::StoreNotFound { .. }) => StoreSnapshot {
                count: 0,
                keys: Vec::new(),
                data: Default::default(),
                is_singleton: false,
            },
            Err(error) => return Err(error),
        };
        for write in self.lock().iter().filter(|w| w.store_id == store_id) {
            snapshot.data.insert(write.key.clone(), write.value.clone());
        }
        snapshot.keys = snapshot.data.keys().cloned().collect();
        snapshot.count = snapshot.data.len();
        Ok(snapshot)
    }
}

/// What one step of the previewed pipeline would do.
#[derive(Serialize, Debug, Clone)]
pub struct StepPreview {
    pub action_id: String,
    pub action_name: String,
    pub kind: ActionKind,
    /// The actually-resolved prompt, truncated for display.
    pub prompt_excerpt: Option<String>,
    /// The placeholder output a live run's completion would replace.
    pub output: Option<Value>,
    /// The error a live run would halt (or continue) on.
    pub issue: Option<PipelineError>,
    pub estimated_tokens: u64,
}

/// The full dry-run report.
#[derive(Serialize, Debug, Clone)]
pub struct PreviewReport {
    pub pipeline_id: String,
    pub steps: Vec<StepPreview>,
    pub writes: Vec<PreviewWrite>,
    pub warnings: Vec<String>,
    pub estimated_tokens: u64,
    pub estimated_cost_usd: f64,
}

impl PreviewReport {
    pub fn issue_count(&self) -> usize {
        self.steps.iter().filter(|s| s.issue.is_some()).count()
    }
}

/// Walks a pipeline in dry-run mode.
pub struct PreviewEngine {
    resolver: Option<Arc<dyn PromptResolver>>,
    client: Arc<dyn InferenceClient>,
    store: Arc<dyn Store>,
    agents: Arc<HashMap<String, AgentConfig>>,
    presets: Arc<HashMap<String, String>>,
    events_tx: mpsc::Sender<Event>,
}

impl PreviewEngine {
    pub fn new(
        resolver: Option<Arc<dyn PromptResolver>>,
        client: Arc<dyn InferenceClient>,
        store: Arc<dyn Store>,
        agents: Arc<HashMap<String, AgentConfig>>,
        presets: Arc<HashMap<String, String>>,
        events_tx: mpsc::Sender<Event>,
    ) -> Self {
        Self {
            resolver,
            client,
            store,
            agents,
            presets,
            events_tx,
        }
    }

    /// Preview every step of the pipeline. Unlike a live run, a failing
    /// step never halts the walk: the report covers the whole pipeline so
    /// all problems surface at once.
    pub async fn preview(
        &self,
        pipeline: &PipelineDefinition,
        input: Value,
    ) -> Result<PreviewReport, PipelineError> {
        pipeline.validate().map_err(PipelineError::validation)?;

        let preview_store = Arc::new(PreviewStore::new(Arc::clone(&self.store)));
        let gavels = Arc::new(GavelCoordinator::new(self.events_tx.clone()));
        let executor = StepExecutor::new(
            self.resolver.clone(),
            Arc::clone(&self.client),
            Arc::clone(&preview_store) as Arc<dyn Store>,
            Arc::clone(&self.agents),
            Arc::clone(&self.presets),
            gavels,
            self.events_tx.clone(),
        )
        .with_preview(true);
        let control = RunControl::new();

        let run_id = Uuid::new_v4();
        let started_at = chrono::Utc::now();
        let total_actions = pipeline.total_actions();
        let mut progress = RunProgress::new(pipeline.phases.len(), total_actions);

        let mut steps = Vec::with_capacity(total_actions);
        let mut warnings = Vec::new();
        let mut estimated_tokens: u64 = 0;
        let mut previous_output: Option<Value> = None;
        let mut variables: HashMap<String, Value> = HashMap::new();
        let mut globals: HashMap<String, Value> = HashMap::new();

        for phase in &pipeline.phases {
            for (action_index, action) in phase.actions.iter().enumerate() {
                let mut snapshot_vars = globals.clone();
                snapshot_vars.extend(variables.clone());
                let snap = StepSnapshot {
                    run_id,
                    pipeline_id: pipeline.id.clone(),
                    pipeline_name: pipeline.name.clone(),
                    phase_id: phase.id.clone(),
                    phase_name: phase.name.clone(),
                    step_index: action_index,
                    total_steps: phase.actions.len(),
                    input: input.clone(),
                    previous_output: previous_output.clone(),
                    variables: snapshot_vars,
                    progress,
                    started_at,
                };

                match executor.execute_action(action, &snap, &control).await {
                    Ok(success) => {
                        let step_tokens = estimate_step_tokens(
                            action,
                            &self.agents,
                            u64::from(success.usage.prompt_tokens),
                        );
                        estimated_tokens += step_tokens;
                        warnings.extend(success.warnings.clone());

                        match &action.output {
                            OutputTarget::NextStep => {
                                previous_output = Some(success.output.clone());
                            }
                            OutputTarget::Variable { name } => {
                                variables.insert(name.clone(), success.output.clone());
                            }
                            OutputTarget::Store { .. } => {}
                        }
                        if action.export {
                            globals.insert(action.id.clone(), success.output.clone());
                        }

                        progress.actions_completed += 1;
                        progress.update();

                        steps.push(StepPreview {
                            action_id: action.id.clone(),
                            action_name: action.name.clone(),
                            kind: action.kind,
                            prompt_excerpt: success
                                .resolved_prompt
                                .as_deref()
                                .map(|p| excerpt(p, PROMPT_EXCERPT_LEN)),
                            output: Some(success.output),
                            issue: None,
                            estimated_tokens: step_tokens,
                        });
                    }
                    Err(failure) => {
                        steps.push(StepPreview {
                            action_id: action.id.clone(),
                            action_name: action.name.clone(),
                            kind: action.kind,
                            prompt_excerpt: None,
                            output: None,
                            issue: Some(failure.error),
                            estimated_tokens: 0,
                        });
                    }
                }
            }
        }

        Ok(PreviewReport {
            pipeline_id: pipeline.id.clone(),
            steps,
            writes: preview_store.writes(),
            warnings,
            estimated_tokens,
            estimated_cost_usd: estimated_tokens as f64 * COST_PER_TOKEN_USD,
        })
    }
}

/// Prompt tokens come from the resolved prompt; completion tokens are
/// bounded by the agent's configured maximum.
fn estimate_step_tokens(
    action: &rk_protocol::pipeline_models::ActionDefinition,
    agents: &HashMap<String, AgentConfig>,
    prompt_tokens: u64,
) -> u64 {
    let calls_model = matches!(
        action.kind,
        ActionKind::Standard
            | ActionKind::RagPipeline
            | ActionKind::DeliberativeRag
            | ActionKind::CharacterWorkshop
    );
    if !calls_model {
        return 0;
    }

    let completion_budget: u64 = action
        .participants
        .iter()
        .chain(action.agent.as_ref())
        .filter_map(|name| agents.get(name))
        .map(|agent| u64::from(agent.generation.max_tokens))
        .sum();
    // The deliberative kind makes a refine pass on top of the draft.
    let passes = if action.kind == ActionKind::DeliberativeRag {
        2
    } else {
        1
    };
    (prompt_tokens + completion_budget.max(1)) * passes
}

fn excerpt(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &text[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_preview_store_records_instead_of_applying() {
        let backing = Arc::new(MemoryStore::new().with_collection("cast", vec![]));
        let preview = PreviewStore::new(Arc::clone(&backing) as Arc<dyn Store>);

        preview
            .write("cast", "mira", json!({"name": "Mira"}))
            .await
            .unwrap();

        // The backing store stays untouched.
        assert!(backing.read("cast", Some("mira")).await.is_err());
        assert_eq!(preview.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_preview_store_reads_its_own_writes() {
        let backing = Arc::new(MemoryStore::new());
        let preview = PreviewStore::new(backing as Arc<dyn Store>);

        preview.write("notes", "k", json!("v")).await.unwrap();
        assert_eq!(preview.read("notes", Some("k")).await.unwrap(), json!("v"));

        let snapshot = preview.snapshot("notes").await.unwrap();
        assert_eq!(snapshot.count, 1);
    }

    #[test]
    fn test_excerpt_truncates_on_char_boundary() {
        let text = "héllo wörld".repeat(40);
        let cut = excerpt(&text, 200);
        assert!(cut.len() <= 204);
        assert!(cut.ends_with('…'));
        assert_eq!(excerpt("short", 200), "short");
    }
}
