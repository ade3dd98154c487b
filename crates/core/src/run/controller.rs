//! The run controller.
//!
//! Owns every execution: pipeline, agent, and preset registries; one live
//! state and control channel per run; a bounded history of terminal runs;
//! and the gavel coordinator. All lifecycle operations (`start_run`,
//! `pause_run`, `resume_run`, `abort_run`) go through here.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::mpsc;
use uuid::Uuid;

use rk_protocol::agent_models::AgentConfig;
use rk_protocol::error_models::{ErrorKind, PipelineError};
use rk_protocol::events::Event;
use rk_protocol::gavel_models::{GavelModifications, GavelRequest};
use rk_protocol::pipeline_models::{DeliveryMode, PipelineDefinition};
use rk_protocol::run_models::{FinalOutput, RunProgress, RunRecord, RunStatus};

use crate::gavel::GavelCoordinator;
use crate::inference::InferenceClient;
use crate::phase::PhaseRunner;
use crate::resolver::PromptResolver;
use crate::run::state::{emit, RunControl, RunState};
use crate::executor::StepExecutor;
use crate::store::Store;

/// Terminal runs kept in history before the oldest is dropped.
const MAX_HISTORY: usize = 20;

/// Caller-settable knobs for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub verbose: bool,
    /// Run-level override: recoverable step failures are recorded and
    /// execution proceeds, even in phases that don't opt in themselves.
    pub continue_on_error: bool,
    /// Seed variables visible to token resolution from the first step.
    pub variables: HashMap<String, Value>,
}

struct RunHandle {
    state: Arc<Mutex<RunState>>,
    control: Arc<RunControl>,
}

/// Coordinates pipeline executions end to end.
pub struct RunController {
    pipelines: RwLock<HashMap<String, PipelineDefinition>>,
    agents: RwLock<HashMap<String, AgentConfig>>,
    presets: RwLock<HashMap<String, String>>,
    runs: Mutex<HashMap<Uuid, RunHandle>>,
    history: Mutex<VecDeque<RunRecord>>,
    /// Injection tokens already resolved, keyed by retrieval pipeline id.
    retrieval_cache: Mutex<HashMap<String, Value>>,
    gavels: Arc<GavelCoordinator>,
    resolver: Option<Arc<dyn PromptResolver>>,
    client: Arc<dyn InferenceClient>,
    store: Arc<dyn Store>,
    events_tx: mpsc::Sender<Event>,
}

impl RunController {
    pub fn new(
        client: Arc<dyn InferenceClient>,
        store: Arc<dyn Store>,
        events_tx: mpsc::Sender<Event>,
    ) -> Self {
        Self {
            pipelines: RwLock::new(HashMap::new()),
            agents: RwLock::new(HashMap::new()),
            presets: RwLock::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            retrieval_cache: Mutex::new(HashMap::new()),
            gavels: Arc::new(GavelCoordinator::new(events_tx.clone())),
            resolver: None,
            client,
            store,
            events_tx,
        }
    }

    /// Install an external prompt resolver. The built-in token substitution
    /// remains the fallback when it fails.
    pub fn with_resolver(mut self, resolver: Arc<dyn PromptResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    // ---- registries ----

    pub fn register_pipeline(&self, pipeline: PipelineDefinition) -> Result<(), PipelineError> {
        pipeline.validate().map_err(PipelineError::validation)?;
        self.write_pipelines().insert(pipeline.id.clone(), pipeline);
        Ok(())
    }

    pub fn register_agent(&self, agent: AgentConfig) {
        self.write_agents().insert(agent.name.clone(), agent);
    }

    pub fn register_preset(&self, name: &str, template: &str) {
        self.write_presets()
            .insert(name.to_string(), template.to_string());
    }

    pub fn get_pipeline(&self, pipeline_id: &str) -> Option<PipelineDefinition> {
        self.read_pipelines().get(pipeline_id).cloned()
    }

    /// Change a registered pipeline's delivery mode. Rejected while a run
    /// of that pipeline is active; the mode is fixed at `start_run`.
    pub fn set_delivery_mode(
        &self,
        pipeline_id: &str,
        delivery: DeliveryMode,
    ) -> Result<(), PipelineError> {
        if self.find_active_run(pipeline_id).is_some() {
            return Err(PipelineError::validation(format!(
                "pipeline '{pipeline_id}' has an active run; delivery mode is locked"
            )));
        }
        let mut pipelines = self.write_pipelines();
        let pipeline = pipelines.get_mut(pipeline_id).ok_or_else(|| {
            PipelineError::validation(format!("unknown pipeline '{pipeline_id}'"))
        })?;
        pipeline.delivery = delivery;
        Ok(())
    }

    // ---- lifecycle ----

    /// Validate, register, and launch a run. The state is registered before
    /// the drive task is spawned so the returned id is immediately usable
    /// with every other operation.
    pub async fn start_run(
        self: &Arc<Self>,
        pipeline_id: &str,
        input: Value,
    ) -> Result<Uuid, PipelineError> {
        self.start_run_with(pipeline_id, input, RunOptions::default())
            .await
    }

    pub async fn start_run_with(
        self: &Arc<Self>,
        pipeline_id: &str,
        input: Value,
        options: RunOptions,
    ) -> Result<Uuid, PipelineError> {
        let pipeline = self.get_pipeline(pipeline_id).ok_or_else(|| {
            PipelineError::validation(format!("unknown pipeline '{pipeline_id}'"))
        })?;
        pipeline.validate().map_err(PipelineError::validation)?;

        if let Some(active) = self.find_active_run(pipeline_id) {
            return Err(PipelineError::validation(format!(
                "pipeline '{pipeline_id}' already has active run {active}"
            )));
        }

        let mut state = RunState::new(
            pipeline.id.clone(),
            pipeline.name.clone(),
            input,
            pipeline.phases.len(),
            pipeline.total_actions(),
        );
        state.status = RunStatus::Running;
        state.context.verbose = options.verbose;
        state.context.continue_on_error = options.continue_on_error;
        state.context.variables = options.variables;
        let run_id = state.run_id;

        let state = Arc::new(Mutex::new(state));
        let control = Arc::new(RunControl::new());
        self.lock_runs().insert(
            run_id,
            RunHandle {
                state: Arc::clone(&state),
                control: Arc::clone(&control),
            },
        );

        emit(
            &self.events_tx,
            Event::RunStarted {
                run_id,
                pipeline_id: pipeline.id.clone(),
            },
        )
        .await;

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            controller.drive(pipeline, state, control).await;
        });

        Ok(run_id)
    }

    /// The spawned per-run drive loop: phases in order, a control checkpoint
    /// between each, then terminal finalization.
    async fn drive(
        self: Arc<Self>,
        pipeline: PipelineDefinition,
        state: Arc<Mutex<RunState>>,
        control: Arc<RunControl>,
    ) {
        let executor = Arc::new(self.build_executor(false));
        let runner = PhaseRunner::new(executor, self.events_tx.clone());

        let result = self
            .run_phases(&pipeline, &runner, &state, &control)
            .await;
        self.finalize(&pipeline, &state, result).await;
    }

    async fn run_phases(
        &self,
        pipeline: &PipelineDefinition,
        runner: &PhaseRunner,
        state: &Arc<Mutex<RunState>>,
        control: &RunControl,
    ) -> Result<Value, PipelineError> {
        let mut last = Value::Null;
        for (index, phase) in pipeline.phases.iter().enumerate() {
            control.checkpoint().await?;
            last = runner.run_phase(phase, index, state, control).await?;
        }
        Ok(last)
    }

    fn build_executor(&self, preview: bool) -> StepExecutor {
        StepExecutor::new(
            self.resolver.clone(),
            Arc::clone(&self.client),
            Arc::clone(&self.store),
            Arc::new(self.read_agents().clone()),
            Arc::new(self.read_presets().clone()),
            Arc::clone(&self.gavels),
            self.events_tx.clone(),
        )
        .with_preview(preview)
    }

    /// Map the drive result to a terminal status, deliver the output, and
    /// record the run in bounded history. The live handle is dropped once
    /// the record exists; post-terminal inspection reads history.
    async fn finalize(
        self: &Arc<Self>,
        pipeline: &PipelineDefinition,
        state: &Arc<Mutex<RunState>>,
        result: Result<Value, PipelineError>,
    ) {
        let terminal = match result {
            Ok(last) => match self.deliver(pipeline, last).await {
                Ok(output) => Ok(output),
                Err(error) => Err(error),
            },
            Err(error) => Err(error),
        };

        let (event, record) = {
            let mut guard = lock(state);
            guard.finished_at = Some(chrono::Utc::now());

            let event = match terminal {
                Ok(output) => {
                    guard.status = RunStatus::Completed;
                    guard.final_output = Some(output);
                    guard.progress.update();
                    let duration_ms = (chrono::Utc::now() - guard.started_at)
                        .num_milliseconds()
                        .max(0) as u64;
                    Event::RunCompleted {
                        run_id: guard.run_id,
                        pipeline_id: guard.pipeline_id.clone(),
                        duration_ms,
                    }
                }
                Err(error) if error.kind == ErrorKind::Cancelled => {
                    guard.status = RunStatus::Aborted;
                    guard.context.errors.push(error);
                    Event::RunAborted {
                        run_id: guard.run_id,
                        pipeline_id: guard.pipeline_id.clone(),
                    }
                }
                Err(error) => {
                    guard.status = RunStatus::Error;
                    guard.context.errors.push(error.clone());
                    Event::RunError {
                        run_id: guard.run_id,
                        pipeline_id: guard.pipeline_id.clone(),
                        error,
                    }
                }
            };
            (event, guard.to_record())
        };

        let run_id = record.run_id;
        {
            let mut history = self.lock_history();
            history.push_back(record);
            while history.len() > MAX_HISTORY {
                history.pop_front();
            }
        }
        self.lock_runs().remove(&run_id);

        emit(&self.events_tx, event).await;
    }

    /// Produce the final output for the pipeline's delivery mode.
    async fn deliver(
        self: &Arc<Self>,
        pipeline: &PipelineDefinition,
        last: Value,
    ) -> Result<FinalOutput, PipelineError> {
        match &pipeline.delivery {
            DeliveryMode::Synthesis => Ok(FinalOutput::Content { value: last }),
            DeliveryMode::Compilation => {
                let prompt = match last {
                    Value::String(text) => text,
                    other => other.to_string(),
                };
                Ok(FinalOutput::CompiledPrompt { prompt })
            }
            DeliveryMode::Injection { mappings } => {
                let mut tokens = HashMap::new();
                for (token, retrieval_id) in mappings {
                    let value = self.execute_retrieval(retrieval_id).await?;
                    tokens.insert(token.clone(), value);
                }
                Ok(FinalOutput::Injection { tokens })
            }
        }
    }

    /// Resolve an injection token by executing its retrieval pipeline once.
    /// Results are cached; a repeated token costs nothing.
    pub async fn execute_retrieval(
        self: &Arc<Self>,
        pipeline_id: &str,
    ) -> Result<Value, PipelineError> {
        if let Some(cached) = self.lock_cache().get(pipeline_id).cloned() {
            return Ok(cached);
        }

        let pipeline = self.get_pipeline(pipeline_id).ok_or_else(|| {
            PipelineError::validation(format!("unknown retrieval pipeline '{pipeline_id}'"))
        })?;
        pipeline.validate().map_err(PipelineError::validation)?;

        // Retrieval runs inline and unregistered: it cannot be paused or
        // aborted independently and never counts as an active run.
        let state = Arc::new(Mutex::new(RunState::new(
            pipeline.id.clone(),
            pipeline.name.clone(),
            Value::Null,
            pipeline.phases.len(),
            pipeline.total_actions(),
        )));
        let control = RunControl::new();
        let executor = Arc::new(self.build_executor(false));
        let runner = PhaseRunner::new(executor, self.events_tx.clone());
        let value = self
            .run_phases(&pipeline, &runner, &state, &control)
            .await?;

        self.lock_cache()
            .insert(pipeline_id.to_string(), value.clone());
        Ok(value)
    }

    /// Dry-run a registered pipeline without touching any live state.
    pub async fn preview_run(
        &self,
        pipeline_id: &str,
        input: Value,
    ) -> Result<crate::preview::PreviewReport, PipelineError> {
        let pipeline = self.get_pipeline(pipeline_id).ok_or_else(|| {
            PipelineError::validation(format!("unknown pipeline '{pipeline_id}'"))
        })?;
        let engine = crate::preview::PreviewEngine::new(
            self.resolver.clone(),
            Arc::clone(&self.client),
            Arc::clone(&self.store),
            Arc::new(self.read_agents().clone()),
            Arc::new(self.read_presets().clone()),
            self.events_tx.clone(),
        );
        engine.preview(&pipeline, input).await
    }

    /// Pause at the next step boundary. A no-op unless the run is running.
    pub async fn pause_run(&self, run_id: Uuid) -> Result<(), PipelineError> {
        {
            let runs = self.lock_runs();
            let Some(handle) = runs.get(&run_id) else {
                drop(runs);
                return self.terminal_no_op(run_id);
            };
            let mut guard = lock(&handle.state);
            if guard.status != RunStatus::Running {
                return Ok(());
            }
            guard.status = RunStatus::Paused;
            handle.control.pause();
        }

        emit(&self.events_tx, Event::RunPaused { run_id }).await;
        Ok(())
    }

    /// Resume a paused run. A no-op unless the run is paused.
    pub async fn resume_run(&self, run_id: Uuid) -> Result<(), PipelineError> {
        {
            let runs = self.lock_runs();
            let Some(handle) = runs.get(&run_id) else {
                drop(runs);
                return self.terminal_no_op(run_id);
            };
            let mut guard = lock(&handle.state);
            if guard.status != RunStatus::Paused {
                return Ok(());
            }
            guard.status = RunStatus::Running;
            handle.control.resume();
        }

        emit(&self.events_tx, Event::RunResumed { run_id }).await;
        Ok(())
    }

    /// Signal cancellation. The in-flight step unwinds at its next
    /// suspension point; the run then lands on `Aborted`. A no-op on a
    /// terminal run.
    pub async fn abort_run(&self, run_id: Uuid) -> Result<(), PipelineError> {
        {
            let runs = self.lock_runs();
            let Some(handle) = runs.get(&run_id) else {
                drop(runs);
                return self.terminal_no_op(run_id);
            };
            if lock(&handle.state).status.is_terminal() {
                return Ok(());
            }
            handle.control.cancel();
        }

        emit(&self.events_tx, Event::RunAborting { run_id }).await;
        Ok(())
    }

    /// Lifecycle operations on a run that already finalized into history
    /// succeed as no-ops; a never-seen id is an error.
    fn terminal_no_op(&self, run_id: Uuid) -> Result<(), PipelineError> {
        if self.find_record(run_id).is_some() {
            Ok(())
        } else {
            Err(unknown_run(run_id))
        }
    }

    /// Compatibility alias for [`abort_run`](Self::abort_run).
    pub async fn cancel_execution(&self, run_id: Uuid) -> Result<(), PipelineError> {
        self.abort_run(run_id).await
    }

    // ---- inspection ----

    /// A point-in-time record of the run: live runs are sampled under
    /// their lock, terminal runs come from history.
    pub fn get_run_state(&self, run_id: Uuid) -> Option<RunRecord> {
        let live = self
            .lock_runs()
            .get(&run_id)
            .map(|handle| lock(&handle.state).to_record());
        live.or_else(|| self.find_record(run_id))
    }

    pub fn get_progress(&self, run_id: Uuid) -> Option<RunProgress> {
        self.get_run_state(run_id).map(|record| record.progress)
    }

    pub fn get_output(&self, run_id: Uuid) -> Option<FinalOutput> {
        self.get_run_state(run_id)
            .and_then(|record| record.final_output)
    }

    pub fn history(&self) -> Vec<RunRecord> {
        self.lock_history().iter().cloned().collect()
    }

    /// Runs that still hold live state. Terminal runs drop out once they
    /// are finalized into history.
    pub fn active_run_count(&self) -> usize {
        self.lock_runs().len()
    }

    fn find_record(&self, run_id: Uuid) -> Option<RunRecord> {
        self.lock_history()
            .iter()
            .rev()
            .find(|record| record.run_id == run_id)
            .cloned()
    }

    fn find_active_run(&self, pipeline_id: &str) -> Option<Uuid> {
        self.lock_runs().iter().find_map(|(run_id, handle)| {
            let guard = lock(&handle.state);
            (guard.pipeline_id == pipeline_id && guard.status.is_active()).then_some(*run_id)
        })
    }

    // ---- gavel pass-throughs ----

    pub async fn approve_gavel(
        &self,
        gavel_id: Uuid,
        modifications: Option<GavelModifications>,
    ) -> Result<(), PipelineError> {
        self.gavels.approve_gavel(gavel_id, modifications).await
    }

    pub async fn reject_gavel(
        &self,
        gavel_id: Uuid,
        reason: Option<String>,
    ) -> Result<(), PipelineError> {
        self.gavels.reject_gavel(gavel_id, reason).await
    }

    pub async fn skip_gavel(&self, gavel_id: Uuid) -> Result<(), PipelineError> {
        self.gavels.skip_gavel(gavel_id).await
    }

    pub fn get_active_gavel(&self, run_id: Uuid) -> Option<GavelRequest> {
        self.gavels.get_active_gavel(run_id)
    }

    // ---- lock helpers ----

    fn lock_runs(&self) -> MutexGuard<'_, HashMap<Uuid, RunHandle>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_history(&self) -> MutexGuard<'_, VecDeque<RunRecord>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.retrieval_cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_pipelines(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, PipelineDefinition>> {
        self.pipelines.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_pipelines(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, PipelineDefinition>> {
        self.pipelines.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read_agents(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, AgentConfig>> {
        self.agents.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_agents(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, AgentConfig>> {
        self.agents.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read_presets(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, String>> {
        self.presets.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_presets(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, String>> {
        self.presets.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn lock(state: &Arc<Mutex<RunState>>) -> MutexGuard<'_, RunState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn unknown_run(run_id: Uuid) -> PipelineError {
    PipelineError::validation(format!("unknown run {run_id}"))
}
