//! Pipeline definition models.
//!
//! A pipeline is a named, ordered list of phases; each phase is an ordered
//! list of actions. Definitions are immutable once a run starts — the engine
//! treats them as read-only input.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::gavel_models::GavelConfig;

/// The closed set of action kinds the engine can execute.
///
/// Dispatch over this enum is a single `match` in the step executor; the set
/// is small and fixed, so new kinds are an engine change, not a config change.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// A prompt-resolve-and-generate step, optionally multi-participant.
    Standard,
    /// A store-oriented step: reads and/or writes a persistent collection
    /// without invoking the inference client.
    CrudPipeline,
    /// Retrieval-augmented generation: a store snapshot is folded into the
    /// resolve context before the inference call.
    RagPipeline,
    /// Retrieval followed by a draft pass and a refine pass (two calls).
    DeliberativeRag,
    /// A human-approval checkpoint. Execution suspends until a reviewer
    /// approves, rejects, or skips the in-flight output.
    UserGavel,
    /// An engine-local transform (variable export, passthrough). No LLM.
    System,
    /// Multi-participant character generation; behaves like `Standard`
    /// with participants required.
    CharacterWorkshop,
}

/// Where an action's input comes from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum InputSource {
    /// The original input the run was started with.
    PipelineInput,
    /// The previous action's output.
    PreviousStep,
    /// A read-only snapshot of a named persistent collection.
    StoreData {
        store_id: String,
        #[serde(default)]
        key: Option<String>,
    },
    /// The action's own (unresolved) template text.
    StepPrompt,
    /// A literal value embedded in the definition.
    Custom { value: Value },
}

impl Default for InputSource {
    fn default() -> Self {
        InputSource::PreviousStep
    }
}

/// One fragment of a stacked prompt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "fragment", rename_all = "snake_case")]
pub enum PromptFragment {
    /// Literal text, copied verbatim.
    Text { text: String },
    /// A single token to resolve, e.g. `input` or `variables.tone`.
    Token { token: String },
    /// Included only when the named variable is set and non-empty.
    Conditional { when: String, then: String },
}

/// How an action's prompt is authored.
///
/// Three modes are supported; the legacy inline `template` field on
/// [`ActionDefinition`] is the fallback when none is set.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PromptConfig {
    /// Free text with `{{token}}` placeholders.
    Text { text: String },
    /// A named preset looked up from the controller's preset registry.
    Preset { name: String },
    /// An ordered stack of fragments assembled top to bottom.
    Fragments { fragments: Vec<PromptFragment> },
}

/// Where an action's parsed output is routed. Exactly one destination.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum OutputTarget {
    /// Feed forward as the next action's `previous_step` input.
    NextStep,
    /// Write into a named run-scoped variable.
    Variable { name: String },
    /// Write into a persistent store. The only externally visible side
    /// effect a step can have.
    Store { store_id: String, key: String },
}

impl Default for OutputTarget {
    fn default() -> Self {
        OutputTarget::NextStep
    }
}

/// The declared shape of an action's raw output.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputShape {
    /// Free text, kept as-is.
    #[default]
    Text,
    /// A JSON object or value; code fences are stripped before parsing.
    Json,
    /// A list: a JSON array, or one item per non-empty line.
    List,
}

/// How multiple participants within one action are orchestrated.
///
/// This is the only source of true parallelism in the engine; phases and
/// actions are otherwise strictly sequential.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationMode {
    /// One after another; each participant sees the prior response.
    #[default]
    Sequential,
    /// All participants invoked concurrently; results merged after all settle.
    Parallel,
    /// Sequential, but the transcript grows across turns.
    RoundRobin,
    /// Parallel drafts, then the first participant synthesizes.
    Consensus,
}

/// Retry policy for a single action.
///
/// Only errors classified retryable are ever retried; backoff is exponential
/// starting at `base_delay_ms` and doubling each attempt.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Hard ceiling of 3.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

/// How a phase's action outputs are consolidated into one phase output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ConsolidationPolicy {
    /// The output of the final action.
    #[default]
    LastAction,
    /// Shallow-merge the outputs of all actions that declare an export.
    Merge,
    /// One action explicitly marked as the phase's output.
    Designated { action_id: String },
}

/// How a completed run's output is delivered.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DeliveryMode {
    /// The last phase's consolidated output is the final generated content.
    #[default]
    Synthesis,
    /// The last phase's output is an optimized prompt handed back to the
    /// caller; the engine performs no further inference.
    Compilation,
    /// No delivered content. Each mapped token is resolved by executing its
    /// retrieval pipeline once; results are cached for template injection.
    Injection { mappings: HashMap<String, String> },
}

/// The smallest executable unit: resolves input, resolves a prompt,
/// optionally calls an inference model, routes output.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ActionDefinition {
    /// Unique identifier within the pipeline.
    pub id: String,

    /// Human-readable name, used in progress events.
    pub name: String,

    pub kind: ActionKind,

    #[serde(default)]
    pub input: InputSource,

    /// Prompt authoring config; `template` is the legacy inline fallback.
    #[serde(default)]
    pub prompt: Option<PromptConfig>,

    #[serde(default)]
    pub template: Option<String>,

    #[serde(default)]
    pub output: OutputTarget,

    #[serde(default)]
    pub shape: OutputShape,

    #[serde(default)]
    pub execution: OrchestrationMode,

    /// Agent names invoked by this action. More than one participant is
    /// only meaningful for orchestrating kinds.
    #[serde(default)]
    pub participants: Vec<String>,

    /// The single agent for non-orchestrated invocation.
    #[serde(default)]
    pub agent: Option<String>,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Per-step timeout for the invocation stage, in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// When true, the action's output is exported into the run's globals.
    #[serde(default)]
    pub export: bool,

    /// Checkpoint configuration; required for `user_gavel` actions.
    #[serde(default)]
    pub gavel: Option<GavelConfig>,
}

/// An ordered group of actions. Phases run strictly sequentially.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PhaseDefinition {
    pub id: String,

    pub name: String,

    /// The authoritative action list. The `steps` alias is accepted on
    /// input so legacy definitions cannot silently execute zero actions.
    #[serde(alias = "steps")]
    pub actions: Vec<ActionDefinition>,

    /// When true, recoverable failures are recorded and execution proceeds
    /// to the next action instead of halting the phase.
    #[serde(default)]
    pub continue_on_error: bool,

    #[serde(default)]
    pub consolidation: ConsolidationPolicy,
}

/// A full pipeline definition: an ordered list of phases plus the delivery
/// mode for the finished run.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PipelineDefinition {
    /// Unique identifier; at most one run per pipeline id may be active.
    pub id: String,

    pub name: String,

    pub phases: Vec<PhaseDefinition>,

    #[serde(default)]
    pub delivery: DeliveryMode,
}

impl PipelineDefinition {
    /// Structural validation, run before any execution.
    ///
    /// Rejects empty phases, empty action lists, duplicate action ids,
    /// `designated` consolidation that names a missing action, gavel actions
    /// without a gavel config, and participants on kinds that cannot
    /// orchestrate them.
    pub fn validate(&self) -> Result<(), String> {
        if self.phases.is_empty() {
            return Err(format!("pipeline '{}' has no phases", self.id));
        }

        let mut seen_ids = std::collections::HashSet::new();
        for phase in &self.phases {
            if phase.actions.is_empty() {
                return Err(format!(
                    "phase '{}' in pipeline '{}' has no actions",
                    phase.id, self.id
                ));
            }

            if let ConsolidationPolicy::Designated { action_id } = &phase.consolidation {
                if !phase.actions.iter().any(|a| &a.id == action_id) {
                    return Err(format!(
                        "phase '{}' designates unknown action '{}'",
                        phase.id, action_id
                    ));
                }
            }

            for action in &phase.actions {
                if !seen_ids.insert(action.id.clone()) {
                    return Err(format!("duplicate action id '{}'", action.id));
                }

                if action.kind == ActionKind::UserGavel && action.gavel.is_none() {
                    return Err(format!(
                        "gavel action '{}' is missing its gavel config",
                        action.id
                    ));
                }

                if action.participants.len() > 1
                    && !matches!(
                        action.kind,
                        ActionKind::Standard | ActionKind::CharacterWorkshop
                    )
                {
                    return Err(format!(
                        "action '{}' declares participants but kind {:?} cannot orchestrate them",
                        action.id, action.kind
                    ));
                }
            }
        }

        Ok(())
    }

    /// Total number of actions across all phases.
    pub fn total_actions(&self) -> usize {
        self.phases.iter().map(|p| p.actions.len()).sum()
    }
}
