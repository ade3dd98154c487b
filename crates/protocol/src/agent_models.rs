//! Agent configuration models.
//!
//! Agents are the named model configurations an action invokes. Definition
//! storage and editing live outside the engine; these are the read-only
//! records it consumes.

use serde::{Deserialize, Serialize};

/// Generation parameters handed to the inference client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Client-level timeout for one generation call, in milliseconds.
    /// The engine's per-step timeout races on top of this.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1024
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_ms: None,
        }
    }
}

/// A named agent: a model plus its system prompt and generation parameters.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AgentConfig {
    /// Unique identifier, referenced by actions and participant lists.
    pub name: String,

    /// Human-readable description of the agent's purpose.
    #[serde(default)]
    pub description: String,

    /// Model identifier (e.g. "claude-sonnet-4").
    pub model: String,

    /// System prompt defining the agent's behavior. May be empty when the
    /// action supplies its own prompt.
    #[serde(default)]
    pub system_prompt: String,

    #[serde(default)]
    pub generation: GenerationConfig,
}

impl AgentConfig {
    /// Whether this agent can be invoked at all.
    ///
    /// An agent is usable when it names a model, allows at least one output
    /// token, and a prompt source exists — either its own system prompt or a
    /// step-supplied prompt.
    pub fn is_usable(&self, has_step_prompt: bool) -> bool {
        !self.model.is_empty()
            && self.generation.max_tokens > 0
            && (!self.system_prompt.is_empty() || has_step_prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> AgentConfig {
        AgentConfig {
            name: "writer".to_string(),
            description: "Drafts prose".to_string(),
            model: "claude-sonnet-4".to_string(),
            system_prompt: "You write fiction.".to_string(),
            generation: GenerationConfig::default(),
        }
    }

    #[test]
    fn test_usable_with_system_prompt() {
        assert!(agent().is_usable(false));
    }

    #[test]
    fn test_unusable_without_model() {
        let mut a = agent();
        a.model.clear();
        assert!(!a.is_usable(true));
    }

    #[test]
    fn test_unusable_without_any_prompt_source() {
        let mut a = agent();
        a.system_prompt.clear();
        assert!(!a.is_usable(false));
        assert!(a.is_usable(true));
    }

    #[test]
    fn test_unusable_with_zero_max_tokens() {
        let mut a = agent();
        a.generation.max_tokens = 0;
        assert!(!a.is_usable(true));
    }
}
