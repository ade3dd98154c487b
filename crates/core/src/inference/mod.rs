//! Inference client seam.
//!
//! The engine obtains text completions through the [`InferenceClient`]
//! trait. Network-layer retry and timeout belong to the implementation; the
//! engine drives its own retry policy and per-step timeout on top.

mod mock;

pub use mock::MockInferenceClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use rk_protocol::agent_models::GenerationConfig;

/// Token accounting for one completion.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total(self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// One generated completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

/// Errors surfaced by the inference client. Normalized to `Llm`- or
/// `Timeout`-kind pipeline errors at the executor boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InferenceError {
    #[error("Model not available: {0}")]
    NotAvailable(String),
    #[error("API call failed: {0}")]
    Api(String),
    #[error("Generation timed out: {0}")]
    Timeout(String),
}

/// Obtains a text completion for a resolved prompt.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<Completion, InferenceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_accumulates() {
        let mut usage = TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
        };
        usage.add(TokenUsage {
            prompt_tokens: 3,
            completion_tokens: 7,
        });
        assert_eq!(usage.prompt_tokens, 13);
        assert_eq!(usage.completion_tokens, 12);
        assert_eq!(usage.total(), 25);
    }
}
