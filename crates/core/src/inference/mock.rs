//! Mock inference client for testing.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use rk_protocol::agent_models::GenerationConfig;

use super::{Completion, InferenceClient, InferenceError, TokenUsage};

/// A scripted [`InferenceClient`] that replays queued outcomes and counts
/// invocations. Once the script is exhausted it keeps returning the last
/// configured fallback response.
pub struct MockInferenceClient {
    script: Mutex<VecDeque<Result<String, InferenceError>>>,
    fallback: String,
    /// When set, an exhausted script errors instead of falling back.
    fail_when_exhausted: bool,
    calls: AtomicUsize,
}

impl MockInferenceClient {
    pub fn new(script: Vec<Result<String, InferenceError>>, fallback: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback: fallback.into(),
            fail_when_exhausted: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Always respond with the same text.
    pub fn always(text: impl Into<String>) -> Self {
        Self::new(vec![], text)
    }

    /// Fail `failures` times with a transient API error, then succeed.
    pub fn flaky(failures: usize, text: impl Into<String>) -> Self {
        let script = (0..failures)
            .map(|i| Err(InferenceError::Api(format!("transient failure {}", i + 1))))
            .collect();
        Self::new(script, text)
    }

    /// Fail every call with a transient API error.
    pub fn always_failing() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: String::new(),
            fail_when_exhausted: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceClient for MockInferenceClient {
    async fn generate(
        &self,
        prompt: &str,
        _config: &GenerationConfig,
    ) -> Result<Completion, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let next = {
            let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
            script.pop_front()
        };

        let text = match next {
            Some(Ok(text)) => text,
            Some(Err(error)) => return Err(error),
            None if self.fail_when_exhausted => {
                return Err(InferenceError::Api("scripted failure".to_string()))
            }
            None => self.fallback.clone(),
        };

        Ok(Completion {
            usage: TokenUsage {
                prompt_tokens: (prompt.len() / 4) as u32,
                completion_tokens: (text.len() / 4) as u32,
            },
            text,
        })
    }
}
