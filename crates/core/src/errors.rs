//! Error normalization.
//!
//! Collaborator error types carry their origin; the `From` impls here
//! convert them into the canonical [`PipelineError`] before anything leaves
//! the step executor, so every layer above reasons about one vocabulary.

use rk_protocol::error_models::{ErrorKind, PipelineError};

use crate::inference::InferenceError;
use crate::resolver::ResolveError;
use crate::store::StoreError;

impl From<ResolveError> for PipelineError {
    fn from(error: ResolveError) -> Self {
        PipelineError::new(ErrorKind::Prompt, error.to_string())
    }
}

impl From<InferenceError> for PipelineError {
    fn from(error: InferenceError) -> Self {
        let kind = match &error {
            InferenceError::Timeout(_) => ErrorKind::Timeout,
            InferenceError::NotAvailable(_) => ErrorKind::Agent,
            InferenceError::Api(_) => ErrorKind::Llm,
        };
        PipelineError::new(kind, error.to_string())
    }
}

impl From<StoreError> for PipelineError {
    fn from(error: StoreError) -> Self {
        PipelineError::new(ErrorKind::Store, error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_error_classifies_as_prompt() {
        let err: PipelineError = ResolveError::DepthExceeded(5).into();
        assert_eq!(err.kind, ErrorKind::Prompt);
        assert!(err.recoverable);
        assert!(!err.retryable);
    }

    #[test]
    fn test_inference_errors_classify_by_origin() {
        let api: PipelineError = InferenceError::Api("503".to_string()).into();
        assert_eq!(api.kind, ErrorKind::Llm);
        assert!(api.retryable);

        let timeout: PipelineError = InferenceError::Timeout("30s".to_string()).into();
        assert_eq!(timeout.kind, ErrorKind::Timeout);
        assert!(timeout.retryable);

        let missing: PipelineError = InferenceError::NotAvailable("gone".to_string()).into();
        assert_eq!(missing.kind, ErrorKind::Agent);
        assert!(!missing.retryable);
    }

    #[test]
    fn test_store_error_classifies_as_store() {
        let err: PipelineError = StoreError::Io("disk".to_string()).into();
        assert_eq!(err.kind, ErrorKind::Store);
        assert!(!err.recoverable);
    }
}
