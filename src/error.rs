//! Error kinds shared across the pipeline
//!
//! Every stage returns a success/failure record rather than letting errors
//! climb the stack; these kinds classify the failures that do get recorded.

/// Error kinds for pipeline operations
#[derive(Debug, thiserror::Error)]
pub enum SpiderError {
    /// Bad input: malformed URL, empty task, inconsistent field definitions
    #[error("validation error: {0}")]
    Validation(String),

    /// Browser-side failure: timeout, element not found, element not clickable
    #[error("browser error: {0}")]
    Browser(String),

    /// LLM failure: non-JSON response, schema mismatch, request failure
    #[error("llm error: {0}")]
    Llm(String),

    /// Work queue backing store unreachable or rejected the operation
    #[error("queue error: {0}")]
    Queue(String),

    /// Checkpoint file IO failure
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

impl SpiderError {
    /// Shorthand for a browser timeout, the most common recorded failure
    #[must_use]
    pub fn timeout(operation: &str, secs: u64) -> Self {
        Self::Browser(format!("{operation} timeout after {secs} seconds"))
    }
}

pub type SpiderResult<T> = Result<T, SpiderError>;
