use thiserror::Error;

pub type GenerationResult<T> = Result<T, GenerationError>;

/// Failure of a generation call.
///
/// Every variant is fatal to the current build attempt; an explicit retry
/// starts the failed unit again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("invalid generator input: {0}")]
    InvalidInput(String),

    #[error("generation failed: {0}")]
    Failed(String),

    #[error("generator unavailable: {0}")]
    Unavailable(String),
}

impl GenerationError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}
