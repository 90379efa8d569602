//! Inference error types for the engine boundary.
//!
//! Errors are `Clone` so a single failed stage can be reported to every
//! caller that was waiting on it.

use thiserror::Error;

/// Errors raised by an inference backend or by the resource chain built on it.
#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    #[error("Model not loaded: {0}")]
    ModelNotLoaded(String),

    #[error("Metadata load failed: {0}")]
    MetadataLoad(String),

    #[error("Weight load failed: {0}")]
    WeightLoad(String),

    #[error("Context creation failed: {0}")]
    ContextCreation(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("Invalid generation options: {0}")]
    InvalidOptions(String),

    #[error("Capability not supported: {0}")]
    CapabilityNotSupported(String),

    #[error("Resource released while loading: {0}")]
    Released(String),

    #[error("Disposal failed: {0}")]
    Disposal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl InferenceError {
    /// Returns true if this error should be logged as a warning.
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Released(_))
    }

    /// Returns true if the failure happened while materializing resources
    /// rather than while running them.
    pub fn is_load_failure(&self) -> bool {
        matches!(
            self,
            Self::MetadataLoad(_) | Self::WeightLoad(_) | Self::ContextCreation(_) | Self::Released(_)
        )
    }
}
