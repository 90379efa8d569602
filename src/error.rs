//! Request-level error taxonomy.
//!
//! Every failure a caller can observe is a [`GatewayError`]. Disposal
//! failures never show up here; they are logged where they happen.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::InferenceError;
use crate::models::WatchError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Model {0} not found")]
    ModelNotFound(String),

    #[error("Model {model_id} failed to load: {reason}")]
    LoadFailure { model_id: String, reason: String },

    #[error(
        "Model {model_id} needs {required} bytes but the accelerator only has {total} bytes in total"
    )]
    InsufficientMemory {
        model_id: String,
        required: u64,
        total: u64,
    },

    #[error("{0}")]
    UnsupportedInput(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Model not loaded: {0}")]
    ModelNotLoaded(String),

    #[error("Stream already terminated")]
    AlreadyTerminal,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Gateway is shutting down")]
    ShuttingDown,

    #[error("Inference failed: {0}")]
    Inference(InferenceError),

    #[error("Stream transport failed: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Model discovery failed: {0}")]
    Discovery(#[from] WatchError),
}

impl From<InferenceError> for GatewayError {
    fn from(error: InferenceError) -> Self {
        match error {
            InferenceError::Cancelled => Self::Cancelled,
            InferenceError::ModelNotLoaded(reason) => Self::ModelNotLoaded(reason),
            InferenceError::InvalidOptions(reason) => Self::InvalidRequest(reason),
            other => Self::Inference(other),
        }
    }
}

impl GatewayError {
    pub fn load_failure(model_id: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::LoadFailure {
            model_id: model_id.into(),
            reason: error.to_string(),
        }
    }

    /// HTTP status an API layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::ModelNotFound(_) => 404,
            Self::InvalidRequest(_) | Self::UnsupportedInput(_) => 400,
            Self::InsufficientMemory { .. } => 507,
            Self::Cancelled => 499,
            Self::ShuttingDown => 503,
            Self::Inference(InferenceError::CapabilityNotSupported(_)) => 501,
            _ => 500,
        }
    }

    /// Machine-readable error type for the wire body.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::ModelNotFound(_) => "model_not_found",
            Self::LoadFailure { .. } => "load_failure",
            Self::InsufficientMemory { .. } => "insufficient_memory",
            Self::UnsupportedInput(_) => "unsupported_input",
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::ModelNotLoaded(_) => "model_not_loaded",
            Self::AlreadyTerminal => "already_terminal",
            Self::Cancelled => "cancelled",
            Self::ShuttingDown => "shutting_down",
            Self::Inference(_) => "inference_error",
            Self::Transport(_) => "transport_error",
            Self::Serialization(_) => "serialization_error",
            Self::Discovery(_) => "discovery_error",
        }
    }

    /// Client disconnects and explicit aborts. Not reported to the client.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Programming errors: the caller broke a usage contract.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AlreadyTerminal)
    }

    /// The caller sent something this gateway will never accept.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code()) && !self.is_cancelled()
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: "error".to_string(),
            error: ErrorDetail {
                kind: self.error_type().to_string(),
                code: self.status_code(),
                message: self.to_string(),
            },
        }
    }
}

/// Wire body for a failed call: `{"type":"error","error":{...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub kind: String,
    pub code: u16,
    pub message: String,
}
