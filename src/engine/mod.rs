//! Inference engine boundary.
//!
//! Token sampling happens in a backend. The gateway sees a backend only
//! through the traits below, which mirror the resource chain a model goes
//! through: metadata, weights, execution context, sequence.

pub mod error;
#[cfg(feature = "gguf")]
pub mod gguf;
mod grammar;
mod options;
pub mod scripted;
mod streaming;
mod template;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

pub use error::InferenceError;
pub use options::{Generation, GenerationOptions, OutputGrammar, Penalties, StopReason};
pub use streaming::{StreamSendError, TextStream, TextStreamSender, FRAGMENT_BUFFER};
pub use template::{ChatHistoryItem, ChatTemplate};

/// Vocabulary index.
pub type Token = u32;

/// What a backend can do on this machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackendCapabilities {
    pub gpu_offloading: bool,
    pub mmap: bool,
    pub mlock: bool,
}

/// How weights should be materialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeightsOptions {
    /// Layers to offload; `None` lets the backend decide.
    pub gpu_layers: Option<u32>,
    pub flash_attention: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpecialTokens {
    pub bos: Option<Token>,
    pub eos: Option<Token>,
}

/// Everything known about a model without materializing its weights.
#[derive(Clone)]
pub struct ModelMetadata {
    /// `general.name`, when the file declares one.
    pub name: Option<String>,
    pub architecture: Option<String>,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub special_tokens: SpecialTokens,
    /// Raw chat template string embedded in the file.
    pub embedded_chat_template: Option<String>,
    pub embedding_vector_size: u32,
    pub train_context_size: u32,
    pub flash_attention_supported: bool,
    pub vocabulary_type: String,
}

impl fmt::Debug for ModelMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelMetadata")
            .field("name", &self.name)
            .field("architecture", &self.architecture)
            .field("special_tokens", &self.special_tokens)
            .field("embedding_vector_size", &self.embedding_vector_size)
            .field("train_context_size", &self.train_context_size)
            .field("flash_attention_supported", &self.flash_attention_supported)
            .field("vocabulary_type", &self.vocabulary_type)
            .finish_non_exhaustive()
    }
}

/// Text to token conversion backed by a model vocabulary.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str, special_tokens: bool) -> Result<Vec<Token>, InferenceError>;
    fn decode(&self, tokens: &[Token], special_tokens: bool) -> Result<String, InferenceError>;
}

/// Entry point of an inference implementation.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> BackendCapabilities;

    /// Read metadata only. No weight tensors are materialized.
    async fn load_metadata(&self, path: &Path) -> Result<ModelMetadata, InferenceError>;

    /// Materialize weights. On failure nothing stays allocated.
    async fn load_weights(
        &self,
        path: &Path,
        options: WeightsOptions,
    ) -> Result<Arc<dyn ModelWeights>, InferenceError>;
}

/// Resident model weights.
#[async_trait]
pub trait ModelWeights: Send + Sync {
    fn size_bytes(&self) -> u64;

    async fn create_context(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn ExecutionContext>, InferenceError>;

    async fn create_embedding_context(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn EmbeddingContext>, InferenceError>;

    async fn dispose(&self) -> Result<(), InferenceError>;
}

/// Execution state created from weights.
#[async_trait]
pub trait ExecutionContext: Send + Sync {
    /// Obtain a generation sequence. Only one is used per model.
    async fn sequence(&self) -> Result<Arc<dyn ContextSequence>, InferenceError>;

    async fn dispose(&self) -> Result<(), InferenceError>;
}

/// One generation lane. Not reentrant: callers serialize access.
#[async_trait]
pub trait ContextSequence: Send + Sync {
    /// Answer `prompt` after replaying `history`, pushing fragments to `sink`.
    async fn prompt_chat(
        &self,
        history: &[ChatHistoryItem],
        prompt: &str,
        options: &GenerationOptions,
        cancel: &CancellationToken,
        sink: TextStreamSender,
    ) -> Result<Generation, InferenceError>;

    /// Continue raw `prompt` text.
    async fn complete(
        &self,
        prompt: &str,
        options: &GenerationOptions,
        cancel: &CancellationToken,
        sink: TextStreamSender,
    ) -> Result<Generation, InferenceError>;
}

/// Context configured to produce embeddings.
#[async_trait]
pub trait EmbeddingContext: Send + Sync {
    async fn embed(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<f32>, InferenceError>;

    async fn dispose(&self) -> Result<(), InferenceError>;
}
