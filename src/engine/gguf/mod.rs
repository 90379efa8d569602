//! GGUF backend via llama-cpp-2.
//!
//! Compiled with the `gguf` feature. Metadata comes from a vocab-only load.
//! Structured output is sampled through a GBNF grammar built from the
//! request's JSON schema.

mod backend;
mod worker;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use self::backend::{LlamaRuntime, LoadedModel};
use self::worker::ContextWorker;
use crate::engine::{
    BackendCapabilities, ChatHistoryItem, ChatTemplate, ContextSequence, EmbeddingContext,
    ExecutionContext, Generation, GenerationOptions, InferenceBackend, InferenceError,
    ModelMetadata, ModelWeights, SpecialTokens, TextStreamSender, Token, Tokenizer,
    WeightsOptions,
};

/// Offload every layer the build can place on an accelerator.
const AUTO_GPU_LAYERS: u32 = 999;

/// Runtime parameters for llama.cpp contexts.
#[derive(Debug, Clone)]
pub struct GgufConfig {
    pub n_ctx: u32,
    /// Zero picks a count from the machine.
    pub n_threads: u32,
    pub seed: u32,
    /// Token limit when a request sets none.
    pub default_max_tokens: u32,
}

impl Default for GgufConfig {
    fn default() -> Self {
        Self {
            n_ctx: 4096,
            n_threads: 0,
            seed: 42,
            default_max_tokens: 2048,
        }
    }
}

/// llama.cpp-backed [`InferenceBackend`].
pub struct GgufBackend {
    runtime: Arc<LlamaRuntime>,
    config: GgufConfig,
}

impl GgufBackend {
    /// Initialize llama.cpp. Only one backend may exist per process.
    pub fn new(config: GgufConfig) -> Result<Self, InferenceError> {
        Ok(Self {
            runtime: Arc::new(LlamaRuntime::init()?),
            config,
        })
    }

    async fn spawn_load<F>(&self, path: &Path, load: F) -> Result<Arc<LoadedModel>, String>
    where
        F: FnOnce(Arc<LlamaRuntime>, &Path) -> Result<LoadedModel, String> + Send + 'static,
    {
        let runtime = self.runtime.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || load(runtime, &path))
            .await
            .map_err(|e| format!("loader task: {e}"))?
            .map(Arc::new)
    }
}

fn resolve_template(model: &LoadedModel, path: &Path) -> ChatTemplate {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    ChatTemplate::resolve(
        model.meta("tokenizer.chat_template").as_deref(),
        model.meta("general.architecture").as_deref(),
        &file_name,
    )
}

#[async_trait]
impl InferenceBackend for GgufBackend {
    fn name(&self) -> &str {
        "llama.cpp"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            gpu_offloading: self.runtime.supports_gpu_offload(),
            mmap: self.runtime.supports_mmap(),
            mlock: self.runtime.supports_mlock(),
        }
    }

    async fn load_metadata(&self, path: &Path) -> Result<ModelMetadata, InferenceError> {
        let model = self
            .spawn_load(path, LoadedModel::load_vocab)
            .await
            .map_err(InferenceError::MetadataLoad)?;
        let architecture = model.meta("general.architecture");
        Ok(ModelMetadata {
            name: model.meta("general.name"),
            embedded_chat_template: model.meta("tokenizer.chat_template"),
            vocabulary_type: model
                .meta("tokenizer.ggml.model")
                .unwrap_or_else(|| "unknown".into()),
            special_tokens: SpecialTokens {
                bos: Some(model.bos()),
                eos: Some(model.eos()),
            },
            embedding_vector_size: model.embedding_size(),
            train_context_size: model.train_context_size(),
            // llama.cpp decides per context; the file does not say.
            flash_attention_supported: false,
            architecture,
            tokenizer: Arc::new(GgufTokenizer { model }),
        })
    }

    async fn load_weights(
        &self,
        path: &Path,
        options: WeightsOptions,
    ) -> Result<Arc<dyn ModelWeights>, InferenceError> {
        let layers = options.gpu_layers.unwrap_or(AUTO_GPU_LAYERS);
        let model = self
            .spawn_load(path, move |runtime, path| LoadedModel::load(runtime, path, layers))
            .await
            .map_err(InferenceError::WeightLoad)?;
        let template = resolve_template(&model, path);
        tracing::debug!(path = %path.display(), template = template.name(), "gguf weights loaded");
        Ok(Arc::new(GgufWeights {
            shared: Arc::new(Shared {
                model,
                config: self.config.clone(),
                template,
            }),
            disposed: AtomicBool::new(false),
        }))
    }
}

struct GgufTokenizer {
    model: Arc<LoadedModel>,
}

impl Tokenizer for GgufTokenizer {
    fn encode(&self, text: &str, special_tokens: bool) -> Result<Vec<Token>, InferenceError> {
        Ok(self
            .model
            .tokenize(text, special_tokens)?
            .into_iter()
            .map(|t| t.0 as Token)
            .collect())
    }

    fn decode(&self, tokens: &[Token], special_tokens: bool) -> Result<String, InferenceError> {
        let tokens: Vec<_> = tokens
            .iter()
            .map(|&t| llama_cpp_2::token::LlamaToken(t as i32))
            .collect();
        self.model.detokenize(&tokens, special_tokens)
    }
}

struct Shared {
    model: Arc<LoadedModel>,
    config: GgufConfig,
    template: ChatTemplate,
}

struct GgufWeights {
    shared: Arc<Shared>,
    disposed: AtomicBool,
}

impl GgufWeights {
    fn live(&self) -> Result<Arc<Shared>, InferenceError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(InferenceError::ModelNotLoaded("weights were disposed".into()));
        }
        Ok(self.shared.clone())
    }
}

#[async_trait]
impl ModelWeights for GgufWeights {
    fn size_bytes(&self) -> u64 {
        self.shared.model.size_bytes()
    }

    async fn create_context(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn ExecutionContext>, InferenceError> {
        let shared = self.live()?;
        if cancel.is_cancelled() {
            return Err(InferenceError::Cancelled);
        }
        let worker = ContextWorker::spawn(shared.clone()).await?;
        Ok(Arc::new(GgufContext {
            shared,
            worker: Arc::new(worker),
        }))
    }

    async fn create_embedding_context(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn EmbeddingContext>, InferenceError> {
        let shared = self.live()?;
        if cancel.is_cancelled() {
            return Err(InferenceError::Cancelled);
        }
        Ok(Arc::new(GgufEmbeddings { shared }))
    }

    async fn dispose(&self) -> Result<(), InferenceError> {
        // Memory is returned once the last context referencing the model drops.
        self.disposed.store(true, Ordering::Release);
        Ok(())
    }
}

/// One llama.cpp context, kept on its worker thread until disposed.
struct GgufContext {
    shared: Arc<Shared>,
    worker: Arc<ContextWorker>,
}

#[async_trait]
impl ExecutionContext for GgufContext {
    async fn sequence(&self) -> Result<Arc<dyn ContextSequence>, InferenceError> {
        Ok(Arc::new(GgufSequence {
            shared: self.shared.clone(),
            worker: self.worker.clone(),
        }))
    }

    async fn dispose(&self) -> Result<(), InferenceError> {
        self.worker.close();
        Ok(())
    }
}

/// The single sequence of a [`GgufContext`]. Each prompt is evaluated from
/// an empty KV cache.
struct GgufSequence {
    shared: Arc<Shared>,
    worker: Arc<ContextWorker>,
}

impl GgufSequence {
    async fn run(
        &self,
        prompt: String,
        options: &GenerationOptions,
        cancel: &CancellationToken,
        sink: TextStreamSender,
    ) -> Result<Generation, InferenceError> {
        if let Some(grammar) = &options.grammar {
            grammar.to_gbnf()?;
        }
        self.worker.generate(prompt, options, cancel, sink).await
    }
}

#[async_trait]
impl ContextSequence for GgufSequence {
    async fn prompt_chat(
        &self,
        history: &[ChatHistoryItem],
        prompt: &str,
        options: &GenerationOptions,
        cancel: &CancellationToken,
        sink: TextStreamSender,
    ) -> Result<Generation, InferenceError> {
        let mut turns = history.to_vec();
        turns.push(ChatHistoryItem::User(prompt.to_string()));
        let rendered = self.shared.template.render(&turns);
        self.run(rendered, options, cancel, sink).await
    }

    async fn complete(
        &self,
        prompt: &str,
        options: &GenerationOptions,
        cancel: &CancellationToken,
        sink: TextStreamSender,
    ) -> Result<Generation, InferenceError> {
        self.run(prompt.to_string(), options, cancel, sink).await
    }
}

/// Embeddings run on a llama.cpp context created for each input.
struct GgufEmbeddings {
    shared: Arc<Shared>,
}

#[async_trait]
impl EmbeddingContext for GgufEmbeddings {
    async fn embed(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<f32>, InferenceError> {
        if cancel.is_cancelled() {
            return Err(InferenceError::Cancelled);
        }
        let shared = self.shared.clone();
        let text = text.to_string();
        tokio::task::spawn_blocking(move || shared.model.embed(&text, &shared.config))
            .await
            .map_err(|e| InferenceError::Embedding(format!("worker: {e}")))?
    }

    async fn dispose(&self) -> Result<(), InferenceError> {
        Ok(())
    }
}
