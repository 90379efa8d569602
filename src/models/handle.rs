//! Per-file model handle and its lazily built resource chain.
//!
//! Metadata is read when the handle is opened. Everything else is created on
//! first use, in dependency order: weights, context, sequence, then either a
//! chat session or a completion engine. Each stage is memoized in a
//! [`Stage`] slot. `unload` resets every slot at once and bumps an epoch, so
//! a creation that was in flight across an unload can never be stored.

use std::fmt;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::consumers::{ChatSession, CompletionEngine};
use super::stage::{Stage, StageStatus};
use crate::engine::{
    ChatHistoryItem, ChatTemplate, ContextSequence, ExecutionContext, InferenceBackend,
    InferenceError, ModelMetadata, ModelWeights, Token, WeightsOptions,
};
use crate::error::GatewayError;
use crate::sync;

/// Metadata plus the chat template resolved from it.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub metadata: ModelMetadata,
    pub chat_template: ChatTemplate,
}

/// Snapshot of every stage slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HandleStatus {
    pub metadata: bool,
    pub weights: StageStatus,
    pub context: StageStatus,
    pub sequence: StageStatus,
    pub chat_session: StageStatus,
    pub completion: StageStatus,
}

#[derive(Default)]
struct Stages {
    /// Bumped on every unload.
    epoch: u64,
    weights: Stage<Arc<dyn ModelWeights>>,
    context: Stage<Arc<dyn ExecutionContext>>,
    sequence: Stage<Arc<dyn ContextSequence>>,
    chat_session: Stage<Arc<ChatSession>>,
    completion: Stage<Arc<CompletionEngine>>,
}

impl Stages {
    fn weights(&mut self) -> &mut Stage<Arc<dyn ModelWeights>> {
        &mut self.weights
    }

    fn context(&mut self) -> &mut Stage<Arc<dyn ExecutionContext>> {
        &mut self.context
    }

    fn sequence(&mut self) -> &mut Stage<Arc<dyn ContextSequence>> {
        &mut self.sequence
    }

    fn chat_session(&mut self) -> &mut Stage<Arc<ChatSession>> {
        &mut self.chat_session
    }

    fn completion(&mut self) -> &mut Stage<Arc<CompletionEngine>> {
        &mut self.completion
    }
}

struct HandleInner {
    id: String,
    path: PathBuf,
    root: PathBuf,
    size_bytes: u64,
    modified: Option<SystemTime>,
    backend: Arc<dyn InferenceBackend>,
    info: RwLock<Option<Arc<ModelInfo>>>,
    stages: Mutex<Stages>,
    sequence_lock: sync::Mutex,
}

/// Shared handle to one model file. Clones refer to the same resources.
#[derive(Clone)]
pub struct ModelHandle {
    inner: Arc<HandleInner>,
}

/// Registry id for `path` under `root`: the relative path with `/` separators.
pub fn model_id(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Metadata and resolved chat template, or `None` after logging the failure.
async fn read_info(backend: &dyn InferenceBackend, id: &str, path: &Path) -> Option<Arc<ModelInfo>> {
    match backend.load_metadata(path).await {
        Ok(metadata) => {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let chat_template = ChatTemplate::resolve(
                metadata.embedded_chat_template.as_deref(),
                metadata.architecture.as_deref(),
                &file_name,
            );
            Some(Arc::new(ModelInfo {
                metadata,
                chat_template,
            }))
        }
        Err(error) => {
            warn!(model_id = %id, path = %path.display(), %error, "metadata unavailable");
            None
        }
    }
}

impl ModelHandle {
    /// Stat the file and read its metadata.
    ///
    /// A metadata failure is logged and leaves the handle without metadata.
    /// Only a failed stat is an error.
    pub async fn open(
        root: &Path,
        path: &Path,
        backend: Arc<dyn InferenceBackend>,
    ) -> Result<Self, GatewayError> {
        let id = model_id(root, path);
        let stat = tokio::fs::metadata(path)
            .await
            .map_err(|e| GatewayError::load_failure(&id, e))?;

        let info = read_info(backend.as_ref(), &id, path).await;

        Ok(Self {
            inner: Arc::new(HandleInner {
                id,
                path: path.to_path_buf(),
                root: root.to_path_buf(),
                size_bytes: stat.len(),
                modified: stat.modified().ok(),
                backend,
                info: RwLock::new(info),
                stages: Mutex::new(Stages::default()),
                sequence_lock: sync::Mutex::new(),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// On-disk size captured at discovery.
    pub fn size_bytes(&self) -> u64 {
        self.inner.size_bytes
    }

    /// Modification time captured at discovery, in unix seconds.
    pub fn modified_unix(&self) -> i64 {
        self.inner
            .modified
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    /// Lock serializing all use of this model's sequence.
    pub fn sequence_lock(&self) -> &sync::Mutex {
        &self.inner.sequence_lock
    }

    pub fn info(&self) -> Result<Arc<ModelInfo>, InferenceError> {
        self.inner
            .info
            .read()
            .clone()
            .ok_or_else(|| InferenceError::ModelNotLoaded(self.inner.id.clone()))
    }

    pub fn has_metadata(&self) -> bool {
        self.inner.info.read().is_some()
    }

    /// Read metadata again if the last attempt failed. Returns whether the
    /// handle has metadata afterwards.
    pub async fn retry_metadata(&self) -> bool {
        if self.has_metadata() {
            return true;
        }
        let Some(info) = read_info(self.inner.backend.as_ref(), &self.inner.id, &self.inner.path).await
        else {
            return false;
        };
        self.inner.info.write().get_or_insert(info);
        info!(model_id = %self.inner.id, "metadata loaded on retry");
        true
    }

    pub fn encode(&self, text: &str) -> Result<Vec<Token>, InferenceError> {
        self.info()?.metadata.tokenizer.encode(text, false)
    }

    pub fn decode(&self, tokens: &[Token]) -> Result<String, InferenceError> {
        self.info()?.metadata.tokenizer.decode(tokens, false)
    }

    /// Render `history` with the model's chat template. Used for counting
    /// prompt tokens, not for generation.
    pub fn render_chat_template(&self, history: &[ChatHistoryItem]) -> Result<String, InferenceError> {
        Ok(self.info()?.chat_template.render(history))
    }

    /// True once weights are resident.
    pub fn is_loaded(&self) -> bool {
        self.inner.stages.lock().weights.ready().is_some()
    }

    /// Weights that are already resident, without starting a load.
    pub fn resident_weights(&self) -> Option<Arc<dyn ModelWeights>> {
        self.inner.stages.lock().weights.ready().cloned()
    }

    /// Size of resident weights, zero when unloaded.
    pub fn resident_bytes(&self) -> u64 {
        self.inner
            .stages
            .lock()
            .weights
            .ready()
            .map(|w| w.size_bytes())
            .unwrap_or(0)
    }

    pub fn status(&self) -> HandleStatus {
        let stages = self.inner.stages.lock();
        HandleStatus {
            metadata: self.has_metadata(),
            weights: stages.weights.status(),
            context: stages.context.status(),
            sequence: stages.sequence.status(),
            chat_session: stages.chat_session.status(),
            completion: stages.completion.status(),
        }
    }

    /// Run `init` at most once per epoch for the slot `slot` selects.
    async fn memoize<T, F, Fut>(
        &self,
        slot: fn(&mut Stages) -> &mut Stage<T>,
        init: F,
    ) -> Result<T, InferenceError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, InferenceError>> + Send + 'static,
    {
        let (epoch, pending) = {
            let mut stages = self.inner.stages.lock();
            let epoch = stages.epoch;
            match slot(&mut stages) {
                Stage::Ready(value) => return Ok(value.clone()),
                Stage::InProgress(pending) => (epoch, pending.clone()),
                stage => {
                    let pending = init().boxed().shared();
                    *stage = Stage::InProgress(pending.clone());
                    (epoch, pending)
                }
            }
        };

        let result = pending.await;

        let mut stages = self.inner.stages.lock();
        if stages.epoch != epoch {
            return Err(InferenceError::Released(format!(
                "{} was unloaded while loading",
                self.inner.id
            )));
        }
        slot(&mut stages).settle(&result);
        result
    }

    /// Materialize weights, or return the resident ones.
    pub async fn load_weights(&self) -> Result<Arc<dyn ModelWeights>, InferenceError> {
        let backend = self.inner.backend.clone();
        let path = self.inner.path.clone();
        let id = self.inner.id.clone();
        let options = WeightsOptions {
            gpu_layers: None,
            flash_attention: self
                .inner
                .info
                .read()
                .as_ref()
                .map(|info| info.metadata.flash_attention_supported)
                .unwrap_or(false),
        };
        self.memoize(Stages::weights, move || async move {
            info!(model_id = %id, "loading weights");
            let started = Instant::now();
            let result = backend.load_weights(&path, options).await;
            match &result {
                Ok(weights) => info!(
                    model_id = %id,
                    bytes = weights.size_bytes(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "weights loaded"
                ),
                Err(error) => error!(model_id = %id, %error, "weight load failed"),
            }
            result
        })
        .await
    }

    pub async fn context(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn ExecutionContext>, InferenceError> {
        let handle = self.clone();
        let cancel = cancel.clone();
        self.memoize(Stages::context, move || async move {
            let weights = handle.load_weights().await?;
            weights.create_context(&cancel).await
        })
        .await
    }

    pub async fn sequence(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn ContextSequence>, InferenceError> {
        let handle = self.clone();
        let cancel = cancel.clone();
        self.memoize(Stages::sequence, move || async move {
            handle.context(&cancel).await?.sequence().await
        })
        .await
    }

    pub async fn chat_session(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<ChatSession>, InferenceError> {
        let handle = self.clone();
        let cancel = cancel.clone();
        self.memoize(Stages::chat_session, move || async move {
            let sequence = handle.sequence(&cancel).await?;
            Ok(Arc::new(ChatSession::new(sequence)))
        })
        .await
    }

    pub async fn completion_engine(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<CompletionEngine>, InferenceError> {
        let handle = self.clone();
        let cancel = cancel.clone();
        self.memoize(Stages::completion, move || async move {
            let sequence = handle.sequence(&cancel).await?;
            Ok(Arc::new(CompletionEngine::new(sequence)))
        })
        .await
    }

    /// Tear down every stage together. Metadata stays.
    ///
    /// All disposals are attempted; the first failure is returned.
    pub async fn unload(&self) -> Result<(), InferenceError> {
        let (chat_session, completion, sequence, context, weights) = {
            let mut stages = self.inner.stages.lock();
            stages.epoch += 1;
            (
                stages.chat_session.take(),
                stages.completion.take(),
                stages.sequence.take(),
                stages.context.take(),
                stages.weights.take(),
            )
        };
        let had_weights = weights.is_some();

        if let Some(session) = chat_session {
            session.dispose();
        }
        if let Some(engine) = completion {
            engine.dispose();
        }
        drop(sequence);

        let mut first_error = None;
        if let Some(context) = context {
            if let Err(error) = context.dispose().await {
                warn!(model_id = %self.inner.id, %error, "context disposal failed");
                first_error.get_or_insert(error);
            }
        }
        if let Some(weights) = weights {
            if let Err(error) = weights.dispose().await {
                warn!(model_id = %self.inner.id, %error, "weight disposal failed");
                first_error.get_or_insert(error);
            }
        }
        if had_weights {
            info!(model_id = %self.inner.id, "model unloaded");
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Unload and release metadata. The handle is unusable afterwards.
    pub async fn dispose(&self) -> Result<(), InferenceError> {
        let result = self.unload().await;
        self.inner.info.write().take();
        result
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("id", &self.inner.id)
            .field("path", &self.inner.path)
            .field("size_bytes", &self.inner.size_bytes)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

#[cfg(test)]
#[path = "handle_tests.rs"]
mod tests;
