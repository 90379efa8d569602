//! Embedding sessions.

use std::sync::Arc;
use std::time::Instant;

use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{count_tokens, lock_sequence, request_id, settle_cancel};
use crate::api::protocol::{
    EmbeddingData, EmbeddingKind, EmbeddingUsage, EmbeddingsRequest, EmbeddingsResponse,
};
use crate::engine::EmbeddingContext;
use crate::error::GatewayError;
use crate::models::{ModelHandle, ModelRegistry};
use crate::sync::MutexGuard;

/// One `/v1/embeddings` request with its own embedding context.
pub struct Embeddings {
    id: String,
    model: String,
    cancel: CancellationToken,
    handle: ModelHandle,
    context: Option<Arc<dyn EmbeddingContext>>,
    documents: Vec<String>,
    usage: EmbeddingUsage,
    lock: Option<MutexGuard>,
    lock_acquired_at: Instant,
}

impl Embeddings {
    /// Only text items can be embedded. Any other item fails the whole
    /// request before the model is touched.
    pub async fn open(
        registry: &ModelRegistry,
        request: EmbeddingsRequest,
        cancel: &CancellationToken,
    ) -> Result<Self, GatewayError> {
        let items = request.input.into_items();
        if items.is_empty() {
            return Err(GatewayError::InvalidRequest("input must not be empty".into()));
        }
        if let Some(item) = items.iter().find(|item| item.kind() != EmbeddingKind::Text) {
            return Err(GatewayError::UnsupportedInput(format!(
                "Embedding type {} is not supported.",
                item.kind().as_str()
            )));
        }
        let documents: Vec<String> = items.iter().map(|item| item.content().to_string()).collect();

        let cancel = cancel.child_token();
        let handle = registry.get(&request.model).await?;
        let (lock, lock_acquired_at) = lock_sequence(&handle, &cancel).await?;
        let weights = registry.ensure_loaded(&handle, &cancel).await?;
        let context = weights.create_embedding_context(&cancel).await?;

        let mut prompt_tokens = 0;
        for document in &documents {
            prompt_tokens += count_tokens(&handle, document)?;
        }

        let id = request_id("embd");
        debug!(
            request_id = %id,
            model_id = %handle.id(),
            documents = documents.len(),
            prompt_tokens,
            "embedding session ready"
        );
        Ok(Self {
            id,
            model: request.model,
            cancel,
            handle,
            context: Some(context),
            documents,
            usage: EmbeddingUsage {
                prompt_tokens,
                total_tokens: prompt_tokens,
            },
            lock: Some(lock),
            lock_acquired_at,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handle(&self) -> &ModelHandle {
        &self.handle
    }

    pub fn usage(&self) -> EmbeddingUsage {
        self.usage
    }

    pub fn lock_acquired_at(&self) -> Instant {
        self.lock_acquired_at
    }

    /// Embed every document. Vectors come back in input order.
    pub async fn request(&self) -> Result<EmbeddingsResponse, GatewayError> {
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| GatewayError::ModelNotLoaded("embedding context released".into()))?;
        let vectors = try_join_all(
            self.documents
                .iter()
                .map(|document| context.embed(document, &self.cancel)),
        )
        .await
        .map_err(GatewayError::from);
        let vectors = settle_cancel(&self.cancel, vectors)?;

        Ok(EmbeddingsResponse {
            object: "list".to_string(),
            data: vectors
                .into_iter()
                .enumerate()
                .map(|(index, embedding)| EmbeddingData {
                    index: index as u32,
                    object: "embedding".to_string(),
                    embedding,
                })
                .collect(),
            model: self.model.clone(),
            usage: self.usage,
        })
    }

    /// Dispose the embedding context, then release the sequence lock.
    pub async fn dispose(mut self) {
        self.cancel.cancel();
        if let Some(context) = self.context.take() {
            if let Err(error) = context.dispose().await {
                warn!(request_id = %self.id, %error, "embedding context disposal failed");
            }
        }
        if let Some(lock) = self.lock.take() {
            lock.release();
        }
        debug!(request_id = %self.id, "embedding session disposed");
    }
}

impl Drop for Embeddings {
    fn drop(&mut self) {
        self.cancel.cancel();
        let Some(context) = self.context.take() else {
            return;
        };
        // Dropped without dispose: finish the teardown in the background.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let id = std::mem::take(&mut self.id);
            runtime.spawn(async move {
                if let Err(error) = context.dispose().await {
                    warn!(request_id = %id, %error, "embedding context disposal failed");
                }
            });
        }
    }
}
