//! Raw text completion sessions.

use std::sync::Arc;
use std::time::Instant;

use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{count_tokens, lock_sequence, pump, request_id, settle_cancel, unix_now, ChunkSender};
use crate::api::protocol::{
    CompletionRequest, TextChoice, TextChunkChoice, TextCompletionChunk, TextCompletionResponse,
    Usage,
};
use crate::engine::{Generation, GenerationOptions};
use crate::error::GatewayError;
use crate::models::{CompletionEngine, ModelHandle, ModelRegistry};
use crate::sync::MutexGuard;

const MULTI_PROMPT_STREAM: &str = "Streaming mode with multiple prompts is not supported.";

/// One `/v1/completions` request, holding its model's sequence lock.
pub struct TextCompletion {
    id: String,
    created: i64,
    model: String,
    include_usage: bool,
    cancel: CancellationToken,
    handle: ModelHandle,
    engine: Arc<CompletionEngine>,
    prompts: Vec<String>,
    options: GenerationOptions,
    usage: Usage,
    lock: Option<MutexGuard>,
    lock_acquired_at: Instant,
}

impl TextCompletion {
    /// Streaming together with several prompts is rejected here, before any
    /// lock is taken.
    pub async fn open(
        registry: &ModelRegistry,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Self, GatewayError> {
        if request.prompt.is_empty() {
            return Err(GatewayError::InvalidRequest("prompt must not be empty".into()));
        }
        if request.stream && request.prompt.len() > 1 {
            return Err(GatewayError::UnsupportedInput(MULTI_PROMPT_STREAM.into()));
        }
        let include_usage = request.include_usage();
        let options = request.generation_options()?;
        let prompts = request.prompt.into_vec();

        let cancel = cancel.child_token();
        let handle = registry.get(&request.model).await?;
        let (lock, lock_acquired_at) = lock_sequence(&handle, &cancel).await?;
        registry.ensure_loaded(&handle, &cancel).await?;
        let engine = handle.completion_engine(&cancel).await?;
        let prompt_tokens = count_tokens(&handle, &prompts.join("\n"))?;

        let id = request_id("cmpl");
        debug!(
            request_id = %id,
            model_id = %handle.id(),
            prompts = prompts.len(),
            prompt_tokens,
            "completion session ready"
        );
        Ok(Self {
            id,
            created: unix_now(),
            model: request.model,
            include_usage,
            cancel,
            handle,
            engine,
            prompts,
            options,
            usage: Usage::with_prompt(prompt_tokens),
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

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn lock_acquired_at(&self) -> Instant {
        self.lock_acquired_at
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_batch(&self) -> bool {
        self.prompts.len() > 1
    }

    fn chunk(&self, text: String, finish_reason: Option<&str>, usage: Usage) -> TextCompletionChunk {
        TextCompletionChunk {
            id: self.id.clone(),
            object: "text.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![TextChunkChoice {
                index: 0,
                text,
                finish_reason: finish_reason.map(str::to_string),
            }],
            usage: self.include_usage.then_some(usage),
        }
    }

    fn response(&self, generations: Vec<Generation>) -> TextCompletionResponse {
        TextCompletionResponse {
            id: self.id.clone(),
            object: "text.completion".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: generations
                .into_iter()
                .enumerate()
                .map(|(index, generation)| TextChoice {
                    index: index as u32,
                    finish_reason: generation.stop_reason.finish_reason().to_string(),
                    text: generation.text,
                    logprobs: None,
                })
                .collect(),
            usage: self.usage,
        }
    }

    /// Generate. A single prompt may stream through `chunks`; several
    /// prompts run as one parallel batch and never stream.
    pub async fn request(
        &mut self,
        chunks: Option<&ChunkSender<TextCompletionChunk>>,
    ) -> Result<TextCompletionResponse, GatewayError> {
        if self.is_batch() {
            if chunks.is_some() {
                return Err(GatewayError::UnsupportedInput(MULTI_PROMPT_STREAM.into()));
            }
            return self.request_batch().await;
        }

        let cancel = self.cancel.clone();
        let engine = self.engine.clone();
        let handle = self.handle.clone();
        let options = &self.options;
        let prompt = self.prompts.first().map(String::as_str).unwrap_or_default();
        let mut usage = self.usage;

        let result = pump(
            |sink| engine.complete(prompt, options, &cancel, sink),
            |fragment| {
                usage.add_completion(count_tokens(&handle, &fragment)?);
                if let Some(chunks) = chunks {
                    if chunks.send(self.chunk(fragment, None, usage)).is_err() {
                        cancel.cancel();
                        return Err(GatewayError::Cancelled);
                    }
                }
                Ok(())
            },
        )
        .await;
        self.usage = usage;
        let generation = settle_cancel(&cancel, result)?;

        if let Some(chunks) = chunks {
            let finish_reason = generation.stop_reason.finish_reason();
            let _ = chunks.send(self.chunk(String::new(), Some(finish_reason), usage));
        }
        Ok(self.response(vec![generation]))
    }

    async fn request_batch(&mut self) -> Result<TextCompletionResponse, GatewayError> {
        let (engine, handle, options, cancel) = (&self.engine, &self.handle, &self.options, &self.cancel);
        let runs = self.prompts.iter().map(|prompt| async move {
            let mut tokens = 0u32;
            let generation = pump(
                |sink| engine.complete(prompt, options, cancel, sink),
                |fragment| {
                    tokens += count_tokens(handle, &fragment)?;
                    Ok(())
                },
            )
            .await?;
            Ok::<_, GatewayError>((generation, tokens))
        });
        let results = settle_cancel(cancel, try_join_all(runs).await)?;

        let mut generations = Vec::with_capacity(results.len());
        for (generation, tokens) in results {
            self.usage.add_completion(tokens);
            generations.push(generation);
        }
        Ok(self.response(generations))
    }

    pub fn dispose(mut self) {
        self.cancel.cancel();
        if let Some(lock) = self.lock.take() {
            lock.release();
        }
        debug!(request_id = %self.id, "completion session disposed");
    }
}

impl Drop for TextCompletion {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
