//! Chat completion sessions.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    count_tokens, lock_sequence, message_text, pump, request_id, settle_cancel, unix_now,
    ChunkSender, MediaAnnotator,
};
use crate::api::protocol::{
    AssistantMessage, ChatChoice, ChatChunkChoice, ChatCompletionChunk, ChatCompletionRequest,
    ChatCompletionResponse, Delta, Role, Usage,
};
use crate::engine::{ChatHistoryItem, GenerationOptions};
use crate::error::GatewayError;
use crate::models::{ChatSession, ModelHandle, ModelRegistry};
use crate::sync::MutexGuard;

/// Fields every chunk of one response repeats.
struct ChunkMeta {
    id: String,
    created: i64,
    model: String,
    include_usage: bool,
}

impl ChunkMeta {
    fn chunk(&self, content: String, finish_reason: Option<&str>, usage: Usage) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChatChunkChoice {
                index: 0,
                delta: Delta {
                    role: "assistant".to_string(),
                    content,
                },
                finish_reason: finish_reason.map(str::to_string),
            }],
            usage: self.include_usage.then_some(usage),
        }
    }
}

/// One `/v1/chat/completions` request, holding its model's sequence lock.
pub struct ChatCompletion {
    meta: ChunkMeta,
    stream: bool,
    cancel: CancellationToken,
    handle: ModelHandle,
    session: Arc<ChatSession>,
    prompt: String,
    options: GenerationOptions,
    usage: Usage,
    lock: Option<MutexGuard>,
    lock_acquired_at: Instant,
}

impl ChatCompletion {
    /// Validate the request, then build everything generation needs.
    ///
    /// The last message must come from the user and becomes the prompt.
    /// Earlier messages become the replayed history, and their rendered
    /// template text is what `prompt_tokens` counts.
    pub async fn open(
        registry: &ModelRegistry,
        annotator: &dyn MediaAnnotator,
        request: ChatCompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Self, GatewayError> {
        let include_usage = request.include_usage();
        let options = request.generation_options()?;
        let ChatCompletionRequest {
            model,
            mut messages,
            stream,
            ..
        } = request;

        let last = messages.pop().ok_or_else(|| {
            GatewayError::InvalidRequest("The conversation must have at least one message.".into())
        })?;
        if last.role != Role::User {
            return Err(GatewayError::InvalidRequest(
                "The last message must be a user message.".into(),
            ));
        }
        let prompt = message_text(annotator, &last.content).await?;
        let mut history = Vec::with_capacity(messages.len());
        for message in &messages {
            let text = message_text(annotator, &message.content).await?;
            history.push(match message.role {
                Role::System => ChatHistoryItem::System(text),
                Role::User => ChatHistoryItem::User(text),
                Role::Assistant => ChatHistoryItem::Model(text),
            });
        }

        let cancel = cancel.child_token();
        let handle = registry.get(&model).await?;
        let (lock, lock_acquired_at) = lock_sequence(&handle, &cancel).await?;
        registry.ensure_loaded(&handle, &cancel).await?;
        let session = handle.chat_session(&cancel).await?;

        let prompt_tokens = count_tokens(&handle, &handle.render_chat_template(&history)?)?;
        session.set_history(history);

        let meta = ChunkMeta {
            id: request_id("chatcmpl"),
            created: unix_now(),
            model,
            include_usage,
        };
        debug!(request_id = %meta.id, model_id = %handle.id(), prompt_tokens, "chat session ready");

        Ok(Self {
            meta,
            stream,
            cancel,
            handle,
            session,
            prompt,
            options,
            usage: Usage::with_prompt(prompt_tokens),
            lock: Some(lock),
            lock_acquired_at,
        })
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn handle(&self) -> &ModelHandle {
        &self.handle
    }

    pub fn is_stream(&self) -> bool {
        self.stream
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    /// When this session got the model's sequence lock.
    pub fn lock_acquired_at(&self) -> Instant {
        self.lock_acquired_at
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Generate the answer.
    ///
    /// With `chunks`, every fragment is also sent as a chunk, followed by a
    /// final empty chunk carrying the finish reason. A closed chunk receiver
    /// cancels the generation. The full response is returned either way.
    pub async fn request(
        &mut self,
        chunks: Option<&ChunkSender<ChatCompletionChunk>>,
    ) -> Result<ChatCompletionResponse, GatewayError> {
        let cancel = self.cancel.clone();
        let session = self.session.clone();
        let handle = self.handle.clone();
        let (prompt, options, meta) = (&self.prompt, &self.options, &self.meta);
        let mut usage = self.usage;

        let result = pump(
            |sink| session.prompt(prompt, options, &cancel, sink),
            |fragment| {
                usage.add_completion(count_tokens(&handle, &fragment)?);
                if let Some(chunks) = chunks {
                    if chunks.send(meta.chunk(fragment, None, usage)).is_err() {
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

        let finish_reason = generation.stop_reason.finish_reason();
        if let Some(chunks) = chunks {
            let _ = chunks.send(meta.chunk(String::new(), Some(finish_reason), usage));
        }

        Ok(ChatCompletionResponse {
            id: meta.id.clone(),
            object: "chat.completion".to_string(),
            created: meta.created,
            model: meta.model.clone(),
            choices: vec![ChatChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content: generation.text,
                    refusal: None,
                },
                logprobs: None,
                finish_reason: finish_reason.to_string(),
            }],
            usage,
        })
    }

    /// Cancel anything still running and release the sequence lock.
    pub fn dispose(mut self) {
        self.cancel.cancel();
        if let Some(lock) = self.lock.take() {
            lock.release();
        }
        debug!(request_id = %self.meta.id, "chat session disposed");
    }
}

impl Drop for ChatCompletion {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
