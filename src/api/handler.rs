//! Endpoint drivers.
//!
//! Each endpoint class has one admission gate, so requests of the same
//! class run one at a time in arrival order while the three classes
//! proceed independently. Inside the gate a request opens its session
//! (which takes the model's sequence lock), generates and disposes.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument, Span};

use super::protocol::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, CompletionRequest,
    EmbeddingsRequest, EmbeddingsResponse, ModelCard, ModelList, TextCompletionChunk,
    TextCompletionResponse, Usage,
};
use super::sse::StreamEncoder;
use super::system::SystemSnapshot;
use crate::error::GatewayError;
use crate::models::ModelRegistry;
use crate::session::{ChatCompletion, Embeddings, MediaAnnotator, TextCompletion};
use crate::shutdown::ShutdownCoordinator;
use crate::sync::{self, MutexGuard};
use crate::telemetry::{RequestSpan, SpanExt};

/// `owned_by` of every listed model.
pub const MODEL_OWNER: &str = "llm-gateway";

/// How a streamed response ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Every chunk and the `[DONE]` sentinel were written.
    Completed,
    /// Generation failed after the stream opened. An error frame and the
    /// sentinel were written.
    Failed,
    /// Cancelled or the peer went away. No sentinel.
    Aborted,
}

/// One admission gate per endpoint class.
#[derive(Default)]
pub struct AdmissionGates {
    pub chat: sync::Mutex,
    pub completion: sync::Mutex,
    pub embeddings: sync::Mutex,
}

async fn admit(gate: &sync::Mutex, cancel: &CancellationToken) -> Result<MutexGuard, GatewayError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        guard = gate.acquire() => Ok(guard),
    }
}

fn record_outcome<T>(span: &Span, started: Instant, result: &Result<T, GatewayError>) {
    span.record("latency_ms", started.elapsed().as_millis() as u64);
    span.record_result(result);
}

/// Serves the API surface on top of one registry.
pub struct ApiHandler {
    registry: Arc<ModelRegistry>,
    annotator: Arc<dyn MediaAnnotator>,
    gates: AdmissionGates,
    shutdown: ShutdownCoordinator,
    started_at: Instant,
}

impl ApiHandler {
    pub fn new(
        registry: Arc<ModelRegistry>,
        annotator: Arc<dyn MediaAnnotator>,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            registry,
            annotator,
            gates: AdmissionGates::default(),
            shutdown,
            started_at: Instant::now(),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn gates(&self) -> &AdmissionGates {
        &self.gates
    }

    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Non-streamed chat completion.
    pub async fn chat(
        &self,
        request: ChatCompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatCompletionResponse, GatewayError> {
        let _flight = self.shutdown.track()?;
        let span = RequestSpan::new("chat", &request.model);
        let started = Instant::now();

        let result = async {
            let _gate = admit(&self.gates.chat, cancel).await?;
            let mut session =
                ChatCompletion::open(&self.registry, self.annotator.as_ref(), request, cancel)
                    .await?;
            Span::current().record("request_id", session.id());
            let result = session.request(None).await;
            session.dispose();
            result
        }
        .instrument(span.clone())
        .await;

        if let Ok(response) = &result {
            span.record_usage(&response.usage);
        }
        record_outcome(&span, started, &result);
        result
    }

    /// Streamed chat completion written to `writer` as SSE frames.
    ///
    /// Failures before the first frame come back as `Err` with nothing
    /// written. Later failures are reported in-stream.
    pub async fn chat_stream<W>(
        &self,
        mut request: ChatCompletionRequest,
        writer: W,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome, GatewayError>
    where
        W: AsyncWrite + Unpin,
    {
        let _flight = self.shutdown.track()?;
        let span = RequestSpan::new("chat_stream", &request.model);
        let started = Instant::now();
        request.stream = true;

        let result = async {
            let _gate = admit(&self.gates.chat, cancel).await?;
            let mut session =
                ChatCompletion::open(&self.registry, self.annotator.as_ref(), request, cancel)
                    .await?;
            Span::current().record("request_id", session.id());
            let session_cancel = session.cancel_token().clone();

            let mut encoder = StreamEncoder::new(writer);
            let (tx, rx) = mpsc::unbounded_channel::<ChatCompletionChunk>();
            let generation = async {
                let result = session.request(Some(&tx)).await.map(|response| response.usage);
                drop(tx);
                result
            };
            let (result, write_failed) =
                forward_chunks(&mut encoder, &session_cancel, rx, generation).await;
            if let Ok(usage) = &result {
                Span::current().record_usage(usage);
            }
            session.dispose();
            Ok(finish_stream(&mut encoder, result.map(|_| ()), write_failed).await)
        }
        .instrument(span.clone())
        .await;

        record_outcome(&span, started, &result);
        result
    }

    /// Non-streamed text completion, one choice per prompt.
    pub async fn completion(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<TextCompletionResponse, GatewayError> {
        let _flight = self.shutdown.track()?;
        let span = RequestSpan::new("completion", &request.model);
        let started = Instant::now();

        let result = async {
            let _gate = admit(&self.gates.completion, cancel).await?;
            let mut session = TextCompletion::open(&self.registry, request, cancel).await?;
            Span::current().record("request_id", session.id());
            let result = session.request(None).await;
            session.dispose();
            result
        }
        .instrument(span.clone())
        .await;

        if let Ok(response) = &result {
            span.record_usage(&response.usage);
        }
        record_outcome(&span, started, &result);
        result
    }

    /// Streamed text completion. Several prompts fail before anything is
    /// written.
    pub async fn completion_stream<W>(
        &self,
        mut request: CompletionRequest,
        writer: W,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome, GatewayError>
    where
        W: AsyncWrite + Unpin,
    {
        let _flight = self.shutdown.track()?;
        let span = RequestSpan::new("completion_stream", &request.model);
        let started = Instant::now();
        request.stream = true;

        let result = async {
            let _gate = admit(&self.gates.completion, cancel).await?;
            let mut session = TextCompletion::open(&self.registry, request, cancel).await?;
            Span::current().record("request_id", session.id());
            let session_cancel = session.cancel_token().clone();

            let mut encoder = StreamEncoder::new(writer);
            let (tx, rx) = mpsc::unbounded_channel::<TextCompletionChunk>();
            let generation = async {
                let result = session.request(Some(&tx)).await.map(|response| response.usage);
                drop(tx);
                result
            };
            let (result, write_failed) =
                forward_chunks(&mut encoder, &session_cancel, rx, generation).await;
            if let Ok(usage) = &result {
                Span::current().record_usage(usage);
            }
            session.dispose();
            Ok(finish_stream(&mut encoder, result.map(|_| ()), write_failed).await)
        }
        .instrument(span.clone())
        .await;

        record_outcome(&span, started, &result);
        result
    }

    pub async fn embeddings(
        &self,
        request: EmbeddingsRequest,
        cancel: &CancellationToken,
    ) -> Result<EmbeddingsResponse, GatewayError> {
        let _flight = self.shutdown.track()?;
        let span = RequestSpan::new("embeddings", &request.model);
        let started = Instant::now();

        let result = async {
            let _gate = admit(&self.gates.embeddings, cancel).await?;
            let session = Embeddings::open(&self.registry, request, cancel).await?;
            Span::current().record("request_id", session.id());
            let result = session.request().await;
            session.dispose().await;
            result
        }
        .instrument(span.clone())
        .await;

        if let Ok(response) = &result {
            span.record("prompt_tokens", response.usage.prompt_tokens);
        }
        record_outcome(&span, started, &result);
        result
    }

    /// Every tracked model, sorted by id.
    pub async fn list_models(&self) -> ModelList {
        let data = self
            .registry
            .list()
            .await
            .into_iter()
            .map(|handle| ModelCard {
                id: handle.id().to_string(),
                object: "model".to_string(),
                created: handle.modified_unix(),
                owned_by: MODEL_OWNER.to_string(),
                name: handle.info().ok().and_then(|info| info.metadata.name.clone()),
            })
            .collect();
        ModelList {
            object: "list".to_string(),
            data,
        }
    }

    pub async fn system(&self) -> SystemSnapshot {
        SystemSnapshot::collect(&self.registry, &self.shutdown, self.started_at).await
    }
}

/// Write chunks as they arrive until the generation ends and its sender is
/// gone. A failed write cancels the generation and the rest is discarded.
async fn forward_chunks<W, C, Fut>(
    encoder: &mut StreamEncoder<W>,
    cancel: &CancellationToken,
    mut chunks: mpsc::UnboundedReceiver<C>,
    generation: Fut,
) -> (Result<Usage, GatewayError>, bool)
where
    W: AsyncWrite + Unpin,
    C: Serialize,
    Fut: Future<Output = Result<Usage, GatewayError>>,
{
    tokio::pin!(generation);
    let mut result = None;
    let mut write_failed = false;

    loop {
        tokio::select! {
            biased;
            chunk = chunks.recv() => match chunk {
                Some(chunk) if !write_failed => {
                    if let Err(error) = encoder.write_json(&chunk).await {
                        debug!(%error, "stream write failed, cancelling generation");
                        write_failed = true;
                        cancel.cancel();
                    }
                }
                Some(_) => {}
                None => break,
            },
            settled = &mut generation, if result.is_none() => result = Some(settled),
        }
    }

    let result = match result {
        Some(result) => result,
        None => generation.await,
    };
    (result, write_failed)
}

async fn finish_stream<W>(
    encoder: &mut StreamEncoder<W>,
    result: Result<(), GatewayError>,
    write_failed: bool,
) -> StreamOutcome
where
    W: AsyncWrite + Unpin,
{
    let outcome = match result {
        Ok(()) if !write_failed => match encoder.done().await {
            Ok(()) => return StreamOutcome::Completed,
            Err(error) => {
                debug!(%error, "writing stream sentinel failed");
                StreamOutcome::Aborted
            }
        },
        Err(error) if !write_failed && !error.is_cancelled() => {
            warn!(%error, "generation failed mid-stream");
            let reported = match encoder.write_json(&error.to_body()).await {
                Ok(()) => encoder.done().await,
                Err(error) => Err(error),
            };
            match reported {
                Ok(()) => return StreamOutcome::Failed,
                Err(error) => {
                    debug!(%error, "reporting stream failure failed");
                    StreamOutcome::Aborted
                }
            }
        }
        _ => StreamOutcome::Aborted,
    };

    if !encoder.is_closed() {
        let _ = encoder.abort().await;
    }
    outcome
}
