//! Per-request sessions for chat, raw completion and embeddings.
//!
//! A session resolves its model, takes the model's sequence lock, makes sure
//! weights are resident, and builds the consumer it needs. The lock guard is
//! owned by the session, so it is released exactly once on every exit path:
//! explicit dispose, drop after an error, or drop of a cancelled future.

mod chat;
mod completion;
mod embeddings;
mod media;

use std::future::Future;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use chat::ChatCompletion;
pub use completion::TextCompletion;
pub use embeddings::Embeddings;
pub use media::{message_text, MediaAnnotator, PlaceholderAnnotator};

use crate::engine::{Generation, InferenceError, TextStream, TextStreamSender, FRAGMENT_BUFFER};
use crate::error::GatewayError;
use crate::models::ModelHandle;
use crate::sync::MutexGuard;

/// Receives chunk records while a streamed request generates.
pub type ChunkSender<T> = mpsc::UnboundedSender<T>;

/// `prefix-<uuid>` request identifier.
pub(crate) fn request_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

/// Seconds since the unix epoch.
pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Token count of `text` under `handle`'s tokenizer.
pub(crate) fn count_tokens(handle: &ModelHandle, text: &str) -> Result<u32, GatewayError> {
    Ok(handle.encode(text)?.len() as u32)
}

/// Take `handle`'s sequence lock unless `cancel` fires first.
pub(crate) async fn lock_sequence(
    handle: &ModelHandle,
    cancel: &CancellationToken,
) -> Result<(MutexGuard, Instant), GatewayError> {
    tokio::select! {
        guard = handle.sequence_lock().acquire() => Ok((guard, Instant::now())),
        _ = cancel.cancelled() => Err(GatewayError::Cancelled),
    }
}

/// Run one generation, handing each fragment to `on_fragment` as it arrives.
///
/// Fragments are delivered in order and all of them before the result. An
/// error from `on_fragment` drops the generation.
pub(crate) async fn pump<G, Fut, F>(generate: G, mut on_fragment: F) -> Result<Generation, GatewayError>
where
    G: FnOnce(TextStreamSender) -> Fut,
    Fut: Future<Output = Result<Generation, InferenceError>>,
    F: FnMut(String) -> Result<(), GatewayError>,
{
    let (sink, mut fragments) = TextStream::new(FRAGMENT_BUFFER);
    let generation = generate(sink);
    tokio::pin!(generation);

    let result = loop {
        tokio::select! {
            biased;
            Some(fragment) = fragments.next() => on_fragment(fragment)?,
            result = &mut generation => break result,
        }
    };
    while let Some(fragment) = fragments.try_next() {
        on_fragment(fragment)?;
    }
    Ok(result?)
}

/// A fired token wins over whatever the backend reported.
pub(crate) fn settle_cancel<T>(
    cancel: &CancellationToken,
    result: Result<T, GatewayError>,
) -> Result<T, GatewayError> {
    if cancel.is_cancelled() {
        return Err(GatewayError::Cancelled);
    }
    result
}
