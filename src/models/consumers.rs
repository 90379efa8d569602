//! The two consumers of a model's single sequence.
//!
//! Both share the handle's sequence, so every call must happen while the
//! handle's sequence lock is held.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::engine::{
    ChatHistoryItem, ContextSequence, Generation, GenerationOptions, InferenceError,
    TextStreamSender,
};

/// Chat-style consumer: replays a history, then answers a prompt.
pub struct ChatSession {
    sequence: Arc<dyn ContextSequence>,
    history: Mutex<Vec<ChatHistoryItem>>,
    disposed: AtomicBool,
}

impl ChatSession {
    pub(crate) fn new(sequence: Arc<dyn ContextSequence>) -> Self {
        Self {
            sequence,
            history: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Replace the history replayed before the next prompt.
    pub fn set_history(&self, history: Vec<ChatHistoryItem>) {
        *self.history.lock() = history;
    }

    pub fn history(&self) -> Vec<ChatHistoryItem> {
        self.history.lock().clone()
    }

    /// Answer `prompt`. On success the exchange is appended to the history.
    pub async fn prompt(
        &self,
        prompt: &str,
        options: &GenerationOptions,
        cancel: &CancellationToken,
        sink: TextStreamSender,
    ) -> Result<Generation, InferenceError> {
        self.ensure_live()?;
        let history = self.history();
        let generation = self
            .sequence
            .prompt_chat(&history, prompt, options, cancel, sink)
            .await?;

        let mut history = self.history.lock();
        history.push(ChatHistoryItem::User(prompt.to_string()));
        history.push(ChatHistoryItem::Model(generation.text.clone()));
        Ok(generation)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.history.lock().clear();
    }

    fn ensure_live(&self) -> Result<(), InferenceError> {
        if self.is_disposed() {
            return Err(InferenceError::ModelNotLoaded("chat session was disposed".into()));
        }
        Ok(())
    }
}

/// Raw-prompt consumer.
pub struct CompletionEngine {
    sequence: Arc<dyn ContextSequence>,
    disposed: AtomicBool,
}

impl CompletionEngine {
    pub(crate) fn new(sequence: Arc<dyn ContextSequence>) -> Self {
        Self {
            sequence,
            disposed: AtomicBool::new(false),
        }
    }

    pub async fn complete(
        &self,
        prompt: &str,
        options: &GenerationOptions,
        cancel: &CancellationToken,
        sink: TextStreamSender,
    ) -> Result<Generation, InferenceError> {
        if self.is_disposed() {
            return Err(InferenceError::ModelNotLoaded("completion engine was disposed".into()));
        }
        self.sequence.complete(prompt, options, cancel, sink).await
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}
