//! In-process backend with scripted replies.
//!
//! Used for CPU-only development, integration tests and benches. The
//! tokenizer maps each character to its code point, so `decode(encode(s))`
//! reproduces `s` exactly.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{
    BackendCapabilities, ChatHistoryItem, ContextSequence, EmbeddingContext, ExecutionContext,
    Generation, GenerationOptions, InferenceBackend, InferenceError, ModelMetadata, ModelWeights,
    SpecialTokens, StopReason, TextStreamSender, Token, Tokenizer, WeightsOptions,
};

const BOS: Token = 0x11_0000;
const EOS: Token = 0x11_0001;

/// What a scripted sequence answers with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Fixed(String),
    /// Repeat the prompt back, prefixed with `echo: `.
    Echo,
}

/// Snapshot of what the backend has been asked to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScriptStats {
    pub metadata_loads: usize,
    pub weight_loads: usize,
    pub weights_disposed: usize,
    pub contexts_created: usize,
    pub contexts_disposed: usize,
    pub sequences_created: usize,
    pub embedding_contexts_created: usize,
    pub embedding_contexts_disposed: usize,
    pub generations: usize,
    /// Highest number of generations observed running at once.
    pub peak_concurrent_generations: usize,
}

/// The last generation request a sequence received.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeenRequest {
    pub history: Vec<ChatHistoryItem>,
    pub prompt: String,
    pub options: GenerationOptions,
}

#[derive(Default)]
struct Counters {
    metadata_loads: AtomicUsize,
    weight_loads: AtomicUsize,
    weights_disposed: AtomicUsize,
    contexts_created: AtomicUsize,
    contexts_disposed: AtomicUsize,
    sequences_created: AtomicUsize,
    embedding_contexts_created: AtomicUsize,
    embedding_contexts_disposed: AtomicUsize,
    generations: AtomicUsize,
    active_generations: AtomicUsize,
    peak_concurrent_generations: AtomicUsize,
}

struct Script {
    reply: Reply,
    fragment_delay: Duration,
    load_delay: Duration,
    embedding_size: u32,
    failing_metadata: Mutex<HashSet<String>>,
    failing_weights: HashSet<String>,
    counters: Counters,
    seen: Mutex<Option<SeenRequest>>,
}

/// Deterministic backend driven by a script.
#[derive(Clone)]
pub struct ScriptedBackend {
    script: Arc<Script>,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::from_script(Script {
            reply: Reply::Fixed("Hello from the scripted backend.".into()),
            fragment_delay: Duration::ZERO,
            load_delay: Duration::ZERO,
            embedding_size: 8,
            failing_metadata: Mutex::new(HashSet::new()),
            failing_weights: HashSet::new(),
            counters: Counters::default(),
            seen: Mutex::new(None),
        })
    }

    fn from_script(script: Script) -> Self {
        Self { script: Arc::new(script) }
    }

    fn rebuild(self, edit: impl FnOnce(&mut Script)) -> Self {
        let mut script = match Arc::try_unwrap(self.script) {
            Ok(script) => script,
            Err(shared) => Script {
                reply: shared.reply.clone(),
                fragment_delay: shared.fragment_delay,
                load_delay: shared.load_delay,
                embedding_size: shared.embedding_size,
                failing_metadata: Mutex::new(shared.failing_metadata.lock().clone()),
                failing_weights: shared.failing_weights.clone(),
                counters: Counters::default(),
                seen: Mutex::new(None),
            },
        };
        edit(&mut script);
        Self::from_script(script)
    }

    pub fn with_reply(self, reply: impl Into<String>) -> Self {
        let reply = Reply::Fixed(reply.into());
        self.rebuild(|s| s.reply = reply)
    }

    pub fn with_echo(self) -> Self {
        self.rebuild(|s| s.reply = Reply::Echo)
    }

    /// Pause before each fragment. Cancellation interrupts the pause.
    pub fn with_fragment_delay(self, delay: Duration) -> Self {
        self.rebuild(|s| s.fragment_delay = delay)
    }

    /// Pause inside every weight load.
    pub fn with_load_delay(self, delay: Duration) -> Self {
        self.rebuild(|s| s.load_delay = delay)
    }

    pub fn with_embedding_size(self, size: u32) -> Self {
        self.rebuild(|s| s.embedding_size = size.max(1))
    }

    /// Fail metadata loads for files with this name.
    pub fn failing_metadata_for(self, file_name: impl Into<String>) -> Self {
        let name = file_name.into();
        self.rebuild(|s| {
            s.failing_metadata.get_mut().insert(name);
        })
    }

    /// Let metadata loads for this file name succeed again.
    pub fn repair_metadata(&self, file_name: &str) {
        self.script.failing_metadata.lock().remove(file_name);
    }

    /// Fail weight loads for files with this name.
    pub fn failing_weights_for(self, file_name: impl Into<String>) -> Self {
        let name = file_name.into();
        self.rebuild(|s| {
            s.failing_weights.insert(name);
        })
    }

    pub fn stats(&self) -> ScriptStats {
        let c = &self.script.counters;
        ScriptStats {
            metadata_loads: c.metadata_loads.load(Ordering::SeqCst),
            weight_loads: c.weight_loads.load(Ordering::SeqCst),
            weights_disposed: c.weights_disposed.load(Ordering::SeqCst),
            contexts_created: c.contexts_created.load(Ordering::SeqCst),
            contexts_disposed: c.contexts_disposed.load(Ordering::SeqCst),
            sequences_created: c.sequences_created.load(Ordering::SeqCst),
            embedding_contexts_created: c.embedding_contexts_created.load(Ordering::SeqCst),
            embedding_contexts_disposed: c.embedding_contexts_disposed.load(Ordering::SeqCst),
            generations: c.generations.load(Ordering::SeqCst),
            peak_concurrent_generations: c.peak_concurrent_generations.load(Ordering::SeqCst),
        }
    }

    pub fn last_request(&self) -> Option<SeenRequest> {
        self.script.seen.lock().clone()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::default()
    }

    async fn load_metadata(&self, path: &Path) -> Result<ModelMetadata, InferenceError> {
        self.script.counters.metadata_loads.fetch_add(1, Ordering::SeqCst);
        let name = file_name(path);
        if self.script.failing_metadata.lock().contains(&name) {
            return Err(InferenceError::MetadataLoad(format!("{name}: scripted failure")));
        }
        let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned());
        Ok(ModelMetadata {
            name: stem,
            architecture: Some("scripted".into()),
            tokenizer: Arc::new(CharTokenizer),
            special_tokens: SpecialTokens {
                bos: Some(BOS),
                eos: Some(EOS),
            },
            embedded_chat_template: None,
            embedding_vector_size: self.script.embedding_size,
            train_context_size: 4096,
            flash_attention_supported: false,
            vocabulary_type: "char".into(),
        })
    }

    async fn load_weights(
        &self,
        path: &Path,
        _options: WeightsOptions,
    ) -> Result<Arc<dyn ModelWeights>, InferenceError> {
        self.script.counters.weight_loads.fetch_add(1, Ordering::SeqCst);
        if !self.script.load_delay.is_zero() {
            tokio::time::sleep(self.script.load_delay).await;
        }
        let name = file_name(path);
        if self.script.failing_weights.contains(&name) {
            return Err(InferenceError::WeightLoad(format!("{name}: scripted failure")));
        }
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| InferenceError::WeightLoad(format!("{}: {e}", path.display())))?
            .len();
        Ok(Arc::new(ScriptedWeights {
            script: self.script.clone(),
            path: path.to_path_buf(),
            size,
        }))
    }
}

/// One token per Unicode scalar value.
pub struct CharTokenizer;

impl Tokenizer for CharTokenizer {
    fn encode(&self, text: &str, special_tokens: bool) -> Result<Vec<Token>, InferenceError> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if special_tokens {
            tokens.push(BOS);
        }
        tokens.extend(text.chars().map(Token::from));
        Ok(tokens)
    }

    fn decode(&self, tokens: &[Token], special_tokens: bool) -> Result<String, InferenceError> {
        let mut text = String::with_capacity(tokens.len());
        for &token in tokens {
            match token {
                BOS if special_tokens => text.push_str("<s>"),
                EOS if special_tokens => text.push_str("</s>"),
                BOS | EOS => {}
                _ => text.push(char::from_u32(token).ok_or_else(|| {
                    InferenceError::Tokenization(format!("token {token} is out of vocabulary"))
                })?),
            }
        }
        Ok(text)
    }
}

struct ScriptedWeights {
    script: Arc<Script>,
    path: PathBuf,
    size: u64,
}

#[async_trait]
impl ModelWeights for ScriptedWeights {
    fn size_bytes(&self) -> u64 {
        self.size
    }

    async fn create_context(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn ExecutionContext>, InferenceError> {
        if cancel.is_cancelled() {
            return Err(InferenceError::Cancelled);
        }
        self.script.counters.contexts_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedContext {
            script: self.script.clone(),
        }))
    }

    async fn create_embedding_context(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn EmbeddingContext>, InferenceError> {
        if cancel.is_cancelled() {
            return Err(InferenceError::Cancelled);
        }
        self.script
            .counters
            .embedding_contexts_created
            .fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedEmbeddings {
            script: self.script.clone(),
        }))
    }

    async fn dispose(&self) -> Result<(), InferenceError> {
        tracing::debug!(path = %self.path.display(), "scripted weights disposed");
        self.script.counters.weights_disposed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct ScriptedContext {
    script: Arc<Script>,
}

#[async_trait]
impl ExecutionContext for ScriptedContext {
    async fn sequence(&self) -> Result<Arc<dyn ContextSequence>, InferenceError> {
        self.script.counters.sequences_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedSequence {
            script: self.script.clone(),
        }))
    }

    async fn dispose(&self) -> Result<(), InferenceError> {
        self.script.counters.contexts_disposed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct ScriptedSequence {
    script: Arc<Script>,
}

/// Decrements the active generation count when a generation ends or is dropped.
struct ActiveGeneration<'a>(&'a Counters);

impl<'a> ActiveGeneration<'a> {
    fn enter(counters: &'a Counters) -> Self {
        counters.generations.fetch_add(1, Ordering::SeqCst);
        let active = counters.active_generations.fetch_add(1, Ordering::SeqCst) + 1;
        counters
            .peak_concurrent_generations
            .fetch_max(active, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for ActiveGeneration<'_> {
    fn drop(&mut self) {
        self.0.active_generations.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedSequence {
    async fn generate(
        &self,
        history: &[ChatHistoryItem],
        prompt: &str,
        options: &GenerationOptions,
        cancel: &CancellationToken,
        sink: TextStreamSender,
    ) -> Result<Generation, InferenceError> {
        let _active = ActiveGeneration::enter(&self.script.counters);
        *self.script.seen.lock() = Some(SeenRequest {
            history: history.to_vec(),
            prompt: prompt.to_string(),
            options: options.clone(),
        });

        let mut reply = match &self.script.reply {
            Reply::Fixed(text) => text.clone(),
            Reply::Echo => format!("echo: {prompt}"),
        };
        if let Some(grammar) = &options.grammar {
            grammar.to_gbnf()?;
            reply = serde_json::json!({ "reply": reply }).to_string();
        }

        let limit = options.max_tokens.map(|n| n as usize).unwrap_or(usize::MAX);
        let mut text = String::new();
        let mut produced = 0usize;

        for fragment in reply.split_inclusive(' ') {
            if !self.script.fragment_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.script.fragment_delay) => {}
                }
            }
            if cancel.is_cancelled() {
                return Err(InferenceError::Cancelled);
            }

            let piece: String = fragment.chars().take(limit - produced).collect();
            let truncated = piece.chars().count() < fragment.chars().count();

            let candidate = format!("{text}{piece}");
            let stop_at = options
                .stop
                .iter()
                .filter_map(|stop| candidate.find(stop.as_str()))
                .min();
            if let Some(end) = stop_at {
                if end > text.len() && sink.send(&candidate[text.len()..end]).await.is_err() {
                    return Err(InferenceError::Cancelled);
                }
                text = candidate[..end].to_string();
                return Ok(Generation {
                    text,
                    stop_reason: StopReason::StopSequence,
                });
            }

            produced += piece.chars().count();
            if !piece.is_empty() && sink.send(piece.clone()).await.is_err() {
                return Err(InferenceError::Cancelled);
            }
            text.push_str(&piece);
            if truncated || produced >= limit {
                return Ok(Generation {
                    text,
                    stop_reason: StopReason::MaxTokens,
                });
            }
        }

        Ok(Generation {
            text,
            stop_reason: StopReason::EndOfGeneration,
        })
    }
}

#[async_trait]
impl ContextSequence for ScriptedSequence {
    async fn prompt_chat(
        &self,
        history: &[ChatHistoryItem],
        prompt: &str,
        options: &GenerationOptions,
        cancel: &CancellationToken,
        sink: TextStreamSender,
    ) -> Result<Generation, InferenceError> {
        self.generate(history, prompt, options, cancel, sink).await
    }

    async fn complete(
        &self,
        prompt: &str,
        options: &GenerationOptions,
        cancel: &CancellationToken,
        sink: TextStreamSender,
    ) -> Result<Generation, InferenceError> {
        self.generate(&[], prompt, options, cancel, sink).await
    }
}

struct ScriptedEmbeddings {
    script: Arc<Script>,
}

#[async_trait]
impl EmbeddingContext for ScriptedEmbeddings {
    async fn embed(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<f32>, InferenceError> {
        if cancel.is_cancelled() {
            return Err(InferenceError::Cancelled);
        }
        let seed: u32 = text.bytes().map(u32::from).sum();
        Ok((0..self.script.embedding_size)
            .map(|i| (seed.wrapping_mul(i + 1) % 97) as f32 / 97.0)
            .collect())
    }

    async fn dispose(&self) -> Result<(), InferenceError> {
        self.script
            .counters
            .embedding_contexts_disposed
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
