//! llama-cpp-2 plumbing for GGUF models.
//!
//! Everything here is blocking and runs on `spawn_blocking` threads.

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use tokio_util::sync::CancellationToken;

use super::GgufConfig;
use crate::engine::{
    Generation, GenerationOptions, InferenceError, StopReason, TextStreamSender, Token,
};

/// Process-wide llama.cpp backend. Initialized once.
pub(super) struct LlamaRuntime {
    backend: LlamaBackend,
}

// SAFETY: LlamaBackend is Send+Sync in llama-cpp-2.
unsafe impl Send for LlamaRuntime {}
unsafe impl Sync for LlamaRuntime {}

impl LlamaRuntime {
    pub(super) fn init() -> Result<Self, InferenceError> {
        let backend = LlamaBackend::init()
            .map_err(|e| InferenceError::WeightLoad(format!("backend init: {e}")))?;
        Ok(Self { backend })
    }

    pub(super) fn supports_gpu_offload(&self) -> bool {
        self.backend.supports_gpu_offload()
    }

    pub(super) fn supports_mmap(&self) -> bool {
        self.backend.supports_mmap()
    }

    pub(super) fn supports_mlock(&self) -> bool {
        self.backend.supports_mlock()
    }
}

/// A model file opened through llama.cpp.
pub(super) struct LoadedModel {
    runtime: Arc<LlamaRuntime>,
    model: LlamaModel,
}

// SAFETY: LlamaModel is Send+Sync in llama-cpp-2.
unsafe impl Send for LoadedModel {}
unsafe impl Sync for LoadedModel {}

impl LoadedModel {
    pub(super) fn load(
        runtime: Arc<LlamaRuntime>,
        path: &Path,
        n_gpu_layers: u32,
    ) -> Result<Self, String> {
        let params = LlamaModelParams::default().with_n_gpu_layers(n_gpu_layers);
        Self::open(runtime, path, &params)
    }

    /// Header, hyperparameters and vocabulary only. No tensor data is read.
    pub(super) fn load_vocab(runtime: Arc<LlamaRuntime>, path: &Path) -> Result<Self, String> {
        let params = LlamaModelParams::default()
            .with_n_gpu_layers(0)
            .with_vocab_only(true);
        Self::open(runtime, path, &params)
    }

    fn open(runtime: Arc<LlamaRuntime>, path: &Path, params: &LlamaModelParams) -> Result<Self, String> {
        let model = LlamaModel::load_from_file(&runtime.backend, path, params)
            .map_err(|e| format!("{}: {e}", path.display()))?;
        Ok(Self { runtime, model })
    }

    pub(super) fn size_bytes(&self) -> u64 {
        self.model.size()
    }

    pub(super) fn meta(&self, key: &str) -> Option<String> {
        self.model.meta_val_str(key).ok().filter(|v| !v.is_empty())
    }

    pub(super) fn train_context_size(&self) -> u32 {
        self.model.n_ctx_train()
    }

    pub(super) fn embedding_size(&self) -> u32 {
        u32::try_from(self.model.n_embd()).unwrap_or(0)
    }

    pub(super) fn bos(&self) -> Token {
        self.model.token_bos().0 as Token
    }

    pub(super) fn eos(&self) -> Token {
        self.model.token_eos().0 as Token
    }

    pub(super) fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<LlamaToken>, InferenceError> {
        let add_bos = if add_bos { AddBos::Always } else { AddBos::Never };
        self.model
            .str_to_token(text, add_bos)
            .map_err(|e| InferenceError::Tokenization(format!("tokenize: {e}")))
    }

    pub(super) fn detokenize(&self, tokens: &[LlamaToken], special: bool) -> Result<String, InferenceError> {
        let mut dec = encoding_rs::UTF_8.new_decoder();
        let mut out = String::new();
        for &t in tokens {
            let piece = self
                .model
                .token_to_piece(t, &mut dec, special, None)
                .map_err(|e| InferenceError::Tokenization(format!("detok: {e}")))?;
            out.push_str(&piece);
        }
        Ok(out)
    }

    pub(super) fn create_context(
        &self,
        config: &GgufConfig,
        embeddings: bool,
    ) -> Result<LlamaContext<'_>, InferenceError> {
        let n_threads = resolve_threads(config.n_threads);
        let p = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(config.n_ctx))
            .with_n_threads(n_threads)
            .with_n_threads_batch(n_threads)
            .with_embeddings(embeddings);
        self.model
            .new_context(&self.runtime.backend, p)
            .map_err(|e| InferenceError::ContextCreation(format!("ctx: {e}")))
    }

    /// Sample until end-of-generation, a stop sequence, the token limit or
    /// cancellation. Fragments go to `sink` as they are decoded and a closed
    /// sink ends the generation as cancelled.
    ///
    /// `ctx` must come from [`LoadedModel::create_context`] on this model.
    /// Its KV cache is cleared first.
    pub(super) fn generate(
        &self,
        ctx: &mut LlamaContext<'_>,
        prompt: &str,
        options: &GenerationOptions,
        config: &GgufConfig,
        cancel: &CancellationToken,
        sink: &TextStreamSender,
    ) -> Result<Generation, InferenceError> {
        let tokens = self.tokenize(prompt, true)?;
        let room = config.n_ctx.saturating_sub(tokens.len() as u32);
        let max_tok = options.max_tokens.unwrap_or(config.default_max_tokens).min(room);
        let mut sampler = self.build_sampler(options, config.seed)?;

        ctx.clear_kv_cache();
        let mut batch = LlamaBatch::new(tokens.len().max(1), 1);
        add_seq(&mut batch, &tokens)?;
        decode(ctx, &mut batch)?;
        if options.grammar.is_none() {
            // A grammar sampler must only see generated tokens.
            sampler.accept_many(tokens.iter().copied());
        }

        let mut dec = encoding_rs::UTF_8.new_decoder();
        let mut text = String::new();
        let mut pos = tokens.len() as i32;
        for _ in 0..max_tok {
            if cancel.is_cancelled() {
                return Err(InferenceError::Cancelled);
            }
            // Use -1 to sample from the last token that had logits computed
            let tok = sampler.sample(ctx, -1);
            sampler.accept(tok);
            if self.model.is_eog_token(tok) {
                return Ok(Generation {
                    text,
                    stop_reason: StopReason::EndOfGeneration,
                });
            }
            let piece = self
                .model
                .token_to_piece(tok, &mut dec, false, None)
                .map_err(|e| InferenceError::Generation(format!("detok: {e}")))?;

            let start = text.len();
            text.push_str(&piece);
            if let Some(end) = find_stop(&text, &options.stop, start) {
                if end > start {
                    forward(sink, &text[start..end])?;
                }
                text.truncate(end);
                return Ok(Generation {
                    text,
                    stop_reason: StopReason::StopSequence,
                });
            }
            if !piece.is_empty() {
                forward(sink, piece)?;
            }

            batch.clear();
            add_one(&mut batch, tok, pos)?;
            decode(ctx, &mut batch)?;
            pos += 1;
        }
        Ok(Generation {
            text,
            stop_reason: StopReason::MaxTokens,
        })
    }

    fn build_sampler(&self, options: &GenerationOptions, seed: u32) -> Result<LlamaSampler, InferenceError> {
        let mut chain = Vec::new();
        if let Some(grammar) = &options.grammar {
            let gbnf = grammar.to_gbnf()?;
            let sampler = LlamaSampler::grammar(&self.model, &gbnf, "root")
                .map_err(|e| InferenceError::InvalidOptions(format!("grammar: {e}")))?;
            chain.push(sampler);
        }
        if !options.penalties.is_neutral() {
            chain.push(LlamaSampler::penalties(
                64,
                1.0,
                options.penalties.frequency.unwrap_or(0.0),
                options.penalties.presence.unwrap_or(0.0),
            ));
        }
        chain.push(LlamaSampler::top_p(options.top_p.unwrap_or(1.0), 1));
        chain.push(LlamaSampler::temp(options.temperature.unwrap_or(0.8)));
        chain.push(LlamaSampler::dist(seed));
        Ok(LlamaSampler::chain_simple(chain))
    }

    /// Mean-pooled embedding of `text` as computed by llama.cpp, on a
    /// context created for this call.
    pub(super) fn embed(&self, text: &str, config: &GgufConfig) -> Result<Vec<f32>, InferenceError> {
        let tokens = self.tokenize(text, true)?;
        let mut ctx = self.create_context(config, true)?;
        let mut batch = LlamaBatch::new(tokens.len().max(1), 1);
        add_seq(&mut batch, &tokens)?;
        ctx.decode(&mut batch)
            .map_err(|e| InferenceError::Embedding(format!("decode: {e}")))?;
        ctx.embeddings_seq_ith(0)
            .map(|values| values.to_vec())
            .map_err(|e| InferenceError::Embedding(format!("embeddings: {e}")))
    }
}

/// Earliest stop sequence that ends after `from`, as a byte offset.
fn find_stop(text: &str, stops: &[String], from: usize) -> Option<usize> {
    stops
        .iter()
        .filter_map(|stop| {
            let window = from.saturating_sub(stop.len());
            let window = (0..=window).rev().find(|i| text.is_char_boundary(*i)).unwrap_or(0);
            text[window..].find(stop.as_str()).map(|i| window + i)
        })
        .min()
}

fn add_seq(batch: &mut LlamaBatch, tokens: &[LlamaToken]) -> Result<(), InferenceError> {
    // Only the last token needs logits.
    let n = tokens.len();
    for (i, &tok) in tokens.iter().enumerate() {
        batch
            .add(tok, i as i32, &[0], i + 1 == n)
            .map_err(|e| InferenceError::Generation(format!("batch: {e}")))?;
    }
    Ok(())
}

fn add_one(batch: &mut LlamaBatch, tok: LlamaToken, pos: i32) -> Result<(), InferenceError> {
    batch
        .add(tok, pos, &[0], true)
        .map_err(|e| InferenceError::Generation(format!("batch: {e}")))
}

fn decode(ctx: &mut LlamaContext<'_>, batch: &mut LlamaBatch) -> Result<(), InferenceError> {
    ctx.decode(batch)
        .map_err(|e| InferenceError::Generation(format!("decode: {e}")))
}

fn forward(sink: &TextStreamSender, fragment: impl Into<String>) -> Result<(), InferenceError> {
    sink.blocking_send(fragment).map_err(|_| InferenceError::Cancelled)
}

fn resolve_threads(n: u32) -> i32 {
    if n == 0 {
        // Cap at 16 to avoid diminishing returns on high-core systems
        let optimal = num_cpus::get().clamp(1, 16);
        i32::try_from(optimal).unwrap_or(4)
    } else {
        i32::try_from(n).unwrap_or(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_is_found_across_piece_boundary() {
        let text = "hello wor";
        assert_eq!(find_stop(text, &["lo w".into()], 5), Some(3));
        assert_eq!(find_stop(text, &["xyz".into()], 5), None);
    }

    #[test]
    fn closed_sink_cancels_generation() {
        let (sink, stream) = crate::engine::TextStream::new(1);
        drop(stream);
        assert!(matches!(forward(&sink, "x"), Err(InferenceError::Cancelled)));
    }

    #[test]
    fn explicit_thread_count_is_kept() {
        assert_eq!(resolve_threads(6), 6);
        assert!(resolve_threads(0) >= 1);
    }
}
