//! llama.cpp-backed model runtime
//!
//! Implements [`ModelRuntime`] on top of llama-cpp-2.
//!
//! # Architecture
//!
//! Since llama-cpp-2 types (`LlamaBackend`, `LlamaModel`, `LlamaContext`) contain
//! raw pointers that are not `Send`, everything llama-cpp runs on a dedicated
//! worker thread. The runtime and its sequence handle communicate with it via
//! channels; each trait call is one request/response round trip.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;

use crate::runtime::{ModelRuntime, RuntimeError, SamplingParams, Sequence, Token, TokenId};

/// Configuration for loading a GGUF model.
#[derive(Debug, Clone)]
pub struct LlamaConfig {
    /// Path to the GGUF model file
    pub model_path: PathBuf,
    /// Number of layers to offload to GPU (0 = CPU only)
    pub gpu_layers: u32,
    /// Context window size; clamped to the model's training context
    pub context_size: u32,
    /// Batch size for prompt evaluation
    pub batch_size: u32,
}

impl LlamaConfig {
    pub fn new<P: AsRef<Path>>(model_path: P) -> Self {
        Self {
            model_path: model_path.as_ref().to_path_buf(),
            gpu_layers: 0,
            context_size: 4096,
            batch_size: 512,
        }
    }
}

/// Model information extracted after loading.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub path: String,
    pub vocab_size: i32,
    pub context_length: u32,
    pub param_count: u64,
}

/// Commands sent to the worker thread
enum WorkerCommand {
    Tokenize {
        text: String,
        reply: Sender<Result<Vec<TokenId>, String>>,
    },
    Detokenize {
        tokens: Vec<TokenId>,
        reply: Sender<Result<String, String>>,
    },
    Begin {
        tokens: Vec<TokenId>,
        params: SamplingParams,
        reply: Sender<Result<(), String>>,
    },
    Step {
        reply: Sender<Result<Option<Token>, String>>,
    },
    Shutdown,
}

/// A [`ModelRuntime`] backed by a llama.cpp model on a worker thread.
pub struct LlamaRuntime {
    command_tx: Sender<WorkerCommand>,
    worker_handle: Option<JoinHandle<()>>,
    info: ModelInfo,
}

impl LlamaRuntime {
    /// Load a GGUF model and spawn its worker thread. Blocks until the
    /// model and context are ready.
    pub fn load(config: LlamaConfig) -> Result<Self, RuntimeError> {
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<ModelInfo, String>>();

        let handle = thread::spawn(move || {
            worker_thread_main(config, command_rx, ready_tx);
        });

        let info = ready_rx
            .recv()
            .map_err(|e| RuntimeError::SequenceCreate(e.to_string()))?
            .map_err(RuntimeError::SequenceCreate)?;

        tracing::info!(
            path = info.path,
            params = info.param_count,
            vocab = info.vocab_size,
            ctx = info.context_length,
            "llama model loaded"
        );

        Ok(Self {
            command_tx,
            worker_handle: Some(handle),
            info,
        })
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }
}

impl ModelRuntime for LlamaRuntime {
    type Seq = LlamaSequence;

    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, RuntimeError> {
        let (reply, rx) = mpsc::channel();
        self.command_tx
            .send(WorkerCommand::Tokenize {
                text: text.to_string(),
                reply,
            })
            .map_err(|e| RuntimeError::Tokenization(e.to_string()))?;
        rx.recv()
            .map_err(|e| RuntimeError::Tokenization(e.to_string()))?
            .map_err(RuntimeError::Tokenization)
    }

    fn detokenize(&self, tokens: &[TokenId]) -> Result<String, RuntimeError> {
        let (reply, rx) = mpsc::channel();
        self.command_tx
            .send(WorkerCommand::Detokenize {
                tokens: tokens.to_vec(),
                reply,
            })
            .map_err(|e| RuntimeError::Detokenization(e.to_string()))?;
        rx.recv()
            .map_err(|e| RuntimeError::Detokenization(e.to_string()))?
            .map_err(RuntimeError::Detokenization)
    }

    fn create_sequence(&mut self) -> Result<Self::Seq, RuntimeError> {
        Ok(LlamaSequence {
            command_tx: self.command_tx.clone(),
        })
    }
}

impl Drop for LlamaRuntime {
    fn drop(&mut self) {
        let _ = self.command_tx.send(WorkerCommand::Shutdown);
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Sequence handle for [`LlamaRuntime`]. The worker holds the actual
/// context and sampler state; this is a channel endpoint.
pub struct LlamaSequence {
    command_tx: Sender<WorkerCommand>,
}

impl Sequence for LlamaSequence {
    fn begin(&mut self, tokens: &[TokenId], params: &SamplingParams) -> Result<(), RuntimeError> {
        let (reply, rx) = mpsc::channel();
        self.command_tx
            .send(WorkerCommand::Begin {
                tokens: tokens.to_vec(),
                params: params.clone(),
                reply,
            })
            .map_err(|e| RuntimeError::Evaluation(e.to_string()))?;
        rx.recv()
            .map_err(|e| RuntimeError::Evaluation(e.to_string()))?
            .map_err(RuntimeError::Evaluation)
    }

    fn next_token(&mut self) -> Result<Option<Token>, RuntimeError> {
        let (reply, rx) = mpsc::channel();
        self.command_tx
            .send(WorkerCommand::Step { reply })
            .map_err(|e| RuntimeError::Evaluation(e.to_string()))?;
        rx.recv()
            .map_err(|e| RuntimeError::Evaluation(e.to_string()))?
            .map_err(RuntimeError::Evaluation)
    }
}

/// In-flight generation state on the worker thread.
struct GenerationState {
    sampler: LlamaSampler,
    n_decoded: i32,
    /// Buffer for handling incomplete UTF-8 sequences
    utf8_buffer: Vec<u8>,
    finished: bool,
}

/// Worker thread main loop
///
/// Owns the LlamaBackend, LlamaModel, and LlamaContext, processes
/// commands from the runtime and sequence handles.
fn worker_thread_main(
    config: LlamaConfig,
    command_rx: Receiver<WorkerCommand>,
    ready_tx: Sender<Result<ModelInfo, String>>,
) {
    let backend = match LlamaBackend::init() {
        Ok(b) => b,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("Failed to init backend: {e}")));
            return;
        }
    };

    let model_params = LlamaModelParams::default().with_n_gpu_layers(config.gpu_layers);
    let model = match LlamaModel::load_from_file(&backend, &config.model_path, &model_params) {
        Ok(m) => m,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("Failed to load model: {e}")));
            return;
        }
    };

    let n_ctx = config.context_size.min(model.n_ctx_train()).max(512);
    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(n_ctx))
        .with_n_batch(config.batch_size);

    let mut ctx = match model.new_context(&backend, ctx_params) {
        Ok(c) => c,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("Failed to create context: {e}")));
            return;
        }
    };

    let info = ModelInfo {
        path: config.model_path.to_string_lossy().to_string(),
        vocab_size: model.n_vocab(),
        context_length: model.n_ctx_train(),
        param_count: model.n_params() as u64,
    };
    if ready_tx.send(Ok(info)).is_err() {
        return;
    }

    let mut batch = LlamaBatch::new(config.batch_size as usize, 1);
    let mut state: Option<GenerationState> = None;
    // Tokens currently sitting in the KV cache, prompt plus whatever
    // has been generated since. Lets the next Begin keep the shared
    // prefix instead of re-decoding it.
    let mut history: Vec<TokenId> = Vec::new();

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Tokenize { text, reply }) => {
                let result = model
                    .str_to_token(&text, AddBos::Always)
                    .map(|tokens| tokens.into_iter().map(|t| t.0).collect())
                    .map_err(|e| e.to_string());
                let _ = reply.send(result);
            }
            Ok(WorkerCommand::Detokenize { tokens, reply }) => {
                let _ = reply.send(detokenize(&model, &tokens));
            }
            Ok(WorkerCommand::Begin {
                tokens,
                params,
                reply,
            }) => {
                let result = begin_generation(&mut ctx, &mut batch, &tokens, &mut history);
                match result {
                    Ok(()) => {
                        state = Some(GenerationState {
                            sampler: build_sampler(&params),
                            n_decoded: tokens.len() as i32,
                            utf8_buffer: Vec::new(),
                            finished: false,
                        });
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        // KV state is unknown after a failed decode.
                        ctx.clear_kv_cache();
                        history.clear();
                        state = None;
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Ok(WorkerCommand::Step { reply }) => {
                let result = match state.as_mut() {
                    Some(gen) => step_generation(&mut ctx, &model, &mut batch, gen, &mut history),
                    None => Err("Step without an active generation".to_string()),
                };
                if result.is_err() {
                    ctx.clear_kv_cache();
                    history.clear();
                    state = None;
                }
                let _ = reply.send(result);
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::debug!("llama worker thread shutting down");
                break;
            }
            Err(_) => {
                // Channel closed, exit
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}

fn detokenize(model: &LlamaModel, tokens: &[TokenId]) -> Result<String, String> {
    let mut bytes = Vec::new();
    for &id in tokens {
        let token_bytes = model
            .token_to_bytes(LlamaToken(id), Special::Tokenize)
            .map_err(|e| e.to_string())?;
        bytes.extend_from_slice(&token_bytes);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// How much of the cached token history the new prompt can keep.
/// Always leaves at least the final prompt token to re-decode so the
/// sampler gets fresh logits.
fn reusable_prefix_len(history: &[TokenId], tokens: &[TokenId]) -> usize {
    let common = history
        .iter()
        .zip(tokens)
        .take_while(|(a, b)| a == b)
        .count();
    common.min(tokens.len().saturating_sub(1))
}

/// Evaluate the prompt, keeping the KV state of whatever prefix it
/// shares with the previous call and decoding only the new suffix.
fn begin_generation(
    ctx: &mut LlamaContext,
    batch: &mut LlamaBatch,
    tokens: &[TokenId],
    history: &mut Vec<TokenId>,
) -> Result<(), String> {
    if tokens.is_empty() {
        return Err("Empty prompt".to_string());
    }

    let reused = reusable_prefix_len(history, tokens);
    if reused == 0 {
        ctx.clear_kv_cache();
    } else {
        // Drop only the positions past the shared prefix.
        ctx.clear_kv_cache_seq(Some(0), Some(reused as u32), None)
            .map_err(|e| format!("Failed to trim kv cache: {e}"))?;
    }
    history.clear();

    batch.clear();
    for (i, &id) in tokens.iter().enumerate().skip(reused) {
        let is_last = i == tokens.len() - 1;
        batch
            .add(LlamaToken(id), i as i32, &[0], is_last)
            .map_err(|e| format!("Failed to add token to batch: {e}"))?;
    }

    ctx.decode(batch)
        .map_err(|e| format!("Failed to decode prompt: {e}"))?;

    history.extend_from_slice(tokens);
    tracing::debug!(
        tokens = tokens.len(),
        reused,
        fresh = tokens.len() - reused,
        "prompt evaluated"
    );
    Ok(())
}

/// Sample one token, decode it, and return its text fragment. The
/// fragment is empty while a multi-byte character is still buffering.
fn step_generation(
    ctx: &mut LlamaContext,
    model: &LlamaModel,
    batch: &mut LlamaBatch,
    gen: &mut GenerationState,
    history: &mut Vec<TokenId>,
) -> Result<Option<Token>, String> {
    if gen.finished {
        return Ok(None);
    }

    let new_token = gen.sampler.sample(ctx, batch.n_tokens() - 1);
    gen.sampler.accept(new_token);

    if model.is_eog_token(new_token) {
        gen.finished = true;
        // Flush any remaining valid UTF-8 as a final fragment.
        if !gen.utf8_buffer.is_empty() {
            let text = String::from_utf8_lossy(&gen.utf8_buffer).into_owned();
            gen.utf8_buffer.clear();
            if !text.is_empty() {
                return Ok(Some(Token {
                    id: new_token.0,
                    text,
                }));
            }
        }
        return Ok(None);
    }

    let token_bytes = model
        .token_to_bytes(new_token, Special::Tokenize)
        .map_err(|e| format!("Failed to convert token to bytes: {e}"))?;
    gen.utf8_buffer.extend_from_slice(&token_bytes);

    // Emit the longest valid UTF-8 prefix, keeping the incomplete
    // suffix buffered for the next step.
    let mut text = String::new();
    let mut valid_len = 0;
    for i in (1..=gen.utf8_buffer.len()).rev() {
        if let Ok(s) = std::str::from_utf8(&gen.utf8_buffer[..i]) {
            text = s.to_string();
            valid_len = i;
            break;
        }
    }
    if valid_len > 0 {
        gen.utf8_buffer.drain(..valid_len);
    }

    batch.clear();
    batch
        .add(new_token, gen.n_decoded, &[0], true)
        .map_err(|e| format!("Failed to add token to batch: {e}"))?;
    ctx.decode(batch)
        .map_err(|e| format!("Failed to decode: {e}"))?;
    gen.n_decoded += 1;
    history.push(new_token.0);

    Ok(Some(Token {
        id: new_token.0,
        text,
    }))
}

fn build_sampler(params: &SamplingParams) -> LlamaSampler {
    let seed = if params.seed == 0 {
        rand_seed()
    } else {
        params.seed
    };

    if params.temperature < 0.01 {
        // Use greedy sampling for very low temperature
        LlamaSampler::greedy()
    } else {
        LlamaSampler::chain_simple([
            LlamaSampler::penalties(64, params.repeat_penalty, 0.0, 0.0),
            LlamaSampler::top_k(params.top_k as i32),
            LlamaSampler::top_p(params.top_p, 1),
            LlamaSampler::temp(params.temperature),
            LlamaSampler::dist(seed),
        ])
    }
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = LlamaConfig::new("/models/test.gguf");
        assert_eq!(config.gpu_layers, 0);
        assert_eq!(config.context_size, 4096);
        assert_eq!(config.batch_size, 512);
    }

    #[test]
    fn test_load_missing_model_fails() {
        let config = LlamaConfig::new("/nonexistent/model.gguf");
        assert!(LlamaRuntime::load(config).is_err());
    }

    #[test]
    fn test_reuse_keeps_shared_prefix() {
        // Same context, different tail: only the tail is re-decoded.
        assert_eq!(reusable_prefix_len(&[1, 2, 3, 4], &[1, 2, 3, 9, 10]), 3);
        // Divergence at the start keeps nothing.
        assert_eq!(reusable_prefix_len(&[1, 2, 3], &[7, 2, 3]), 0);
        // Cold start keeps nothing.
        assert_eq!(reusable_prefix_len(&[], &[1, 2, 3]), 0);
    }

    #[test]
    fn test_reuse_always_redecodes_last_prompt_token() {
        // Identical prompt, or a prompt that is a prefix of the
        // history: the final token still needs fresh logits.
        assert_eq!(reusable_prefix_len(&[1, 2, 3], &[1, 2, 3]), 2);
        assert_eq!(reusable_prefix_len(&[1, 2, 3, 4, 5], &[1, 2, 3]), 2);
        assert_eq!(reusable_prefix_len(&[1], &[1]), 0);
    }
}
