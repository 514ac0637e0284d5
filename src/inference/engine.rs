//! Completion engine
//!
//! The generation loop controller: pulls tokens one at a time from a
//! [`ModelRuntime`] sequence, enforces limits (max tokens, max lines,
//! stop sequences, cancellation), feeds the repetition guard, and runs
//! the FIM sanitizer over the finished text.
//!
//! # Concurrency
//!
//! One generation call is active per engine instance at a time: all
//! mutable state sits behind a single `tokio::sync::Mutex`, so
//! concurrent callers queue on the lock instead of busy-polling a
//! flag. The long-lived sequence handle is only ever touched inside
//! the locked region. Token pulls are the cancellation points, so a
//! cancelled call exits within one token's evaluation latency.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;

use crate::cache::{BoundedCache, CacheConfig, CacheStats, PrefixCache, PrefixCacheStats};
use crate::inference::repetition::{GuardConfig, RepetitionGuard};
use crate::inference::sanitizer::sanitize;
use crate::runtime::{ModelRuntime, SamplingParams, Sequence, TokenId};
use crate::truncate_str;

/// Errors that end a generation call. Everything else (cancellation,
/// guard stops, zero tokens) resolves to a normal string result: "the
/// model said something, possibly truncated" is always a valid
/// outcome, "the model could not be asked" is the only true failure.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("No model runtime loaded")]
    NotLoaded,

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Evaluation failed: {0}")]
    Evaluation(String),
}

/// Engine-level configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub guard: GuardConfig,
    /// Bound on the prompt prefix cache.
    pub prefix_cache_size: usize,
    /// When set, finished completions are cached keyed by prompt.
    pub completion_cache: Option<CacheConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            guard: GuardConfig::default(),
            prefix_cache_size: crate::cache::DEFAULT_MAX_PREFIX_ENTRIES,
            completion_cache: None,
        }
    }
}

/// Cooperative cancellation handle, checked once per pulled token.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Streaming callback: `(new_fragment, total_tokens_so_far)`.
pub type TokenCallback = Box<dyn FnMut(&str, u32) + Send>;

/// One completion request.
pub struct GenerationRequest {
    pub prompt: String,
    pub params: SamplingParams,
    pub cancel: Option<CancelFlag>,
    pub on_token: Option<TokenCallback>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            params: SamplingParams::default(),
            cancel: None,
            on_token: None,
        }
    }

    pub fn with_params(mut self, params: SamplingParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_callback(mut self, callback: TokenCallback) -> Self {
        self.on_token = Some(callback);
        self
    }
}

/// Per-call accumulation state. Created when a call begins, discarded
/// when it returns; success, cancellation, and guard stops all flow
/// through the same sanitize-and-return path.
struct GenerationState {
    completion: String,
    /// Text since the last newline.
    partial: String,
    tokens_generated: u32,
    newlines: u32,
}

impl GenerationState {
    fn new() -> Self {
        Self {
            completion: String::new(),
            partial: String::new(),
            tokens_generated: 0,
            newlines: 0,
        }
    }

    /// Append a decoded fragment, returning any lines it completed.
    fn append(&mut self, fragment: &str) -> Vec<String> {
        self.completion.push_str(fragment);
        self.partial.push_str(fragment);

        let mut completed = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            completed.push(self.partial[..pos].to_string());
            self.partial.drain(..=pos);
            self.newlines += 1;
        }
        completed
    }
}

struct EngineInner<R: ModelRuntime> {
    runtime: Option<R>,
    /// Long-lived sequence handle. Lazily created, kept across calls
    /// so the runtime can reuse KV state, disposed only when an
    /// evaluation error leaves it in an unknown state.
    sequence: Option<R::Seq>,
    prefix_cache: PrefixCache,
    completion_cache: Option<BoundedCache<String, String>>,
}

/// Streaming code-completion engine over a pluggable model runtime.
pub struct CompletionEngine<R: ModelRuntime> {
    config: EngineConfig,
    inner: Mutex<EngineInner<R>>,
}

impl<R: ModelRuntime> CompletionEngine<R> {
    pub fn new(config: EngineConfig) -> Self {
        let completion_cache = config.completion_cache.clone().map(BoundedCache::new);
        let prefix_cache = PrefixCache::new(config.prefix_cache_size);
        Self {
            config,
            inner: Mutex::new(EngineInner {
                runtime: None,
                sequence: None,
                prefix_cache,
                completion_cache,
            }),
        }
    }

    /// Attach a loaded model runtime. Replaces any previous one and
    /// drops its sequence handle.
    pub async fn load(&self, runtime: R) {
        let mut inner = self.inner.lock().await;
        inner.runtime = Some(runtime);
        inner.sequence = None;
        tracing::info!("model runtime attached");
    }

    pub async fn unload(&self) {
        let mut inner = self.inner.lock().await;
        inner.runtime = None;
        inner.sequence = None;
        tracing::info!("model runtime detached");
    }

    pub async fn is_loaded(&self) -> bool {
        self.inner.lock().await.runtime.is_some()
    }

    /// Run one completion. Concurrent calls queue on the engine lock.
    pub async fn generate(&self, mut request: GenerationRequest) -> Result<String, EngineError> {
        let mut inner = self.inner.lock().await;
        inner.generate_locked(&self.config, &mut request)
    }

    /// Pre-seed the prefix cache with an externally tokenized prompt.
    pub async fn cache_prefix(&self, prompt: &str, tokens: Vec<TokenId>) {
        self.inner
            .lock()
            .await
            .prefix_cache
            .cache_prefix(prompt, tokens);
    }

    pub async fn get_cached_prefix(&self, prompt: &str) -> Option<Vec<TokenId>> {
        self.inner
            .lock()
            .await
            .prefix_cache
            .get(prompt)
            .map(<[TokenId]>::to_vec)
    }

    pub async fn clear_prefix_cache(&self) {
        self.inner.lock().await.prefix_cache.clear();
    }

    pub async fn prefix_cache_stats(&self) -> PrefixCacheStats {
        self.inner.lock().await.prefix_cache.stats()
    }

    /// Stats for the completion-result cache, if one is configured.
    pub async fn completion_cache_stats(&self) -> Option<CacheStats> {
        self.inner
            .lock()
            .await
            .completion_cache
            .as_ref()
            .map(BoundedCache::stats)
    }
}

impl<R: ModelRuntime> EngineInner<R> {
    fn generate_locked(
        &mut self,
        config: &EngineConfig,
        request: &mut GenerationRequest,
    ) -> Result<String, EngineError> {
        if self.runtime.is_none() {
            return Err(EngineError::NotLoaded);
        }

        let mut params = request.params.clone();
        params.validate();
        let prompt = normalize_prompt(&request.prompt);

        if let Some(cache) = self.completion_cache.as_mut() {
            if let Some(hit) = cache.get(&prompt) {
                tracing::debug!(prompt = truncate_str(&prompt, 64), "completion cache hit");
                return Ok(hit.clone());
            }
        }

        let cached_tokens = self.prefix_cache.get(&prompt).map(<[TokenId]>::to_vec);
        let prompt_tokens = match cached_tokens {
            Some(tokens) => tokens,
            None => {
                let runtime = self.runtime.as_ref().ok_or(EngineError::NotLoaded)?;
                let tokens = runtime
                    .tokenize(&prompt)
                    .map_err(|e| EngineError::Tokenization(e.to_string()))?;
                self.prefix_cache.cache_prefix(&prompt, tokens.clone());
                tokens
            }
        };
        tracing::debug!(tokens = prompt_tokens.len(), "prompt tokenized");

        if self.sequence.is_none() {
            let runtime = self.runtime.as_mut().ok_or(EngineError::NotLoaded)?;
            let sequence = runtime
                .create_sequence()
                .map_err(|e| EngineError::Evaluation(e.to_string()))?;
            self.sequence = Some(sequence);
            tracing::debug!("created model sequence");
        }

        if let Err(e) = self
            .sequence
            .as_mut()
            .ok_or(EngineError::NotLoaded)?
            .begin(&prompt_tokens, &params)
        {
            // Unknown sequence state; force a clean one next call.
            self.sequence = None;
            return Err(EngineError::Evaluation(e.to_string()));
        }

        let mut state = GenerationState::new();
        let mut guard = RepetitionGuard::new(config.guard.clone());

        'generation: loop {
            if request.cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
                tracing::debug!("generation cancelled by caller");
                break;
            }
            if state.tokens_generated >= params.max_tokens {
                tracing::debug!(max_tokens = params.max_tokens, "token limit reached");
                break;
            }

            let next = self
                .sequence
                .as_mut()
                .ok_or(EngineError::NotLoaded)?
                .next_token();
            let token = match next {
                Ok(Some(token)) => token,
                Ok(None) => {
                    tracing::debug!("end of stream");
                    break;
                }
                Err(e) => {
                    // Unknown sequence state; force a clean one next call.
                    self.sequence = None;
                    return Err(EngineError::Evaluation(e.to_string()));
                }
            };

            state.tokens_generated += 1;
            let completed_lines = state.append(&token.text);

            for line in &completed_lines {
                if let Some(reason) = guard.on_line(line, &state.completion) {
                    tracing::debug!(?reason, "repetition guard stopped generation");
                    break 'generation;
                }
            }
            if state.newlines >= params.max_lines {
                tracing::debug!(max_lines = params.max_lines, "line limit reached");
                break;
            }
            if let Some(reason) = guard.on_token(&state.completion) {
                tracing::debug!(?reason, "repetition guard stopped generation");
                break;
            }

            if let Some(stop_at) =
                find_stop(&state.completion, token.text.len(), &params.stop_sequences)
            {
                state.completion.truncate(stop_at);
                tracing::debug!("stop sequence reached");
                break;
            }

            if let Some(callback) = request.on_token.as_mut() {
                callback(&token.text, state.tokens_generated);
            }
        }

        if state.tokens_generated == 0 {
            tracing::warn!(prompt = truncate_str(&prompt, 80), "model produced no tokens");
        }

        let result = sanitize(&state.completion);
        tracing::debug!(
            tokens = state.tokens_generated,
            chars = result.len(),
            "generation finished"
        );

        if let Some(cache) = self.completion_cache.as_mut() {
            cache.set(prompt, result.clone());
        }
        Ok(result)
    }
}

/// Normalize prompt line endings so prefix-cache keys and tokenization
/// are stable across hosts. Trailing context is preserved: a prompt
/// ending mid-line must stay that way.
fn normalize_prompt(prompt: &str) -> String {
    prompt.replace("\r\n", "\n").replace('\r', "\n")
}

/// Earliest stop-sequence occurrence, searched only over the freshly
/// appended tail (plus enough overlap for sequences spanning
/// fragments) so the scan stays O(fragment), not O(completion).
fn find_stop(completion: &str, fragment_len: usize, stops: &[String]) -> Option<usize> {
    let max_stop = stops.iter().map(String::len).max()?;
    if max_stop == 0 {
        return None;
    }

    let mut start = completion.len().saturating_sub(fragment_len + max_stop);
    while start > 0 && !completion.is_char_boundary(start) {
        start -= 1;
    }
    let haystack = &completion[start..];

    stops
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| haystack.find(s.as_str()))
        .min()
        .map(|idx| start + idx)
}
