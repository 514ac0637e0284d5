//! codefill
//!
//! Streaming code-completion engine for local LLMs: a pull-based
//! generation loop with repetition guarding, fill-in-the-middle (FIM)
//! control-token sanitization, and bounded prompt/completion caches.
//!
//! The model backend is pluggable through
//! [`runtime::ModelRuntime`]; a llama.cpp implementation is available
//! behind the `llama` feature, and [`runtime::ScriptedRuntime`]
//! replays canned fragments for tests.

pub mod cache;
pub mod inference;
pub mod runtime;

pub use cache::{BoundedCache, CacheConfig, CacheStats, EvictionStrategy, PrefixCache};
pub use inference::{
    sanitize, CancelFlag, CompletionEngine, EngineConfig, EngineError, GenerationRequest,
    GuardConfig, RepetitionGuard, StopReason,
};
pub use runtime::{ModelRuntime, SamplingParams, Sequence, Token, TokenId};

/// Safely truncate a string at a char boundary, never panics.
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    // Walk backwards from max_bytes to find a valid char boundary
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
