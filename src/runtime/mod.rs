//! Model runtime boundary
//!
//! The engine never talks to a concrete model API. It depends on the
//! narrow capability traits defined here: [`ModelRuntime`] for
//! tokenization and sequence creation, [`Sequence`] for pull-based
//! token evaluation. [`scripted::ScriptedRuntime`] is a deterministic
//! in-process implementation for tests and offline use; the `llama`
//! feature provides a llama.cpp-backed one.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod scripted;

#[cfg(feature = "llama")]
pub mod llama;

pub use scripted::ScriptedRuntime;

#[cfg(feature = "llama")]
pub use llama::{LlamaConfig, LlamaRuntime};

/// Token id in the runtime's vocabulary.
pub type TokenId = i32;

/// A sampled token together with its decoded text fragment.
///
/// The fragment may be empty when the runtime is still buffering an
/// incomplete multi-byte character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub id: TokenId,
    pub text: String,
}

/// Errors surfaced by a model runtime.
#[derive(Debug, Error, Clone)]
pub enum RuntimeError {
    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Detokenization failed: {0}")]
    Detokenization(String),

    #[error("Failed to create sequence: {0}")]
    SequenceCreate(String),

    #[error("Evaluation failed: {0}")]
    Evaluation(String),
}

/// Sampling parameters for one generation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Temperature for sampling (0.0 = greedy, higher = more random)
    pub temperature: f32,
    /// Top-p (nucleus) sampling parameter
    pub top_p: f32,
    /// Top-k sampling parameter (0 = disabled)
    pub top_k: u32,
    /// Repetition penalty (1.0 = no penalty)
    pub repeat_penalty: f32,
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// Substrings that end generation when they appear in the completion
    #[serde(default)]
    pub stop_sequences: Vec<String>,
    /// Maximum number of completed lines to generate
    pub max_lines: u32,
    /// Random seed for sampling (0 = derive from entropy)
    pub seed: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            top_p: 0.95,
            top_k: 40,
            repeat_penalty: 1.1,
            max_tokens: 256,
            stop_sequences: Vec::new(),
            max_lines: 16,
            seed: 0,
        }
    }
}

impl SamplingParams {
    /// Clamp all parameters into acceptable ranges.
    pub fn validate(&mut self) {
        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);

        if self.top_k == 0 {
            self.top_k = 40;
        }

        if self.repeat_penalty <= 0.0 {
            self.repeat_penalty = 1.1;
        }

        if self.max_tokens == 0 {
            self.max_tokens = 256;
        }

        if self.max_lines == 0 {
            self.max_lines = 16;
        }
    }
}

/// A stateful evaluation handle holding the runtime's attention/KV
/// state. Exactly one is kept alive per engine instance; it persists
/// across calls so related prompts evaluate incrementally.
pub trait Sequence {
    /// Start evaluating a prompt. May be called repeatedly on the same
    /// handle; the runtime is free to reuse whatever KV state it can.
    fn begin(&mut self, tokens: &[TokenId], params: &SamplingParams) -> Result<(), RuntimeError>;

    /// Pull the next sampled token. `Ok(None)` means end of stream.
    fn next_token(&mut self) -> Result<Option<Token>, RuntimeError>;
}

/// Capability interface for a loaded model runtime.
pub trait ModelRuntime {
    type Seq: Sequence;

    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, RuntimeError>;

    fn detokenize(&self, tokens: &[TokenId]) -> Result<String, RuntimeError>;

    fn create_sequence(&mut self) -> Result<Self::Seq, RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampling_params_default() {
        let params = SamplingParams::default();
        assert_eq!(params.max_tokens, 256);
        assert!((params.temperature - 0.2).abs() < 0.001);
        assert_eq!(params.top_k, 40);
        assert!((params.top_p - 0.95).abs() < 0.001);
        assert!(params.stop_sequences.is_empty());
    }

    #[test]
    fn test_sampling_params_validate_clamps() {
        let mut params = SamplingParams {
            temperature: 5.0,
            top_p: 1.5,
            top_k: 0,
            repeat_penalty: -1.0,
            max_tokens: 0,
            max_lines: 0,
            ..SamplingParams::default()
        };
        params.validate();
        assert!((params.temperature - 2.0).abs() < 0.001);
        assert!((params.top_p - 1.0).abs() < 0.001);
        assert_eq!(params.top_k, 40);
        assert!(params.repeat_penalty > 0.0);
        assert_eq!(params.max_tokens, 256);
        assert_eq!(params.max_lines, 16);
    }
}
