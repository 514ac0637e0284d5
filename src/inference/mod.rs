//! Code-completion inference
//!
//! The generation loop controller plus the two output filters it
//! drives: the repetition guard and the FIM control-token sanitizer.

pub mod engine;
pub mod repetition;
pub mod sanitizer;

// Re-export main types for convenience
pub use engine::{
    CancelFlag, CompletionEngine, EngineConfig, EngineError, GenerationRequest, TokenCallback,
};
pub use repetition::{GuardConfig, RepetitionGuard, StopReason};
pub use sanitizer::sanitize;
