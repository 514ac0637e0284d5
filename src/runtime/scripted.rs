//! Scripted model runtime
//!
//! A deterministic [`ModelRuntime`] that replays a fixed list of text
//! fragments, one per pulled token. Lets the engine, repetition guard,
//! and cancellation paths be exercised without a real model. Supports
//! injecting a mid-stream evaluation failure.

use crate::runtime::{ModelRuntime, RuntimeError, SamplingParams, Sequence, Token, TokenId};

/// Replays `script` fragments as the token stream of every sequence.
#[derive(Debug, Clone)]
pub struct ScriptedRuntime {
    script: Vec<String>,
    fail_after: Option<usize>,
}

impl ScriptedRuntime {
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: fragments.into_iter().map(Into::into).collect(),
            fail_after: None,
        }
    }

    /// Make every sequence fail with an evaluation error once `n`
    /// tokens have been produced.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }
}

impl ModelRuntime for ScriptedRuntime {
    type Seq = ScriptedSequence;

    /// One token per character; ids are the chars' scalar values.
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, RuntimeError> {
        Ok(text.chars().map(|c| c as TokenId).collect())
    }

    fn detokenize(&self, tokens: &[TokenId]) -> Result<String, RuntimeError> {
        tokens
            .iter()
            .map(|&id| {
                u32::try_from(id)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| RuntimeError::Detokenization(format!("invalid token id {id}")))
            })
            .collect()
    }

    fn create_sequence(&mut self) -> Result<Self::Seq, RuntimeError> {
        Ok(ScriptedSequence {
            script: self.script.clone(),
            fail_after: self.fail_after,
            cursor: 0,
        })
    }
}

/// Sequence handle for [`ScriptedRuntime`].
#[derive(Debug)]
pub struct ScriptedSequence {
    script: Vec<String>,
    fail_after: Option<usize>,
    cursor: usize,
}

impl Sequence for ScriptedSequence {
    fn begin(&mut self, _tokens: &[TokenId], _params: &SamplingParams) -> Result<(), RuntimeError> {
        self.cursor = 0;
        Ok(())
    }

    fn next_token(&mut self) -> Result<Option<Token>, RuntimeError> {
        if self.fail_after == Some(self.cursor) {
            return Err(RuntimeError::Evaluation("scripted failure".to_string()));
        }
        match self.script.get(self.cursor) {
            Some(text) => {
                let token = Token {
                    id: self.cursor as TokenId,
                    text: text.clone(),
                };
                self.cursor += 1;
                Ok(Some(token))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replays_script_then_ends() {
        let mut runtime = ScriptedRuntime::new(["foo", "bar"]);
        let mut seq = runtime.create_sequence().unwrap();
        seq.begin(&[], &SamplingParams::default()).unwrap();

        assert_eq!(seq.next_token().unwrap().unwrap().text, "foo");
        assert_eq!(seq.next_token().unwrap().unwrap().text, "bar");
        assert!(seq.next_token().unwrap().is_none());
    }

    #[test]
    fn test_begin_rewinds() {
        let mut runtime = ScriptedRuntime::new(["a"]);
        let mut seq = runtime.create_sequence().unwrap();
        seq.begin(&[], &SamplingParams::default()).unwrap();
        assert!(seq.next_token().unwrap().is_some());
        assert!(seq.next_token().unwrap().is_none());

        seq.begin(&[], &SamplingParams::default()).unwrap();
        assert_eq!(seq.next_token().unwrap().unwrap().text, "a");
    }

    #[test]
    fn test_fail_after() {
        let mut runtime = ScriptedRuntime::new(["a", "b", "c"]).failing_after(2);
        let mut seq = runtime.create_sequence().unwrap();
        seq.begin(&[], &SamplingParams::default()).unwrap();
        assert!(seq.next_token().is_ok());
        assert!(seq.next_token().is_ok());
        assert!(matches!(
            seq.next_token(),
            Err(RuntimeError::Evaluation(_))
        ));
    }

    #[test]
    fn test_tokenize_round_trip() {
        let runtime = ScriptedRuntime::new(Vec::<String>::new());
        let tokens = runtime.tokenize("fn main() {}").unwrap();
        assert_eq!(runtime.detokenize(&tokens).unwrap(), "fn main() {}");
    }
}
