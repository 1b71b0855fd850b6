use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Phase of the decoding loop a backend call belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Prefill,
    Decode,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Prefill => f.write_str("prefill"),
            Phase::Decode => f.write_str("decode"),
        }
    }
}

/// Errors surfaced by a generation call.
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("prompt assembly failed: {0}")]
    PromptAssembly(String),
    #[error("backend method `{method}` failed during {phase}: {source:#}")]
    BackendInvocation {
        phase: Phase,
        method: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("model is not loaded")]
    NotLoaded,
    #[error("temperature must be finite and non-negative (got {0})")]
    InvalidTemperature(f64),
    #[error("prompt has {tokens} tokens but the context window holds {max_seq_len}")]
    ContextOverflow { tokens: usize, max_seq_len: usize },
    #[error("logits row has no finite values")]
    InvalidLogits,
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("image error: {0}")]
    Image(String),
}

impl GenerateError {
    pub(crate) fn backend(phase: Phase, method: &str, source: anyhow::Error) -> Self {
        GenerateError::BackendInvocation {
            phase,
            method: method.to_owned(),
            source,
        }
    }

    /// True for errors caused by the request rather than the model.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            GenerateError::PromptAssembly(_)
                | GenerateError::InvalidTemperature(_)
                | GenerateError::ContextOverflow { .. }
                | GenerateError::Image(_)
        )
    }
}

pub type GenerateResult<T> = std::result::Result<T, GenerateError>;
