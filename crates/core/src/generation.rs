use std::time::{Duration, Instant};

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{info, trace};

use crate::{
    backend::{InferenceBackend, TEXT_DECODER, invoke},
    error::{GenerateError, GenerateResult, Phase},
    fusion::embed_tokens,
    metadata::ModelMetadata,
    sampling::{SamplingMode, last_position_logits, sample_token},
};

/// Called after every generated token with the running count and all tokens so far.
pub type ProgressCallback<'a> = &'a dyn Fn(usize, &[u32]);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeParameters {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub seed: Option<u64>,
}

impl Default for DecodeParameters {
    fn default() -> Self {
        Self {
            max_new_tokens: 100,
            temperature: 0.0,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// A stop token was produced.
    Stop,
    /// `max_new_tokens` reached.
    Length,
    /// The next position would fall outside the context window.
    ContextFull,
}

/// Mutable record for one generation call.
#[derive(Debug)]
pub struct GenerationState {
    pub position: usize,
    pub generated_tokens: Vec<u32>,
    pub stopped: bool,
}

impl GenerationState {
    fn new() -> Self {
        Self {
            position: 0,
            generated_tokens: Vec::new(),
            stopped: false,
        }
    }

    fn push(&mut self, token: u32, metadata: &ModelMetadata) {
        self.generated_tokens.push(token);
        self.stopped = metadata.is_stop_token(token);
    }

    /// The reason to leave the loop now, if any.
    fn finish_reason(&self, params: &DecodeParameters, max_seq_len: usize) -> Option<FinishReason> {
        if self.stopped {
            Some(FinishReason::Stop)
        } else if self.generated_tokens.len() >= params.max_new_tokens {
            Some(FinishReason::Length)
        } else if self.position >= max_seq_len {
            Some(FinishReason::ContextFull)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecodeOutcome {
    /// Every sampled token, including a trailing stop token.
    pub generated_tokens: Vec<u32>,
    pub prompt_tokens: usize,
    pub finish_reason: FinishReason,
    pub prefill_time: Duration,
    pub decode_time: Duration,
}

impl DecodeOutcome {
    pub(crate) fn empty(prompt_tokens: usize) -> Self {
        Self {
            generated_tokens: Vec::new(),
            prompt_tokens,
            finish_reason: FinishReason::Length,
            prefill_time: Duration::ZERO,
            decode_time: Duration::ZERO,
        }
    }

    pub fn tokens_generated(&self) -> usize {
        self.generated_tokens.len()
    }

    /// Tokens that belong in the response text: everything before the stop token.
    pub fn response_tokens(&self) -> &[u32] {
        match self.finish_reason {
            FinishReason::Stop => {
                &self.generated_tokens[..self.generated_tokens.len().saturating_sub(1)]
            }
            FinishReason::Length | FinishReason::ContextFull => &self.generated_tokens,
        }
    }

    /// Throughput of the incremental phase; the prefill token is excluded.
    pub fn decode_tokens_per_second(&self) -> Option<f64> {
        let steps = self.generated_tokens.len().checked_sub(1)?;
        let secs = self.decode_time.as_secs_f64();
        (steps > 0 && secs > 0.0).then(|| steps as f64 / secs)
    }
}

/// Runs prefill over `embeddings` (`[1, N, H]`) followed by single-token
/// decode steps at positions `N, N + 1, ...` until a stop token, the token
/// budget or the context window ends generation.
///
/// Any backend failure aborts the call; no partial output is returned.
pub fn run_decode_loop<B: InferenceBackend + ?Sized>(
    backend: &mut B,
    metadata: &ModelMetadata,
    embeddings: &Tensor,
    params: &DecodeParameters,
    rng: &mut StdRng,
    progress: Option<ProgressCallback<'_>>,
) -> GenerateResult<DecodeOutcome> {
    let mode = SamplingMode::from_temperature(params.temperature)?;
    let (_, prompt_len, _) = embeddings
        .dims3()
        .map_err(|err| GenerateError::backend(Phase::Prefill, TEXT_DECODER, err.into()))?;
    if prompt_len == 0 {
        return Err(GenerateError::PromptAssembly("prompt is empty".into()));
    }
    if prompt_len > metadata.max_seq_len {
        return Err(GenerateError::ContextOverflow {
            tokens: prompt_len,
            max_seq_len: metadata.max_seq_len,
        });
    }
    if params.max_new_tokens == 0 {
        return Ok(DecodeOutcome::empty(prompt_len));
    }

    let mut state = GenerationState::new();
    let prefill_start = Instant::now();
    let positions = Tensor::arange(0i64, prompt_len as i64, &Device::Cpu)
        .map_err(|err| GenerateError::backend(Phase::Prefill, TEXT_DECODER, err.into()))?;
    let mut token = decoder_step(backend, Phase::Prefill, embeddings, positions, mode, rng)?;
    state.push(token, metadata);
    state.position = prompt_len;
    let prefill_time = prefill_start.elapsed();
    trace!(token, prompt_len, "Prefill produced first token");
    if let Some(callback) = progress {
        callback(state.generated_tokens.len(), &state.generated_tokens);
    }

    let decode_start = Instant::now();
    let finish_reason = loop {
        if let Some(reason) = state.finish_reason(params, metadata.max_seq_len) {
            break reason;
        }
        let embedding = embed_tokens(backend, Phase::Decode, &[token])?;
        let position = Tensor::new(&[state.position as i64], &Device::Cpu)
            .map_err(|err| GenerateError::backend(Phase::Decode, TEXT_DECODER, err.into()))?;
        token = decoder_step(backend, Phase::Decode, &embedding, position, mode, rng)?;
        trace!(position = state.position, token, "Decode step");
        state.push(token, metadata);
        state.position += 1;
        if let Some(callback) = progress {
            callback(state.generated_tokens.len(), &state.generated_tokens);
        }
    };
    let decode_time = if state.generated_tokens.len() > 1 {
        decode_start.elapsed()
    } else {
        Duration::ZERO
    };

    let outcome = DecodeOutcome {
        generated_tokens: state.generated_tokens,
        prompt_tokens: prompt_len,
        finish_reason,
        prefill_time,
        decode_time,
    };
    info!(
        prompt_tokens = outcome.prompt_tokens,
        generated = outcome.tokens_generated(),
        finish = ?outcome.finish_reason,
        prefill_secs = outcome.prefill_time.as_secs_f64(),
        decode_secs = outcome.decode_time.as_secs_f64(),
        tok_per_sec = outcome.decode_tokens_per_second().unwrap_or_default(),
        "Generation finished"
    );
    Ok(outcome)
}

fn decoder_step<B: InferenceBackend + ?Sized>(
    backend: &mut B,
    phase: Phase,
    embeddings: &Tensor,
    positions: Tensor,
    mode: SamplingMode,
    rng: &mut StdRng,
) -> GenerateResult<u32> {
    let logits = invoke(backend, phase, TEXT_DECODER, &[embeddings.clone(), positions])?;
    let row = last_position_logits(&logits)
        .map_err(|err| GenerateError::backend(phase, TEXT_DECODER, err))?;
    sample_token(&row, mode, rng)
}
