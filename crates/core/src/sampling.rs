use anyhow::{Context, Result, bail, ensure};
use candle_core::{DType, Tensor};
use rand::{
    SeedableRng,
    distributions::{Distribution, WeightedIndex},
    rngs::StdRng,
};

use crate::error::{GenerateError, GenerateResult};

/// Create a deterministic RNG when a seed is provided.
pub fn init_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(value) => StdRng::seed_from_u64(value),
        None => StdRng::from_entropy(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplingMode {
    Greedy,
    Temperature(f64),
}

impl SamplingMode {
    /// `0` selects greedy decoding; negative or non-finite values are rejected.
    pub fn from_temperature(temperature: f64) -> GenerateResult<Self> {
        if !temperature.is_finite() || temperature < 0.0 {
            return Err(GenerateError::InvalidTemperature(temperature));
        }
        if temperature == 0.0 {
            Ok(SamplingMode::Greedy)
        } else {
            Ok(SamplingMode::Temperature(temperature))
        }
    }
}

/// Pick the next token from one row of logits.
pub fn sample_token(logits: &[f32], mode: SamplingMode, rng: &mut StdRng) -> GenerateResult<u32> {
    let best = argmax(logits).ok_or(GenerateError::InvalidLogits)?;
    let chosen = match mode {
        SamplingMode::Greedy => best,
        // An infinite logit holds all of the probability mass.
        SamplingMode::Temperature(_) if logits[best].is_infinite() => best,
        SamplingMode::Temperature(temperature) => {
            sample_from_logits(logits, temperature, rng).unwrap_or(best)
        }
    };
    u32::try_from(chosen).map_err(|_| GenerateError::InvalidLogits)
}

/// Index of the largest logit; the lowest index wins ties. NaN and `-inf`
/// entries never win. `None` when no entry qualifies.
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &value) in values.iter().enumerate() {
        if value.is_nan() || value == f32::NEG_INFINITY {
            continue;
        }
        match best {
            Some((_, current)) if value <= current => {}
            _ => best = Some((idx, value)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// Extracts the logits of the final position from a decoder output shaped
/// `[1, T, V]`, `[T, V]` or `[V]`.
pub fn last_position_logits(logits: &Tensor) -> Result<Vec<f32>> {
    let row = match logits.rank() {
        3 => {
            let (_, seq_len, _) = logits.dims3()?;
            ensure!(seq_len > 0, "decoder returned logits for zero positions");
            logits.get(0)?.get(seq_len - 1)?
        }
        2 => {
            let (seq_len, _) = logits.dims2()?;
            ensure!(seq_len > 0, "decoder returned logits for zero positions");
            logits.get(seq_len - 1)?
        }
        1 => logits.clone(),
        rank => bail!("unexpected logits rank {rank}"),
    };
    row.to_dtype(DType::F32)?
        .to_vec1::<f32>()
        .context("failed to extract logits for token selection")
}

/// Softmax over `logits / temperature` and one categorical draw. The raw
/// maximum is subtracted before scaling so tiny temperatures cannot overflow.
fn sample_from_logits(logits: &[f32], temperature: f64, rng: &mut StdRng) -> Option<usize> {
    let max_logit = logits
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    if !max_logit.is_finite() {
        return None;
    }
    let max_logit = f64::from(max_logit);
    let weights: Vec<f64> = logits
        .iter()
        .map(|&logit| {
            let weight = ((f64::from(logit) - max_logit) / temperature).exp();
            if weight.is_finite() && weight > 0.0 {
                weight
            } else {
                0.0
            }
        })
        .collect();
    let dist = WeightedIndex::new(&weights).ok()?;
    Some(dist.sample(rng))
}
