use std::collections::BTreeSet;

use candle_core::DType;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::backend::InferenceBackend;

pub const DEFAULT_MAX_SEQ_LEN: usize = 2048;
pub const DEFAULT_EOS_TOKEN_ID: u32 = 1;
pub const DEFAULT_BOS_TOKEN_ID: u32 = 2;
pub const DEFAULT_VISION_TOKEN_ID: u32 = 262_144;
pub const DEFAULT_IMAGE_SEQ_LENGTH: usize = 256;
pub const DEFAULT_IMAGE_SIZE: u32 = 896;
pub const DEFAULT_IMAGE_MEAN: [f32; 3] = [0.5, 0.5, 0.5];
pub const DEFAULT_IMAGE_STD: [f32; 3] = [0.5, 0.5, 0.5];

/// `<end_of_turn>` in the Gemma vocabulary; always a stop token.
pub const END_OF_TURN_ID: u32 = 106;

pub const KEY_MAX_SEQ_LEN: &str = "get_max_seq_len";
pub const KEY_EOS_ID: &str = "get_eos_id";
pub const KEY_BOS_ID: &str = "get_bos_id";
pub const KEY_VISION_TOKEN_ID: &str = "vision_token_id";
pub const KEY_IMAGE_SEQ_LENGTH: &str = "image_seq_length";
pub const KEY_IMAGE_SIZE: &str = "size";
pub const KEY_IMAGE_MEAN: &str = "image_mean";
pub const KEY_IMAGE_STD: &str = "image_std";
pub const KEY_USE_KV_CACHE: &str = "use_kv_cache";

/// Generation configuration exported alongside the program.
///
/// Resolved once when a program is loaded and shared read-only by every
/// generation call made against it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelMetadata {
    pub max_seq_len: usize,
    pub eos_token_id: u32,
    pub bos_token_id: u32,
    pub vision_token_id: u32,
    pub image_seq_length: usize,
    pub image_size: u32,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
    pub use_kv_cache: bool,
    pub stop_token_ids: BTreeSet<u32>,
}

impl Default for ModelMetadata {
    fn default() -> Self {
        Self {
            max_seq_len: DEFAULT_MAX_SEQ_LEN,
            eos_token_id: DEFAULT_EOS_TOKEN_ID,
            bos_token_id: DEFAULT_BOS_TOKEN_ID,
            vision_token_id: DEFAULT_VISION_TOKEN_ID,
            image_seq_length: DEFAULT_IMAGE_SEQ_LENGTH,
            image_size: DEFAULT_IMAGE_SIZE,
            image_mean: DEFAULT_IMAGE_MEAN,
            image_std: DEFAULT_IMAGE_STD,
            use_kv_cache: true,
            stop_token_ids: stop_tokens_for(DEFAULT_EOS_TOKEN_ID),
        }
    }
}

impl ModelMetadata {
    /// Reads every metadata accessor from `backend`, substituting the default
    /// for any key that is absent, failing or malformed. Never fails.
    pub fn resolve<B: InferenceBackend + ?Sized>(backend: &mut B) -> Self {
        let defaults = Self::default();
        let max_seq_len = lookup(backend, KEY_MAX_SEQ_LEN, defaults.max_seq_len, |values| {
            first_count(values).filter(|len| *len > 0)
        });
        let eos_token_id = lookup(backend, KEY_EOS_ID, defaults.eos_token_id, first_id);
        let bos_token_id = lookup(backend, KEY_BOS_ID, defaults.bos_token_id, first_id);
        let vision_token_id = lookup(
            backend,
            KEY_VISION_TOKEN_ID,
            defaults.vision_token_id,
            first_id,
        );
        let image_seq_length = lookup(
            backend,
            KEY_IMAGE_SEQ_LENGTH,
            defaults.image_seq_length,
            first_count,
        );
        let image_size = lookup(backend, KEY_IMAGE_SIZE, defaults.image_size, |values| {
            first_id(values).filter(|size| *size > 0)
        });
        let image_mean = lookup(backend, KEY_IMAGE_MEAN, defaults.image_mean, channels);
        let image_std = lookup(backend, KEY_IMAGE_STD, defaults.image_std, |values| {
            channels(values).filter(|std| std.iter().all(|v| *v > 0.0))
        });
        let use_kv_cache = lookup(backend, KEY_USE_KV_CACHE, defaults.use_kv_cache, |values| {
            values.first().map(|v| *v != 0.0)
        });

        let metadata = Self {
            max_seq_len,
            eos_token_id,
            bos_token_id,
            vision_token_id,
            image_seq_length,
            image_size,
            image_mean,
            image_std,
            use_kv_cache,
            stop_token_ids: stop_tokens_for(eos_token_id),
        };
        info!(
            max_seq_len = metadata.max_seq_len,
            eos = metadata.eos_token_id,
            bos = metadata.bos_token_id,
            vision_token_id = metadata.vision_token_id,
            image_seq_length = metadata.image_seq_length,
            image_size = metadata.image_size,
            "Resolved model metadata"
        );
        metadata
    }

    pub fn is_stop_token(&self, token: u32) -> bool {
        self.stop_token_ids.contains(&token)
    }
}

fn stop_tokens_for(eos: u32) -> BTreeSet<u32> {
    BTreeSet::from([eos, END_OF_TURN_ID])
}

#[derive(Debug, Error)]
enum MetadataUnavailable {
    #[error("accessor is not exported")]
    Missing,
    #[error("accessor failed: {0:#}")]
    Failed(anyhow::Error),
    #[error("accessor returned an unusable value")]
    Malformed,
}

fn lookup<B, T, F>(backend: &mut B, key: &str, default: T, parse: F) -> T
where
    B: InferenceBackend + ?Sized,
    T: std::fmt::Debug,
    F: Fn(&[f64]) -> Option<T>,
{
    let resolved = read_values(backend, key)
        .and_then(|values| parse(&values).ok_or(MetadataUnavailable::Malformed));
    match resolved {
        Ok(value) => value,
        Err(reason) => {
            debug!(key, %reason, fallback = ?default, "Metadata unavailable, using default");
            default
        }
    }
}

fn read_values<B: InferenceBackend + ?Sized>(
    backend: &mut B,
    key: &str,
) -> Result<Vec<f64>, MetadataUnavailable> {
    if !backend.has_method(key) {
        return Err(MetadataUnavailable::Missing);
    }
    let outputs = backend
        .run_method(key, &[])
        .map_err(MetadataUnavailable::Failed)?;
    let tensor = outputs.first().ok_or(MetadataUnavailable::Malformed)?;
    let values = tensor
        .flatten_all()
        .and_then(|flat| flat.to_dtype(DType::F64))
        .and_then(|flat| flat.to_vec1::<f64>())
        .map_err(|err| MetadataUnavailable::Failed(err.into()))?;
    if values.is_empty() {
        return Err(MetadataUnavailable::Malformed);
    }
    Ok(values)
}

fn first_count(values: &[f64]) -> Option<usize> {
    let value = *values.first()?;
    (value.is_finite() && value >= 0.0 && value.fract() == 0.0).then_some(value as usize)
}

fn first_id(values: &[f64]) -> Option<u32> {
    first_count(values).and_then(|value| u32::try_from(value).ok())
}

/// Accepts one value per RGB channel, or a single value for all three.
fn channels(values: &[f64]) -> Option<[f32; 3]> {
    if values.iter().any(|v| !v.is_finite()) {
        return None;
    }
    match values {
        [all] => Some([*all as f32; 3]),
        [r, g, b] => Some([*r as f32, *g as f32, *b as f32]),
        _ => None,
    }
}
