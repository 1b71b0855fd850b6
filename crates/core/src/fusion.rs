use anyhow::{Context, anyhow, ensure};
use candle_core::{Device, Tensor};
use tracing::debug;

use crate::{
    backend::{InferenceBackend, TOKEN_EMBEDDING, VISION_ENCODER, invoke},
    error::{GenerateError, GenerateResult, Phase},
    prompt::AssembledPrompt,
};

/// Builds the `[1, T]` id tensor the embedding method expects.
pub fn token_id_tensor(tokens: &[u32]) -> candle_core::Result<Tensor> {
    let ids: Vec<i64> = tokens.iter().map(|&id| i64::from(id)).collect();
    Tensor::from_vec(ids, (1, tokens.len()), &Device::Cpu)
}

/// Looks up embeddings for `tokens`, returning `[1, T, H]`.
pub fn embed_tokens<B: InferenceBackend + ?Sized>(
    backend: &mut B,
    phase: Phase,
    tokens: &[u32],
) -> GenerateResult<Tensor> {
    let ids = token_id_tensor(tokens)
        .map_err(|err| GenerateError::backend(phase, TOKEN_EMBEDDING, err.into()))?;
    let embeddings = invoke(backend, phase, TOKEN_EMBEDDING, &[ids])?;
    let (batch, rows, _) = embeddings
        .dims3()
        .map_err(|err| GenerateError::backend(phase, TOKEN_EMBEDDING, err.into()))?;
    if batch != 1 || rows != tokens.len() {
        return Err(GenerateError::backend(
            phase,
            TOKEN_EMBEDDING,
            anyhow!(
                "expected embeddings [1, {}, H], got {:?}",
                tokens.len(),
                embeddings.dims()
            ),
        ));
    }
    Ok(embeddings)
}

/// Writes the first `count(mask)` rows of `vision` into the masked rows of
/// `embeddings`, in order. Unmasked rows are copied through untouched.
///
/// `embeddings` is `[T, H]`, `vision` is `[P, H]` with `P >= count(mask)`.
pub fn overwrite_rows(
    embeddings: &Tensor,
    mask: &[bool],
    vision: &Tensor,
) -> anyhow::Result<Tensor> {
    let (rows, hidden) = embeddings.dims2().context("embeddings must be [T, H]")?;
    let (patches, vision_hidden) = vision.dims2().context("vision rows must be [P, H]")?;
    ensure!(
        mask.len() == rows,
        "mask length {} does not match {rows} embedding rows",
        mask.len()
    );
    ensure!(
        vision_hidden == hidden,
        "vision hidden size {vision_hidden} does not match text hidden size {hidden}"
    );
    let slots = mask.iter().filter(|flag| **flag).count();
    ensure!(
        patches >= slots,
        "vision encoder produced {patches} patch rows for {slots} placeholder tokens"
    );
    if slots == 0 {
        return Ok(embeddings.clone());
    }

    let mut next_patch = rows;
    let gather: Vec<u32> = mask
        .iter()
        .enumerate()
        .map(|(idx, &is_vision)| {
            if is_vision {
                next_patch += 1;
                (next_patch - 1) as u32
            } else {
                idx as u32
            }
        })
        .collect();
    let vision = vision
        .narrow(0, 0, slots)?
        .to_dtype(embeddings.dtype())?
        .to_device(embeddings.device())?;
    let stacked = Tensor::cat(&[embeddings, &vision], 0)?;
    let index = Tensor::from_vec(gather, rows, embeddings.device())?;
    Ok(stacked.index_select(&index, 0)?)
}

/// Embeds the prompt and, when pixels are given, replaces the vision
/// placeholder rows with the encoder's patch embeddings. Returns `[1, T, H]`.
pub fn fuse<B: InferenceBackend + ?Sized>(
    backend: &mut B,
    prompt: &AssembledPrompt,
    pixel_values: Option<&Tensor>,
) -> GenerateResult<Tensor> {
    let slots = prompt.vision_slots();
    match (pixel_values, slots) {
        (None, 0) | (Some(_), 1..) => {}
        (None, _) => {
            return Err(GenerateError::PromptAssembly(format!(
                "prompt reserves {slots} vision slots but no image was supplied"
            )));
        }
        (Some(_), 0) => {
            return Err(GenerateError::PromptAssembly(
                "image supplied but the prompt has no vision placeholder tokens".into(),
            ));
        }
    }

    let embeddings = embed_tokens(backend, Phase::Prefill, &prompt.tokens)?;
    let Some(pixels) = pixel_values else {
        return Ok(embeddings);
    };

    let patches = invoke(backend, Phase::Prefill, VISION_ENCODER, &[pixels.clone()])?;
    debug!(shape = ?patches.dims(), slots, "Vision encoder output");
    merge_patches(&embeddings, &prompt.vision_mask, &patches)
        .map_err(|err| GenerateError::backend(Phase::Prefill, VISION_ENCODER, err))
}

fn merge_patches(embeddings: &Tensor, mask: &[bool], patches: &Tensor) -> anyhow::Result<Tensor> {
    let hidden = *patches
        .dims()
        .last()
        .ok_or_else(|| anyhow!("vision encoder returned a scalar"))?;
    ensure!(hidden > 0, "vision encoder returned an empty hidden dimension");
    let flat = patches.reshape((patches.elem_count() / hidden, hidden))?;
    let fused = overwrite_rows(&embeddings.squeeze(0)?, mask, &flat)?;
    Ok(fused.unsqueeze(0)?)
}
