use std::time::Instant;

use base64::Engine;
use gemma_vlm_core::{
    DecodeParameters, GenerateError, GenerationOutput, GenerationRequest,
    vision::decode_image_bytes,
};
use image::DynamicImage;
use rocket::tokio;
use tracing::{info, warn};

use crate::{error::ApiError, state::SharedSlot};

/// Runs one request on the blocking pool; the slot mutex serializes access to
/// the single loaded program.
pub async fn generate_async(
    slot: SharedSlot,
    prompt: String,
    image_payload: Option<String>,
    params: DecodeParameters,
) -> Result<GenerationOutput, ApiError> {
    let join_result = tokio::task::spawn_blocking(move || {
        generate_blocking(&slot, prompt, image_payload.as_deref(), params)
    })
    .await;

    match join_result {
        Ok(result) => result,
        Err(err) => Err(ApiError::Internal(format!("generation task failed: {err}"))),
    }
}

fn generate_blocking(
    slot: &SharedSlot,
    prompt: String,
    image_payload: Option<&str>,
    params: DecodeParameters,
) -> Result<GenerationOutput, ApiError> {
    let mut guard = slot
        .lock()
        .map_err(|_| ApiError::Internal("model lock poisoned".into()))?;
    if !guard.is_loaded() {
        return Err(GenerateError::NotLoaded.into());
    }

    let mut request = GenerationRequest::new(prompt).with_params(params);
    if let Some(payload) = image_payload.filter(|payload| !payload.trim().is_empty()) {
        request = request.with_image(load_base64_image(payload)?);
    }

    let start = Instant::now();
    let output = guard.generate(&request, None).inspect_err(|err| {
        if !err.is_client_error() {
            warn!(error = %err, "Vision inference failed");
        }
    })?;
    info!(
        tokens = output.tokens_generated(),
        finish = ?output.finish_reason(),
        secs = start.elapsed().as_secs_f64(),
        "Vision request completed"
    );
    Ok(output)
}

/// Accepts bare base64 or a `data:<mime>;base64,<payload>` URL.
pub fn load_base64_image(payload: &str) -> Result<DynamicImage, ApiError> {
    let encoded = match payload.strip_prefix("data:") {
        Some(rest) => {
            let (meta, data) = rest
                .split_once(',')
                .ok_or_else(|| ApiError::BadRequest("malformed data URL".into()))?;
            if !meta.ends_with(";base64") {
                return Err(ApiError::BadRequest(
                    "data URLs must specify base64 encoding".into(),
                ));
            }
            data
        }
        None => payload,
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|err| ApiError::BadRequest(format!("invalid base64 image payload: {err}")))?;
    Ok(decode_image_bytes(&bytes)?)
}
