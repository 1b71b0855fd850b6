use std::collections::BTreeMap;

use gemma_vlm_core::{FinishReason, ModelStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct VisionRequest {
    pub prompt: String,
    /// Raw base64 or a `data:image/...;base64,` URL.
    #[serde(default)]
    pub image_base64: Option<String>,
    #[serde(default)]
    pub max_new_tokens: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionResponse {
    pub response: String,
    pub tokens_generated: usize,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

/// Status of every served model, keyed by model id.
pub type StatusResponse = BTreeMap<String, ModelStatus>;

#[derive(Debug, Serialize)]
pub struct IndexResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub endpoints: BTreeMap<&'static str, &'static str>,
}
