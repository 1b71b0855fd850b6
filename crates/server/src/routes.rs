use std::collections::BTreeMap;

use rocket::{Route, State, serde::json::Json, tokio};

use crate::{
    error::ApiError,
    generation::generate_async,
    models::{HealthResponse, IndexResponse, StatusResponse, VisionRequest, VisionResponse},
    state::AppState,
};

#[get("/")]
pub fn index() -> Json<IndexResponse> {
    Json(IndexResponse {
        name: "Gemma VLM API",
        version: env!("CARGO_PKG_VERSION"),
        endpoints: BTreeMap::from([
            ("health", "/api/health"),
            ("status", "/api/status"),
            ("vision", "/api/vision/infer"),
        ]),
    })
}

#[get("/health")]
pub fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".into(),
    })
}

#[get("/status")]
pub async fn status(state: &State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let slot = state.slot.clone();
    let status = tokio::task::spawn_blocking(move || {
        slot.lock()
            .map(|guard| guard.status())
            .map_err(|_| ApiError::Internal("model lock poisoned".into()))
    })
    .await
    .map_err(|err| ApiError::Internal(format!("status task failed: {err}")))??;
    Ok(Json(BTreeMap::from([(status.model_id.clone(), status)])))
}

#[post("/vision/infer", format = "json", data = "<req>")]
pub async fn vision_infer(
    state: &State<AppState>,
    req: Json<VisionRequest>,
) -> Result<Json<VisionResponse>, ApiError> {
    let VisionRequest {
        prompt,
        image_base64,
        max_new_tokens,
        temperature,
    } = req.into_inner();
    let params = state.defaults.resolve(max_new_tokens, temperature);
    let output = generate_async(state.slot.clone(), prompt, image_base64, params).await?;
    Ok(Json(VisionResponse {
        tokens_generated: output.tokens_generated(),
        finish_reason: output.finish_reason(),
        response: output.text,
    }))
}

pub fn root_routes() -> Vec<Route> {
    routes![index]
}

pub fn api_routes() -> Vec<Route> {
    routes![health, status, vision_infer]
}
