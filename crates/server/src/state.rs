use std::sync::{Arc, Mutex};

use gemma_vlm_config::AppConfig;
use gemma_vlm_core::{DecodeParameters, InferenceBackend, ModelSlot};

pub type DynBackend = Box<dyn InferenceBackend + Send>;
pub type SharedSlot = Arc<Mutex<ModelSlot<DynBackend>>>;

/// Decode settings for request fields left unset by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDefaults {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub seed: Option<u64>,
}

impl RequestDefaults {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_new_tokens: config.server.max_new_tokens,
            temperature: config.server.temperature,
            seed: config.inference.seed,
        }
    }

    pub fn resolve(
        &self,
        max_new_tokens: Option<usize>,
        temperature: Option<f64>,
    ) -> DecodeParameters {
        DecodeParameters {
            max_new_tokens: max_new_tokens.unwrap_or(self.max_new_tokens),
            temperature: temperature.unwrap_or(self.temperature),
            seed: self.seed,
        }
    }
}

pub struct AppState {
    pub slot: SharedSlot,
    pub defaults: RequestDefaults,
}

impl AppState {
    pub fn new(slot: ModelSlot<DynBackend>, defaults: RequestDefaults) -> Self {
        Self {
            slot: Arc::new(Mutex::new(slot)),
            defaults,
        }
    }
}
