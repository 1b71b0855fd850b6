use std::time::Instant;

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use crate::{
    backend::InferenceBackend,
    error::{GenerateError, GenerateResult},
    prompt::PromptStrategy,
    runner::{GenerationOutput, GenerationRequest, VisionLanguageRunner},
};

type Loader<B> = Box<dyn Fn() -> Result<VisionLanguageRunner<B>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStatus {
    pub loaded: bool,
    pub model_id: String,
    pub max_seq_len: Option<usize>,
    pub vision_token_id: Option<u32>,
    pub image_seq_length: Option<usize>,
    pub prompt_strategy: Option<PromptStrategy>,
}

/// Holds at most one loaded runner and knows how to (re)build it.
pub struct ModelSlot<B> {
    model_id: String,
    loader: Loader<B>,
    runner: Option<VisionLanguageRunner<B>>,
}

impl<B: InferenceBackend> ModelSlot<B> {
    pub fn new<F>(model_id: impl Into<String>, loader: F) -> Self
    where
        F: Fn() -> Result<VisionLanguageRunner<B>> + Send + Sync + 'static,
    {
        Self {
            model_id: model_id.into(),
            loader: Box::new(loader),
            runner: None,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn is_loaded(&self) -> bool {
        self.runner.is_some()
    }

    /// Builds the runner unless one is already loaded.
    pub fn load(&mut self) -> Result<()> {
        if self.is_loaded() {
            info!(model = %self.model_id, "Model already loaded");
            return Ok(());
        }
        let start = Instant::now();
        let runner = (self.loader)()?;
        self.runner = Some(runner);
        info!(
            model = %self.model_id,
            secs = start.elapsed().as_secs_f64(),
            "Model loaded"
        );
        Ok(())
    }

    pub fn unload(&mut self) {
        if self.runner.take().is_some() {
            info!(model = %self.model_id, "Model unloaded");
        }
    }

    pub fn runner(&self) -> Option<&VisionLanguageRunner<B>> {
        self.runner.as_ref()
    }

    pub fn status(&self) -> ModelStatus {
        let runner = self.runner.as_ref();
        ModelStatus {
            loaded: runner.is_some(),
            model_id: self.model_id.clone(),
            max_seq_len: runner.map(|r| r.metadata().max_seq_len),
            vision_token_id: runner.map(|r| r.metadata().vision_token_id),
            image_seq_length: runner.map(|r| r.metadata().image_seq_length),
            prompt_strategy: runner.map(|r| r.assembler().strategy()),
        }
    }

    pub fn generate(
        &mut self,
        request: &GenerationRequest,
        echo: Option<&dyn Fn(&str)>,
    ) -> GenerateResult<GenerationOutput> {
        let runner = self.runner.as_mut().ok_or(GenerateError::NotLoaded)?;
        runner.generate(request, echo)
    }
}
