use std::sync::Arc;

use anyhow::{Result, ensure};
use image::DynamicImage;
use tracing::{debug, info};

use crate::{
    backend::{InferenceBackend, TEXT_DECODER, TOKEN_EMBEDDING, VISION_ENCODER},
    error::{GenerateError, GenerateResult},
    fusion::fuse,
    generation::{
        DecodeOutcome, DecodeParameters, FinishReason, ProgressCallback, run_decode_loop,
    },
    metadata::ModelMetadata,
    prompt::{PromptAssembler, PromptSettings},
    sampling::{SamplingMode, init_rng},
    streaming::TextStreamer,
    tokenizer::TextTokenizer,
    vision::preprocess_image,
};

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub image: Option<DynamicImage>,
    pub params: DecodeParameters,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            image: None,
            params: DecodeParameters::default(),
        }
    }

    pub fn with_image(mut self, image: DynamicImage) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_params(mut self, params: DecodeParameters) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub text: String,
    pub outcome: DecodeOutcome,
}

impl GenerationOutput {
    /// Every sampled token counts, the stop token included.
    pub fn tokens_generated(&self) -> usize {
        self.outcome.tokens_generated()
    }

    pub fn finish_reason(&self) -> FinishReason {
        self.outcome.finish_reason
    }
}

/// A loaded program plus everything resolved for it at load time.
pub struct VisionLanguageRunner<B> {
    backend: B,
    tokenizer: Arc<dyn TextTokenizer>,
    metadata: ModelMetadata,
    assembler: PromptAssembler,
}

impl<B: InferenceBackend> VisionLanguageRunner<B> {
    pub fn new(
        mut backend: B,
        tokenizer: Arc<dyn TextTokenizer>,
        prompt: &PromptSettings,
    ) -> Result<Self> {
        let methods = backend.method_names();
        debug!(?methods, "Program methods");
        for required in [TOKEN_EMBEDDING, TEXT_DECODER] {
            ensure!(
                backend.has_method(required),
                "program does not export the `{required}` method"
            );
        }
        if !backend.has_method(VISION_ENCODER) {
            info!("Program has no `{VISION_ENCODER}` method; image requests will fail");
        }
        let metadata = ModelMetadata::resolve(&mut backend);
        let assembler = PromptAssembler::select(prompt, tokenizer.as_ref())?;
        info!(strategy = %assembler.strategy(), "Runner ready");
        Ok(Self {
            backend,
            tokenizer,
            metadata,
            assembler,
        })
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn assembler(&self) -> &PromptAssembler {
        &self.assembler
    }

    pub fn tokenizer(&self) -> &dyn TextTokenizer {
        self.tokenizer.as_ref()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Generates a response for `request`. When `echo` is set it receives the
    /// response text incrementally as tokens are produced.
    pub fn generate(
        &mut self,
        request: &GenerationRequest,
        echo: Option<&dyn Fn(&str)>,
    ) -> GenerateResult<GenerationOutput> {
        SamplingMode::from_temperature(request.params.temperature)?;
        let prompt = self.assembler.assemble(
            self.tokenizer.as_ref(),
            &self.metadata,
            &request.prompt,
            request.image.is_some(),
        )?;
        if prompt.len() > self.metadata.max_seq_len {
            return Err(GenerateError::ContextOverflow {
                tokens: prompt.len(),
                max_seq_len: self.metadata.max_seq_len,
            });
        }
        if request.params.max_new_tokens == 0 {
            return Ok(GenerationOutput {
                text: String::new(),
                outcome: DecodeOutcome::empty(prompt.len()),
            });
        }

        let pixel_values = request
            .image
            .as_ref()
            .map(|image| preprocess_image(image, &self.metadata))
            .transpose()
            .map_err(|err| GenerateError::Image(format!("{err:#}")))?;
        let embeddings = fuse(&mut self.backend, &prompt, pixel_values.as_ref())?;

        let mut rng = init_rng(request.params.seed);
        let streamer =
            echo.map(|sink| TextStreamer::new(self.tokenizer.as_ref(), &self.metadata, sink));
        let progress: ProgressCallback<'_> = &|_, tokens| {
            if let Some(streamer) = streamer.as_ref() {
                streamer.on_tokens(tokens);
            }
        };
        let outcome = run_decode_loop(
            &mut self.backend,
            &self.metadata,
            &embeddings,
            &request.params,
            &mut rng,
            Some(progress),
        )?;
        if let Some(streamer) = streamer.as_ref() {
            streamer.finish(outcome.response_tokens());
        }

        let text = self
            .tokenizer
            .decode(outcome.response_tokens(), true)
            .map_err(|err| GenerateError::Tokenizer(format!("{err:#}")))?;
        Ok(GenerationOutput { text, outcome })
    }
}
