pub mod backend;
pub mod conversation;
pub mod error;
pub mod fusion;
pub mod generation;
pub mod metadata;
pub mod prompt;
pub mod runner;
pub mod sampling;
pub mod slot;
pub mod streaming;
pub mod tokenizer;
pub mod vision;

pub use backend::{InferenceBackend, MethodTable};
pub use error::{GenerateError, GenerateResult, Phase};
pub use generation::{DecodeOutcome, DecodeParameters, FinishReason};
pub use metadata::ModelMetadata;
pub use prompt::{AssembledPrompt, PromptAssembler, PromptSettings, PromptStrategy};
pub use runner::{GenerationOutput, GenerationRequest, VisionLanguageRunner};
pub use slot::{ModelSlot, ModelStatus};
pub use tokenizer::{TextTokenizer, load_tokenizer};
