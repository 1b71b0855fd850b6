use std::fmt;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    conversation::{ConversationTemplate, get_conv_template},
    error::{GenerateError, GenerateResult},
    metadata::ModelMetadata,
    tokenizer::TextTokenizer,
};

/// Marker the Gemma chat template emits where an image belongs.
pub const START_OF_IMAGE: &str = "<start_of_image>";
/// Literal placeholder used when splicing vision tokens by hand.
pub const IMAGE_PLACEHOLDER: &str = "<image>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptStrategy {
    /// Chat template when the tokenizer knows `<start_of_image>`, manual splice otherwise.
    #[default]
    Auto,
    ChatTemplate,
    Manual,
}

impl fmt::Display for PromptStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptStrategy::Auto => f.write_str("auto"),
            PromptStrategy::ChatTemplate => f.write_str("chat_template"),
            PromptStrategy::Manual => f.write_str("manual"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptSettings {
    pub strategy: PromptStrategy,
    pub template: String,
    pub system_prompt: Option<String>,
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self {
            strategy: PromptStrategy::Auto,
            template: "gemma3".into(),
            system_prompt: None,
        }
    }
}

/// Token ids for one request plus the positions reserved for image patches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledPrompt {
    pub tokens: Vec<u32>,
    pub vision_mask: Vec<bool>,
}

impl AssembledPrompt {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn vision_slots(&self) -> usize {
        self.vision_mask.iter().filter(|flag| **flag).count()
    }
}

/// Replaces the first `marker_id` in `tokens` with `count` copies of
/// `vision_token_id`. Fails when the marker does not occur.
pub fn expand_image_marker(
    tokens: &[u32],
    marker_id: u32,
    vision_token_id: u32,
    count: usize,
) -> GenerateResult<Vec<u32>> {
    let position = tokens
        .iter()
        .position(|&id| id == marker_id)
        .ok_or_else(|| {
            GenerateError::PromptAssembly(format!(
                "image supplied but marker token {marker_id} is missing from the prompt"
            ))
        })?;
    let mut expanded = Vec::with_capacity(tokens.len() + count.saturating_sub(1));
    expanded.extend_from_slice(&tokens[..position]);
    expanded.extend(std::iter::repeat(vision_token_id).take(count));
    expanded.extend_from_slice(&tokens[position + 1..]);
    Ok(expanded)
}

/// How a (text, image?) request becomes token ids. Chosen once per loaded model.
#[derive(Debug, Clone)]
pub enum PromptAssembler {
    /// Render `<start_of_image>` through the template, then expand its id.
    ChatTemplate {
        template: ConversationTemplate,
        start_of_image_id: u32,
    },
    /// Render `<image>`, tokenize around it and splice vision ids in between.
    ManualSplice { template: ConversationTemplate },
}

impl PromptAssembler {
    pub fn select(settings: &PromptSettings, tokenizer: &dyn TextTokenizer) -> Result<Self> {
        let mut template = get_conv_template(&settings.template)
            .with_context(|| format!("unknown conversation template `{}`", settings.template))?;
        if let Some(system) = settings.system_prompt.as_deref() {
            template.set_system_message(system);
        }
        template.reset_messages();

        let start_of_image_id = tokenizer.token_to_id(START_OF_IMAGE);
        let assembler = match (settings.strategy, start_of_image_id) {
            (PromptStrategy::Manual, _) | (PromptStrategy::Auto, None) => {
                PromptAssembler::ManualSplice { template }
            }
            (PromptStrategy::Auto | PromptStrategy::ChatTemplate, Some(start_of_image_id)) => {
                PromptAssembler::ChatTemplate {
                    template,
                    start_of_image_id,
                }
            }
            (PromptStrategy::ChatTemplate, None) => {
                bail!("chat template prompts need a `{START_OF_IMAGE}` token in the vocabulary")
            }
        };
        debug!(
            strategy = %assembler.strategy(),
            template = %settings.template,
            "Selected prompt assembler"
        );
        Ok(assembler)
    }

    /// The concrete strategy in use, never `Auto`.
    pub fn strategy(&self) -> PromptStrategy {
        match self {
            PromptAssembler::ChatTemplate { .. } => PromptStrategy::ChatTemplate,
            PromptAssembler::ManualSplice { .. } => PromptStrategy::Manual,
        }
    }

    pub fn assemble(
        &self,
        tokenizer: &dyn TextTokenizer,
        metadata: &ModelMetadata,
        prompt: &str,
        has_image: bool,
    ) -> GenerateResult<AssembledPrompt> {
        let tokens = match (self, has_image) {
            (PromptAssembler::ChatTemplate { template, .. }, false)
            | (PromptAssembler::ManualSplice { template }, false) => {
                encode(tokenizer, &render(template, prompt), true)?
            }
            (
                PromptAssembler::ChatTemplate {
                    template,
                    start_of_image_id,
                },
                true,
            ) => {
                let text = render(template, &format!("{START_OF_IMAGE}{prompt}"));
                let tokens = encode(tokenizer, &text, true)?;
                expand_image_marker(
                    &tokens,
                    *start_of_image_id,
                    metadata.vision_token_id,
                    metadata.image_seq_length,
                )?
            }
            (PromptAssembler::ManualSplice { template }, true) => {
                let text = render(template, &format!("{IMAGE_PLACEHOLDER}{prompt}"));
                let (before, after) = text.split_once(IMAGE_PLACEHOLDER).ok_or_else(|| {
                    GenerateError::PromptAssembly(format!(
                        "template `{}` dropped the {IMAGE_PLACEHOLDER} placeholder",
                        template.name
                    ))
                })?;
                let mut tokens = encode(tokenizer, before, true)?;
                tokens.extend(
                    std::iter::repeat(metadata.vision_token_id).take(metadata.image_seq_length),
                );
                tokens.extend(encode(tokenizer, after, false)?);
                tokens
            }
        };
        let assembled = with_vision_mask(tokens, metadata, has_image)?;
        debug!(
            strategy = %self.strategy(),
            tokens = assembled.len(),
            vision_tokens = assembled.vision_slots(),
            "Assembled prompt"
        );
        Ok(assembled)
    }
}

fn render(template: &ConversationTemplate, content: &str) -> String {
    let mut conversation = template.clone();
    conversation.push_user_turn(content);
    conversation.get_prompt()
}

fn encode(
    tokenizer: &dyn TextTokenizer,
    text: &str,
    add_special_tokens: bool,
) -> GenerateResult<Vec<u32>> {
    tokenizer
        .encode(text, add_special_tokens)
        .map_err(|err| GenerateError::Tokenizer(format!("{err:#}")))
}

fn with_vision_mask(
    tokens: Vec<u32>,
    metadata: &ModelMetadata,
    has_image: bool,
) -> GenerateResult<AssembledPrompt> {
    let vision_mask: Vec<bool> = tokens
        .iter()
        .map(|&id| id == metadata.vision_token_id)
        .collect();
    let slots = vision_mask.iter().filter(|flag| **flag).count();
    let expected = if has_image {
        metadata.image_seq_length
    } else {
        0
    };
    if slots != expected {
        return Err(GenerateError::PromptAssembly(format!(
            "prompt holds {slots} vision placeholder tokens, expected {expected}"
        )));
    }
    Ok(AssembledPrompt {
        tokens,
        vision_mask,
    })
}
