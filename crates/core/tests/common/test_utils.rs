#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use candle_core::{Device, Tensor};

use gemma_vlm_core::{
    MethodTable, PromptSettings, PromptStrategy, TextTokenizer, VisionLanguageRunner,
    backend::{TEXT_DECODER, TOKEN_EMBEDDING, VISION_ENCODER},
};

pub const HIDDEN: usize = 4;
pub const VOCAB: usize = 1200;
pub const EOS: u32 = 1;
pub const BOS: u32 = 2;
pub const END_OF_TURN: u32 = 106;
pub const START_OF_IMAGE_ID: u32 = 255;
pub const VISION_ID: u32 = 300;
/// Emitted by the scripted decoder once its script runs out.
pub const FILLER: u32 = 7;

const CHAR_BASE: u32 = 1000;

/// Character-level tokenizer with a handful of Gemma-style special tokens.
pub struct StubTokenizer {
    specials: Vec<(&'static str, u32)>,
}

impl StubTokenizer {
    pub fn new() -> Self {
        Self {
            specials: vec![
                ("<start_of_image>", START_OF_IMAGE_ID),
                ("<start_of_turn>", 105),
                ("<end_of_turn>", END_OF_TURN),
                ("<image_soft_token>", VISION_ID),
                ("<bos>", BOS),
                ("<eos>", EOS),
            ],
        }
    }

    pub fn without_start_of_image() -> Self {
        let mut tokenizer = Self::new();
        tokenizer
            .specials
            .retain(|(token, _)| *token != "<start_of_image>");
        tokenizer
    }

    pub fn shared() -> Arc<dyn TextTokenizer> {
        Arc::new(Self::new())
    }
}

impl TextTokenizer for StubTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        if add_special_tokens {
            ids.push(BOS);
        }
        let mut rest = text;
        'outer: while !rest.is_empty() {
            for (token, id) in &self.specials {
                if let Some(remaining) = rest.strip_prefix(token) {
                    ids.push(*id);
                    rest = remaining;
                    continue 'outer;
                }
            }
            let Some(ch) = rest.chars().next() else {
                break;
            };
            ids.push(CHAR_BASE + ch as u32);
            rest = &rest[ch.len_utf8()..];
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        let mut text = String::new();
        for &id in ids {
            if let Some((token, _)) = self.specials.iter().find(|(_, special)| *special == id) {
                if !skip_special_tokens {
                    text.push_str(token);
                }
            } else if id >= CHAR_BASE {
                let ch = char::from_u32(id - CHAR_BASE).ok_or_else(|| anyhow!("bad id {id}"))?;
                text.push(ch);
            } else {
                text.push_str(&format!("[{id}]"));
            }
        }
        Ok(text)
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.specials
            .iter()
            .find(|(special, _)| *special == token)
            .map(|(_, id)| *id)
    }
}

/// What the scripted program saw on each `text_decoder` call.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderCall {
    pub rows: usize,
    pub positions: Vec<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct CallLog {
    methods: Arc<Mutex<Vec<String>>>,
    decoder: Arc<Mutex<Vec<DecoderCall>>>,
}

impl CallLog {
    pub fn methods(&self) -> Vec<String> {
        self.methods.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn decoder_calls(&self) -> Vec<DecoderCall> {
        self.decoder.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Calls to any of the three inference methods, metadata reads excluded.
    pub fn inference_calls(&self) -> usize {
        self.methods()
            .iter()
            .filter(|m| [TOKEN_EMBEDDING, VISION_ENCODER, TEXT_DECODER].contains(&m.as_str()))
            .count()
    }

    fn record(&self, method: &str) {
        if let Ok(mut methods) = self.methods.lock() {
            methods.push(method.to_owned());
        }
    }

    fn record_decoder(&self, call: DecoderCall) {
        if let Ok(mut calls) = self.decoder.lock() {
            calls.push(call);
        }
    }
}

/// Deterministic embedding row for a token id.
pub fn embedding_row(id: u32) -> [f32; HIDDEN] {
    let value = id as f32;
    [value, (id % 7) as f32, 1.0, -value]
}

/// Deterministic vision patch row, distinguishable from any token row.
pub fn patch_row(index: usize) -> [f32; HIDDEN] {
    let value = -10.0 * (index as f32 + 1.0);
    [value, value, value, value]
}

/// Builder for a fake exported program that replays a token script.
#[derive(Debug, Clone)]
pub struct ScriptedModel {
    pub script: Vec<u32>,
    pub max_seq_len: Option<usize>,
    pub image_seq_length: usize,
    pub image_size: u32,
    pub patches: usize,
    pub fail_decoder_call: Option<usize>,
    pub with_metadata: bool,
    /// Logits returned for every position; overrides `script` when set.
    pub fixed_logits: Option<Vec<f32>>,
}

impl ScriptedModel {
    pub fn new(script: Vec<u32>) -> Self {
        Self {
            script,
            max_seq_len: Some(128),
            image_seq_length: 4,
            image_size: 8,
            patches: 4,
            fail_decoder_call: None,
            with_metadata: true,
            fixed_logits: None,
        }
    }

    pub fn build(self) -> (MethodTable, CallLog) {
        let log = CallLog::default();
        let mut table = MethodTable::new();

        let embed_log = log.clone();
        table.insert(TOKEN_EMBEDDING, move |inputs| {
            embed_log.record(TOKEN_EMBEDDING);
            let ids = inputs[0].to_vec2::<i64>()?;
            let row = ids.first().cloned().unwrap_or_default();
            let data: Vec<f32> = row
                .iter()
                .flat_map(|&id| embedding_row(id as u32))
                .collect();
            Ok(vec![Tensor::from_vec(
                data,
                (1, row.len(), HIDDEN),
                &Device::Cpu,
            )?])
        });

        let vision_log = log.clone();
        let patches = self.patches;
        let image_size = self.image_size as usize;
        table.insert(VISION_ENCODER, move |inputs| {
            vision_log.record(VISION_ENCODER);
            let dims = inputs[0].dims().to_vec();
            if dims != [1, 3, image_size, image_size] {
                return Err(anyhow!("unexpected pixel shape {dims:?}"));
            }
            let data: Vec<f32> = (0..patches).flat_map(patch_row).collect();
            Ok(vec![Tensor::from_vec(data, (1, patches, HIDDEN), &Device::Cpu)?])
        });

        let decoder_log = log.clone();
        let script = self.script;
        let fail_at = self.fail_decoder_call;
        let fixed = self.fixed_logits;
        let mut call = 0usize;
        table.insert(TEXT_DECODER, move |inputs| {
            decoder_log.record(TEXT_DECODER);
            let (_, rows, hidden) = inputs[0].dims3()?;
            if hidden != HIDDEN {
                return Err(anyhow!("hidden size {hidden}"));
            }
            let positions = inputs[1].to_vec1::<i64>()?;
            decoder_log.record_decoder(DecoderCall { rows, positions });
            let index = call;
            call += 1;
            if fail_at == Some(index) {
                return Err(anyhow!("decoder exploded on call {index}"));
            }
            let row = match &fixed {
                Some(logits) => logits.clone(),
                None => {
                    let token = script.get(index).copied().unwrap_or(FILLER);
                    let mut logits = vec![0f32; VOCAB];
                    logits[token as usize] = 10.0;
                    logits
                }
            };
            let vocab = row.len();
            let data: Vec<f32> = std::iter::repeat(row).take(rows).flatten().collect();
            Ok(vec![Tensor::from_vec(data, (1, rows, vocab), &Device::Cpu)?])
        });

        if self.with_metadata {
            let scalar = |value: i64| Tensor::new(&[value], &Device::Cpu);
            if let Some(max_seq_len) = self.max_seq_len {
                table = table.with_constant(
                    "get_max_seq_len",
                    scalar(max_seq_len as i64).expect("tensor"),
                );
            }
            table = table
                .with_constant("get_eos_id", scalar(EOS as i64).expect("tensor"))
                .with_constant("get_bos_id", scalar(BOS as i64).expect("tensor"))
                .with_constant("vision_token_id", scalar(VISION_ID as i64).expect("tensor"))
                .with_constant(
                    "image_seq_length",
                    scalar(self.image_seq_length as i64).expect("tensor"),
                )
                .with_constant("size", scalar(self.image_size as i64).expect("tensor"))
                .with_constant(
                    "image_mean",
                    Tensor::new(&[0.5f32, 0.5, 0.5], &Device::Cpu).expect("tensor"),
                )
                .with_constant(
                    "image_std",
                    Tensor::new(&[0.5f32, 0.5, 0.5], &Device::Cpu).expect("tensor"),
                );
        }
        (table, log)
    }
}

pub fn prompt_settings(strategy: PromptStrategy) -> PromptSettings {
    PromptSettings {
        strategy,
        ..PromptSettings::default()
    }
}

/// Runner over a scripted program with the default (chat template) strategy.
pub fn scripted_runner(model: ScriptedModel) -> Result<(VisionLanguageRunner<MethodTable>, CallLog)> {
    let (table, log) = model.build();
    let runner = VisionLanguageRunner::new(
        table,
        StubTokenizer::shared(),
        &prompt_settings(PromptStrategy::Auto),
    )?;
    Ok((runner, log))
}

/// Collapses each maximal run of `vision_id` back into a single `marker`.
pub fn collapse_vision_run(tokens: &[u32], vision_id: u32, marker: u32) -> Vec<u32> {
    let mut collapsed = Vec::with_capacity(tokens.len());
    for &id in tokens {
        if id == vision_id {
            if collapsed.last() != Some(&marker) {
                collapsed.push(marker);
            }
        } else {
            collapsed.push(id);
        }
    }
    collapsed
}

pub fn test_image(width: u32, height: u32) -> image::DynamicImage {
    image::DynamicImage::ImageRgb8(image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 16) as u8, (y * 16) as u8, 128])
    }))
}
