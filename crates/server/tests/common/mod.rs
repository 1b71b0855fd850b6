#![allow(dead_code)]

use std::sync::Arc;

use anyhow::{Result, anyhow};
use candle_core::{Device, Tensor};
use gemma_vlm_config::AppConfig;
use gemma_vlm_core::{
    MethodTable, ModelSlot, PromptSettings, TextTokenizer, VisionLanguageRunner,
    backend::{TEXT_DECODER, TOKEN_EMBEDDING, VISION_ENCODER},
};
use gemma_vlm_server::{AppState, DynBackend, RequestDefaults, build_rocket};
use rocket::local::blocking::Client;

pub const EOS: u32 = 1;
pub const BOS: u32 = 2;
const START_OF_IMAGE: u32 = 255;
const VISION: u32 = 300;
const HIDDEN: usize = 2;
const CHAR_BASE: u32 = 1000;
const VOCAB: usize = 1200;
pub const IMAGE_TOKENS: usize = 2;

/// Byte-per-token tokenizer that knows the Gemma turn and image markers.
pub struct CharTokenizer;

const SPECIALS: [(&str, u32); 5] = [
    ("<start_of_image>", START_OF_IMAGE),
    ("<start_of_turn>", 105),
    ("<end_of_turn>", 106),
    ("<bos>", BOS),
    ("<eos>", EOS),
];

impl TextTokenizer for CharTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let mut ids = if add_special_tokens { vec![BOS] } else { Vec::new() };
        let mut rest = text;
        while let Some(ch) = rest.chars().next() {
            if let Some((token, id)) = SPECIALS.iter().find(|(token, _)| rest.starts_with(token)) {
                ids.push(*id);
                rest = &rest[token.len()..];
            } else {
                ids.push(CHAR_BASE + ch as u32);
                rest = &rest[ch.len_utf8()..];
            }
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[u32], _skip_special_tokens: bool) -> Result<String> {
        Ok(ids
            .iter()
            .filter(|&&id| id >= CHAR_BASE)
            .filter_map(|&id| char::from_u32(id - CHAR_BASE))
            .collect())
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        SPECIALS
            .iter()
            .find(|(special, _)| *special == token)
            .map(|(_, id)| *id)
    }
}

fn char_id(ch: char) -> u32 {
    CHAR_BASE + ch as u32
}

/// Program that answers every request with `reply` followed by EOS.
pub fn scripted_program(reply: &str) -> Result<MethodTable> {
    let mut script: Vec<u32> = reply.chars().map(char_id).collect();
    script.push(EOS);
    let mut step = 0usize;
    let scalar = |value: i64| Tensor::new(&[value], &Device::Cpu);

    let table = MethodTable::new()
        .with_method(TOKEN_EMBEDDING, |inputs| {
            let ids = inputs[0].to_vec2::<i64>()?;
            let row = ids.first().cloned().unwrap_or_default();
            let data: Vec<f32> = row.iter().flat_map(|&id| [id as f32, 1.0]).collect();
            Ok(vec![Tensor::from_vec(data, (1, row.len(), HIDDEN), &Device::Cpu)?])
        })
        .with_method(VISION_ENCODER, |_| {
            let data = vec![-1f32; IMAGE_TOKENS * HIDDEN];
            Ok(vec![Tensor::from_vec(data, (1, IMAGE_TOKENS, HIDDEN), &Device::Cpu)?])
        })
        .with_method(TEXT_DECODER, move |inputs| {
            let (_, rows, _) = inputs[0].dims3()?;
            // A multi-row call is a prefill, so a new request starts over.
            if rows > 1 {
                step = 0;
            }
            let token = script.get(step).copied().unwrap_or(EOS);
            step += 1;
            let mut logits = vec![0f32; VOCAB];
            logits[token as usize] = 5.0;
            let data: Vec<f32> = std::iter::repeat(logits).take(rows).flatten().collect();
            Ok(vec![Tensor::from_vec(data, (1, rows, VOCAB), &Device::Cpu)?])
        })
        .with_constant("get_max_seq_len", scalar(256)?)
        .with_constant("vision_token_id", scalar(VISION as i64)?)
        .with_constant("image_seq_length", scalar(IMAGE_TOKENS as i64)?)
        .with_constant("size", scalar(4)?);
    Ok(table)
}

pub fn slot_replying(reply: &'static str) -> ModelSlot<DynBackend> {
    ModelSlot::new("gemma3-test", move || {
        let backend: DynBackend = Box::new(scripted_program(reply)?);
        VisionLanguageRunner::new(
            backend,
            Arc::new(CharTokenizer),
            &PromptSettings::default(),
        )
    })
}

pub fn failing_slot() -> ModelSlot<DynBackend> {
    ModelSlot::new("gemma3-test", || Err(anyhow!("program file missing")))
}

/// Local client over a slot, loading it first when `load` is set.
pub fn client(mut slot: ModelSlot<DynBackend>, load: bool) -> Result<Client> {
    if load {
        slot.load()?;
    }
    let config = AppConfig::default();
    let state = AppState::new(slot, RequestDefaults::from_config(&config));
    Ok(Client::tracked(build_rocket(state, &config.server))?)
}
