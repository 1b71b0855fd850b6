use std::collections::BTreeSet;

use anyhow::{Result, anyhow};
use candle_core::{Device, Tensor};
use gemma_vlm_core::{MethodTable, ModelMetadata, metadata::END_OF_TURN_ID};

#[test]
fn missing_accessors_fall_back_to_defaults() {
    let mut backend = MethodTable::new();
    let metadata = ModelMetadata::resolve(&mut backend);
    assert_eq!(metadata, ModelMetadata::default());
    assert_eq!(metadata.max_seq_len, 2048);
    assert_eq!(metadata.eos_token_id, 1);
    assert_eq!(metadata.bos_token_id, 2);
    assert_eq!(metadata.vision_token_id, 262_144);
    assert_eq!(metadata.image_seq_length, 256);
    assert_eq!(metadata.image_size, 896);
    assert_eq!(metadata.image_mean, [0.5; 3]);
    assert_eq!(metadata.image_std, [0.5; 3]);
    assert_eq!(metadata.stop_token_ids, BTreeSet::from([1, END_OF_TURN_ID]));
}

#[test]
fn exported_values_are_used() -> Result<()> {
    let mut backend = MethodTable::new()
        .with_constant("get_max_seq_len", Tensor::new(&[1024i64], &Device::Cpu)?)
        .with_constant("get_eos_id", Tensor::new(&[7i64], &Device::Cpu)?)
        .with_constant("vision_token_id", Tensor::new(&[99i64], &Device::Cpu)?)
        .with_constant("image_seq_length", Tensor::new(&[64i64], &Device::Cpu)?)
        .with_constant("size", Tensor::new(&[224i64, 224], &Device::Cpu)?)
        .with_constant(
            "image_mean",
            Tensor::new(&[0.48f32, 0.45, 0.40], &Device::Cpu)?,
        )
        .with_constant("image_std", Tensor::new(&[0.25f32], &Device::Cpu)?);
    let metadata = ModelMetadata::resolve(&mut backend);

    assert_eq!(metadata.max_seq_len, 1024);
    assert_eq!(metadata.eos_token_id, 7);
    assert_eq!(metadata.bos_token_id, 2);
    assert_eq!(metadata.vision_token_id, 99);
    assert_eq!(metadata.image_seq_length, 64);
    assert_eq!(metadata.image_size, 224);
    assert_eq!(metadata.image_mean, [0.48, 0.45, 0.40]);
    assert_eq!(metadata.image_std, [0.25; 3]);
    assert!(metadata.is_stop_token(7));
    assert!(metadata.is_stop_token(END_OF_TURN_ID));
    assert!(!metadata.is_stop_token(1));
    Ok(())
}

#[test]
fn failing_or_malformed_accessors_are_recovered() -> Result<()> {
    let mut backend = MethodTable::new()
        .with_method("get_max_seq_len", |_| Err(anyhow!("accessor crashed")))
        .with_method("get_eos_id", |_| Ok(Vec::new()))
        .with_constant("image_std", Tensor::new(&[0.5f32, 0.0, 0.5], &Device::Cpu)?)
        .with_constant("image_seq_length", Tensor::new(&[-3i64], &Device::Cpu)?);
    let metadata = ModelMetadata::resolve(&mut backend);

    assert_eq!(metadata.max_seq_len, 2048);
    assert_eq!(metadata.eos_token_id, 1);
    assert_eq!(metadata.image_std, [0.5; 3]);
    assert_eq!(metadata.image_seq_length, 256);
    Ok(())
}
