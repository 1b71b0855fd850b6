use std::{fs, sync::Arc};

use anyhow::Result;
use gemma_vlm_core::{
    GenerateError, ModelMetadata, TextTokenizer, load_tokenizer,
    vision::{decode_image_bytes, normalize_pixels, preprocess_image},
};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

fn metadata(size: u32) -> ModelMetadata {
    ModelMetadata {
        image_size: size,
        ..ModelMetadata::default()
    }
}

#[test]
fn preprocess_resizes_to_square_chw() -> Result<()> {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 10, Rgb([255, 0, 128])));
    let pixels = preprocess_image(&image, &metadata(16))?;
    assert_eq!(pixels.dims(), &[1, 3, 16, 16]);
    Ok(())
}

#[test]
fn normalisation_maps_bytes_to_unit_range() {
    let image = RgbImage::from_fn(2, 1, |x, _| {
        if x == 0 {
            Rgb([0, 0, 0])
        } else {
            Rgb([255, 255, 255])
        }
    });
    let data = normalize_pixels(&image, [0.5; 3], [0.5; 3]);
    // channel-major: [r0, r1, g0, g1, b0, b1]
    assert_eq!(data, vec![-1.0, 1.0, -1.0, 1.0, -1.0, 1.0]);
}

#[test]
fn uniform_image_survives_resize_unchanged() -> Result<()> {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(7, 5, Rgb([255, 255, 255])));
    let pixels = preprocess_image(&image, &metadata(4))?;
    let values = pixels.flatten_all()?.to_vec1::<f32>()?;
    assert!(values.iter().all(|v| (v - 1.0).abs() < 1e-6));
    Ok(())
}

#[test]
fn encoded_bytes_round_through_decoder() -> Result<()> {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 3, Rgb([10, 20, 30])));
    let mut bytes = std::io::Cursor::new(Vec::new());
    image.write_to(&mut bytes, ImageFormat::Png)?;
    let decoded = decode_image_bytes(bytes.get_ref())?;
    assert_eq!(decoded.to_rgb8().get_pixel(1, 1), &Rgb([10, 20, 30]));

    let err = decode_image_bytes(b"not an image").expect_err("garbage bytes");
    assert!(matches!(err, GenerateError::Image(_)));
    Ok(())
}

const WORD_LEVEL_TOKENIZER: &str = r#"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [
    {"id": 0, "content": "<start_of_image>", "single_word": false, "lstrip": false,
     "rstrip": false, "normalized": false, "special": true}
  ],
  "normalizer": null,
  "pre_tokenizer": {"type": "Whitespace"},
  "post_processor": null,
  "decoder": null,
  "model": {"type": "WordLevel", "vocab": {"<start_of_image>": 0, "hello": 1, "world": 2, "<unk>": 3}, "unk_token": "<unk>"}
}"#;

#[test]
fn tokenizer_loads_from_processor_directory() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("tokenizer.json"), WORD_LEVEL_TOKENIZER)?;
    let tokenizer = load_tokenizer(dir.path())?;

    assert_eq!(TextTokenizer::token_to_id(&tokenizer, "<start_of_image>"), Some(0));
    assert_eq!(TextTokenizer::encode(&tokenizer, "hello world", false)?, vec![1, 2]);
    Ok(())
}

#[test]
fn loaded_tokenizer_decodes_and_skips_specials() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("tokenizer.json"), WORD_LEVEL_TOKENIZER)?;
    let tokenizer: Arc<dyn TextTokenizer> = Arc::new(load_tokenizer(dir.path())?);

    assert_eq!(tokenizer.decode(&[1, 2], true)?, "hello world");
    assert_eq!(tokenizer.decode(&[0, 1], true)?, "hello");
    assert_eq!(
        tokenizer.encode("<start_of_image> world", false)?,
        vec![0, 2]
    );
    Ok(())
}

#[test]
fn missing_tokenizer_file_is_reported() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let err = load_tokenizer(dir.path()).expect_err("no tokenizer.json");
    assert!(format!("{err:#}").contains("tokenizer.json"));
    Ok(())
}
