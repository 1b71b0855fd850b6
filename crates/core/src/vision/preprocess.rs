use anyhow::{Result, ensure};
use candle_core::{Device, Tensor};
use image::{DynamicImage, RgbImage, imageops::FilterType};

use crate::{
    error::{GenerateError, GenerateResult},
    metadata::ModelMetadata,
};

/// Decodes PNG/JPEG/WebP bytes into an image.
pub fn decode_image_bytes(bytes: &[u8]) -> GenerateResult<DynamicImage> {
    image::load_from_memory(bytes).map_err(|err| GenerateError::Image(err.to_string()))
}

/// Resizes to `image_size x image_size` (bilinear), scales to `[0, 1]` and
/// normalises each channel with the model's mean/std.
/// Returns `pixel_values` shaped `[1, 3, S, S]` in `f32`.
pub fn preprocess_image(image: &DynamicImage, metadata: &ModelMetadata) -> Result<Tensor> {
    let size = metadata.image_size;
    ensure!(size > 0, "image size must be positive");
    let rgb = image.to_rgb8();
    let resized = if rgb.dimensions() == (size, size) {
        rgb
    } else {
        image::imageops::resize(&rgb, size, size, FilterType::Triangle)
    };
    let data = normalize_pixels(&resized, metadata.image_mean, metadata.image_std);
    let side = size as usize;
    Ok(Tensor::from_vec(data, (1, 3, side, side), &Device::Cpu)?)
}

/// Channel-major (`CHW`) normalised pixel data for an RGB image.
pub fn normalize_pixels(image: &RgbImage, mean: [f32; 3], std: [f32; 3]) -> Vec<f32> {
    let (width, height) = image.dimensions();
    let plane = (width * height) as usize;
    let mut data = vec![0f32; plane * 3];
    for (x, y, pixel) in image.enumerate_pixels() {
        let offset = (y * width + x) as usize;
        for channel in 0..3 {
            let value = f32::from(pixel[channel]) / 255.0;
            data[channel * plane + offset] = (value - mean[channel]) / std[channel];
        }
    }
    data
}
