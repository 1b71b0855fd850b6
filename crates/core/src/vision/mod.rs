pub mod preprocess;

pub use preprocess::{decode_image_bytes, normalize_pixels, preprocess_image};
