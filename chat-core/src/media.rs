use base64::{engine::general_purpose, Engine as _};
use image::imageops::FilterType;
use image::GenericImageView;
use std::io::Cursor;

use crate::error::MediaError;
use crate::models::{DetailLevel, ImageRef};

/// Longest edge sent for high-detail images.
pub const MAX_HIGH_DETAIL_EDGE: u32 = 2048;

/// Decode an uploaded image and re-encode it as base64 PNG.
///
/// High detail images larger than 2048x2048 are scaled down to fit, keeping
/// the aspect ratio.
pub fn prepare_image(bytes: &[u8], detail: DetailLevel) -> Result<ImageRef, MediaError> {
    let mut image = image::load_from_memory(bytes).map_err(MediaError::Decode)?;
    let (width, height) = image.dimensions();

    if detail == DetailLevel::High
        && (width > MAX_HIGH_DETAIL_EDGE || height > MAX_HIGH_DETAIL_EDGE)
    {
        image = image.resize(MAX_HIGH_DETAIL_EDGE, MAX_HIGH_DETAIL_EDGE, FilterType::Lanczos3);
        let (resized_width, resized_height) = image.dimensions();
        tracing::debug!(
            width,
            height,
            resized_width,
            resized_height,
            "Downscaled image"
        );
    }

    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, image::ImageOutputFormat::Png)
        .map_err(MediaError::Encode)?;

    Ok(ImageRef::new(
        general_purpose::STANDARD.encode(buffer.get_ref()),
        detail,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbImage};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(RgbImage::new(width, height));
        let mut buffer = Cursor::new(Vec::new());
        image
            .write_to(&mut buffer, image::ImageOutputFormat::Png)
            .unwrap();
        buffer.into_inner()
    }

    fn decoded_dimensions(image: &ImageRef) -> (u32, u32) {
        let bytes = general_purpose::STANDARD.decode(image.encoded()).unwrap();
        image::load_from_memory(&bytes).unwrap().dimensions()
    }

    #[test]
    fn high_detail_is_bounded_with_aspect_ratio() {
        let prepared = prepare_image(&png(4096, 1024), DetailLevel::High).unwrap();
        assert_eq!(decoded_dimensions(&prepared), (2048, 512));
        assert_eq!(prepared.detail(), DetailLevel::High);
    }

    #[test]
    fn low_detail_keeps_size() {
        let prepared = prepare_image(&png(64, 32), DetailLevel::Low).unwrap();
        assert_eq!(decoded_dimensions(&prepared), (64, 32));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            prepare_image(b"definitely not an image", DetailLevel::Low),
            Err(MediaError::Decode(_))
        ));
    }
}
