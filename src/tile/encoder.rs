//! Tile finishing: background compositing, resizing and encoding.
//!
//! Region reads come back as RGBA with transparent pixels wherever the read
//! extends past the slide. Tiles are flattened over the slide background,
//! resized to the requested size when the read size differs, then encoded.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::{self, FilterType};
use image::{ExtendedColorType, ImageEncoder, Rgb, RgbImage, RgbaImage};

use crate::error::TileError;
use crate::pyramid::TileEncoding;

/// Default JPEG quality (1-100).
pub const DEFAULT_JPEG_QUALITY: u8 = 70;

/// Minimum allowed JPEG quality.
pub const MIN_JPEG_QUALITY: u8 = 1;

/// Maximum allowed JPEG quality.
pub const MAX_JPEG_QUALITY: u8 = 100;

/// Validate JPEG quality parameter.
#[inline]
pub fn is_valid_quality(quality: u8) -> bool {
    (MIN_JPEG_QUALITY..=MAX_JPEG_QUALITY).contains(&quality)
}

// =============================================================================
// Tile Encoder
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct TileEncoder {
    quality: u8,
}

impl Default for TileEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl TileEncoder {
    /// Quality is clamped to 1-100.
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(MIN_JPEG_QUALITY, MAX_JPEG_QUALITY),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Alpha-composite over an opaque background.
    pub fn flatten(&self, image: &RgbaImage, background: Rgb<u8>) -> RgbImage {
        RgbImage::from_fn(image.width(), image.height(), |x, y| {
            let [r, g, b, a] = image.get_pixel(x, y).0;
            let a = a as u32;
            let blend = |fg: u8, bg: u8| ((fg as u32 * a + bg as u32 * (255 - a) + 127) / 255) as u8;
            Rgb([
                blend(r, background[0]),
                blend(g, background[1]),
                blend(b, background[2]),
            ])
        })
    }

    /// Resize with Lanczos3, only if the size differs.
    pub fn fit(&self, image: RgbImage, width: u32, height: u32) -> RgbImage {
        if image.dimensions() == (width, height) {
            return image;
        }
        imageops::resize(&image, width, height, FilterType::Lanczos3)
    }

    pub fn encode(&self, image: &RgbImage, encoding: TileEncoding) -> Result<Bytes, TileError> {
        let mut output = Vec::new();
        match encoding {
            TileEncoding::Jpeg => {
                JpegEncoder::new_with_quality(&mut output, self.quality)
                    .encode_image(image)
                    .map_err(|e| TileError::Encode {
                        message: e.to_string(),
                    })?;
            }
            TileEncoding::Png => {
                PngEncoder::new(&mut output)
                    .write_image(
                        image.as_raw(),
                        image.width(),
                        image.height(),
                        ExtendedColorType::Rgb8,
                    )
                    .map_err(|e| TileError::Encode {
                        message: e.to_string(),
                    })?;
            }
        }
        Ok(Bytes::from(output))
    }

    /// Flatten, fit and encode in one step.
    pub fn finish(
        &self,
        region: &RgbaImage,
        background: Rgb<u8>,
        width: u32,
        height: u32,
        encoding: TileEncoding,
    ) -> Result<Bytes, TileError> {
        let flat = self.flatten(region, background);
        let fitted = self.fit(flat, width, height);
        self.encode(&fitted, encoding)
    }
}
