//! IIIF Image API 2 companion: `info.json` and region request parsing.
//!
//! Region requests follow `{region}/{size}/{rotation}/{quality}.{format}`:
//!
//! | Part     | Accepted                             |
//! |----------|--------------------------------------|
//! | region   | `full`, `x,y,w,h` (level-0 pixels)   |
//! | size     | `full`, `max`, `w,`, `,h`, `w,h`     |
//! | rotation | `0`                                  |
//! | quality  | `default`, `color`                   |
//! | format   | `jpg`, `png`                         |

use serde::{Deserialize, Serialize};

use super::descriptor::TileEncoding;
use crate::error::TileError;

pub const IIIF_CONTEXT: &str = "http://iiif.io/api/image/2/context.json";
pub const IIIF_PROTOCOL: &str = "http://iiif.io/api/image";
pub const IIIF_PROFILE: &str = "http://iiif.io/api/image/2/level1.json";

/// Largest output edge a region request may produce.
pub const MAX_OUTPUT_DIMENSION: u32 = 8192;

/// Largest native read, in pixels, a region request may make. Requests
/// over it are served from a coarser native level or rejected.
pub const MAX_READ_PIXELS: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IiifTiles {
    pub width: u32,
    #[serde(rename = "scaleFactors")]
    pub scale_factors: Vec<u32>,
}

/// The `info.json` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IiifInfo {
    #[serde(rename = "@context")]
    pub context: String,
    #[serde(rename = "@id")]
    pub id: String,
    pub protocol: String,
    pub width: u32,
    pub height: u32,
    pub profile: Vec<String>,
    pub tiles: Vec<IiifTiles>,
}

impl IiifInfo {
    pub fn new(id: String, width: u32, height: u32, tile_size: u32, scale_factors: Vec<u32>) -> Self {
        Self {
            context: IIIF_CONTEXT.to_string(),
            id,
            protocol: IIIF_PROTOCOL.to_string(),
            width,
            height,
            profile: vec![IIIF_PROFILE.to_string()],
            tiles: vec![IiifTiles {
                width: tile_size,
                scale_factors,
            }],
        }
    }
}

/// Requested region in level-0 pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IiifRegion {
    Full,
    Rect { x: u64, y: u64, width: u64, height: u64 },
}

/// Requested output size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IiifSize {
    Full,
    Max,
    Width(u32),
    Height(u32),
    Exact(u32, u32),
}

/// A resolved rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u64,
    pub y: u64,
    pub width: u32,
    pub height: u32,
}

fn invalid(message: impl Into<String>) -> TileError {
    TileError::InvalidRegion {
        message: message.into(),
    }
}

impl IiifRegion {
    pub fn parse(s: &str) -> Result<Self, TileError> {
        if s == "full" {
            return Ok(IiifRegion::Full);
        }
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != 4 {
            return Err(invalid(format!("region {:?} is not full or x,y,w,h", s)));
        }
        let mut values = [0u64; 4];
        for (value, part) in values.iter_mut().zip(&parts) {
            *value = part
                .parse()
                .map_err(|_| invalid(format!("region component {:?} is not a number", part)))?;
        }
        let [x, y, width, height] = values;
        if width == 0 || height == 0 {
            return Err(invalid("region must have a non-zero size"));
        }
        Ok(IiifRegion::Rect { x, y, width, height })
    }

    /// Clip to the image. A region starting outside it is an error.
    pub fn resolve(&self, image_width: u32, image_height: u32) -> Result<PixelRect, TileError> {
        match *self {
            IiifRegion::Full => Ok(PixelRect {
                x: 0,
                y: 0,
                width: image_width,
                height: image_height,
            }),
            IiifRegion::Rect { x, y, width, height } => {
                if x >= image_width as u64 || y >= image_height as u64 {
                    return Err(invalid(format!(
                        "region origin ({}, {}) outside {}x{} image",
                        x, y, image_width, image_height
                    )));
                }
                Ok(PixelRect {
                    x,
                    y,
                    width: width.min(image_width as u64 - x) as u32,
                    height: height.min(image_height as u64 - y) as u32,
                })
            }
        }
    }
}

impl IiifSize {
    pub fn parse(s: &str) -> Result<Self, TileError> {
        match s {
            "full" => return Ok(IiifSize::Full),
            "max" => return Ok(IiifSize::Max),
            _ => {}
        }
        let (w, h) = s
            .split_once(',')
            .ok_or_else(|| invalid(format!("size {:?} is not full, max, w, ,h or w,h", s)))?;
        let parse_dim = |v: &str| -> Result<u32, TileError> {
            match v.parse::<u32>() {
                Ok(n) if n > 0 => Ok(n),
                _ => Err(invalid(format!("size component {:?} is not a positive number", v))),
            }
        };
        match (w.is_empty(), h.is_empty()) {
            (false, true) => Ok(IiifSize::Width(parse_dim(w)?)),
            (true, false) => Ok(IiifSize::Height(parse_dim(h)?)),
            (false, false) => Ok(IiifSize::Exact(parse_dim(w)?, parse_dim(h)?)),
            (true, true) => Err(invalid("size needs a width or a height")),
        }
    }

    /// Output size for a region. Upscaling is not supported.
    pub fn resolve(&self, region_width: u32, region_height: u32) -> Result<(u32, u32), TileError> {
        let (rw, rh) = (region_width as u64, region_height as u64);
        let scaled = |num: u64, den: u64, other: u64| ((other * num + den / 2) / den).max(1) as u32;

        let (w, h) = match *self {
            IiifSize::Full => (region_width, region_height),
            IiifSize::Max => {
                let longest = region_width.max(region_height);
                if longest <= MAX_OUTPUT_DIMENSION {
                    (region_width, region_height)
                } else {
                    let max = MAX_OUTPUT_DIMENSION as u64;
                    let longest = longest as u64;
                    (scaled(max, longest, rw), scaled(max, longest, rh))
                }
            }
            IiifSize::Width(w) => (w, scaled(w as u64, rw, rh)),
            IiifSize::Height(h) => (scaled(h as u64, rh, rw), h),
            IiifSize::Exact(w, h) => (w, h),
        };

        if w > region_width || h > region_height {
            return Err(invalid(format!(
                "size {}x{} exceeds region {}x{}",
                w, h, region_width, region_height
            )));
        }
        if w > MAX_OUTPUT_DIMENSION || h > MAX_OUTPUT_DIMENSION {
            return Err(invalid(format!(
                "size {}x{} exceeds the {} pixel limit",
                w, h, MAX_OUTPUT_DIMENSION
            )));
        }
        Ok((w, h))
    }
}

/// A parsed region request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IiifRequest {
    pub region: IiifRegion,
    pub size: IiifSize,
    pub encoding: TileEncoding,
}

impl IiifRequest {
    pub fn parse(region: &str, size: &str, rotation: &str, quality_format: &str) -> Result<Self, TileError> {
        let region = IiifRegion::parse(region)?;
        let size = IiifSize::parse(size)?;

        match rotation.parse::<f64>() {
            Ok(r) if r == 0.0 => {}
            _ => return Err(invalid(format!("rotation {:?} is not supported", rotation))),
        }

        let (quality, format) = quality_format
            .rsplit_once('.')
            .ok_or_else(|| invalid(format!("{:?} is not quality.format", quality_format)))?;
        if !matches!(quality, "default" | "color") {
            return Err(invalid(format!("quality {:?} is not supported", quality)));
        }
        let encoding = match format {
            "jpg" => TileEncoding::Jpeg,
            "png" => TileEncoding::Png,
            other => {
                return Err(TileError::UnsupportedEncoding {
                    encoding: other.to_string(),
                })
            }
        };

        Ok(Self {
            region,
            size,
            encoding,
        })
    }
}
