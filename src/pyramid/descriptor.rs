//! Pyramid descriptor and its Deep Zoom (DZI) document.
//!
//! The descriptor holds the tile parameters of an image's pyramid. It is
//! persisted as the DZI XML that clients fetch, so the stored document is
//! both the protocol response and the cache watermark.
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <Image xmlns="http://schemas.microsoft.com/deepzoom/2008" Format="jpeg" Overlap="1" TileSize="254">
//!   <Size Height="3072" Width="4096"/>
//! </Image>
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DescriptorError, TileError};

pub const DEFAULT_TILE_SIZE: u32 = 254;
pub const DEFAULT_OVERLAP: u32 = 1;
pub const DEFAULT_ENCODING: TileEncoding = TileEncoding::Jpeg;

pub const DZI_NAMESPACE: &str = "http://schemas.microsoft.com/deepzoom/2008";

/// Encoded tile format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileEncoding {
    Jpeg,
    Png,
}

impl TileEncoding {
    /// Name used in descriptors and as the tile file extension.
    pub fn as_str(&self) -> &'static str {
        match self {
            TileEncoding::Jpeg => "jpeg",
            TileEncoding::Png => "png",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            TileEncoding::Jpeg => "image/jpeg",
            TileEncoding::Png => "image/png",
        }
    }
}

impl fmt::Display for TileEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TileEncoding {
    type Err = TileError;

    /// Accepts `jpeg` and `png`, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jpeg" => Ok(TileEncoding::Jpeg),
            "png" => Ok(TileEncoding::Png),
            _ => Err(TileError::UnsupportedEncoding {
                encoding: s.to_string(),
            }),
        }
    }
}

/// Tile parameters of one image's pyramid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PyramidDescriptor {
    pub tile_size: u32,
    pub overlap: u32,
    pub encoding: TileEncoding,
}

impl Default for PyramidDescriptor {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            overlap: DEFAULT_OVERLAP,
            encoding: DEFAULT_ENCODING,
        }
    }
}

impl PyramidDescriptor {
    /// Build a descriptor, rejecting a zero tile size or an overlap larger
    /// than the tile.
    pub fn new(tile_size: u32, overlap: u32, encoding: TileEncoding) -> Result<Self, TileError> {
        if tile_size == 0 {
            return Err(TileError::InvalidDescriptor {
                message: "tile size must be at least 1".to_string(),
            });
        }
        if overlap > tile_size {
            return Err(TileError::InvalidDescriptor {
                message: format!("overlap {} exceeds tile size {}", overlap, tile_size),
            });
        }
        Ok(Self {
            tile_size,
            overlap,
            encoding,
        })
    }
}

/// Tile parameters a caller asked for; unset fields take defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlap: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<TileEncoding>,
}

impl DescriptorRequest {
    /// Build from raw query values; the format string is validated here.
    pub fn parse(
        tile_size: Option<u32>,
        overlap: Option<u32>,
        format: Option<&str>,
    ) -> Result<Self, TileError> {
        let encoding = format.map(str::parse).transpose()?;
        Ok(Self {
            tile_size,
            overlap,
            encoding,
        })
    }

    /// Whether every requested parameter equals the stored one.
    pub fn matches(&self, descriptor: &PyramidDescriptor) -> bool {
        self.tile_size.map_or(true, |t| t == descriptor.tile_size)
            && self.overlap.map_or(true, |o| o == descriptor.overlap)
            && self.encoding.map_or(true, |e| e == descriptor.encoding)
    }

    /// Descriptor from the requested values, defaults elsewhere.
    pub fn resolve(&self) -> Result<PyramidDescriptor, TileError> {
        PyramidDescriptor::new(
            self.tile_size.unwrap_or(DEFAULT_TILE_SIZE),
            self.overlap.unwrap_or(DEFAULT_OVERLAP),
            self.encoding.unwrap_or(DEFAULT_ENCODING),
        )
    }
}

/// A descriptor together with the level-0 size of its image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DziDocument {
    pub descriptor: PyramidDescriptor,
    pub width: u32,
    pub height: u32,
}

impl DziDocument {
    pub fn new(descriptor: PyramidDescriptor, width: u32, height: u32) -> Self {
        Self {
            descriptor,
            width,
            height,
        }
    }

    pub fn to_xml(&self) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<Image xmlns="{ns}" Format="{format}" Overlap="{overlap}" TileSize="{tile_size}">
  <Size Height="{height}" Width="{width}"/>
</Image>
"#,
            ns = DZI_NAMESPACE,
            format = self.descriptor.encoding,
            overlap = self.descriptor.overlap,
            tile_size = self.descriptor.tile_size,
            height = self.height,
            width = self.width,
        )
    }

    /// Parse a stored document.
    pub fn parse(xml: &str) -> Result<Self, DescriptorError> {
        let doc = roxmltree::Document::parse(xml).map_err(|e| DescriptorError::Xml(e.to_string()))?;
        let image = doc.root_element();
        if image.tag_name().name() != "Image" {
            return Err(DescriptorError::MissingField("Image"));
        }

        let tile_size = numeric_attribute(&image, "TileSize")?;
        let overlap = numeric_attribute(&image, "Overlap")?;
        let format = image
            .attribute("Format")
            .ok_or(DescriptorError::MissingField("Format"))?;
        let encoding = format
            .parse::<TileEncoding>()
            .map_err(|_| DescriptorError::InvalidField {
                field: "Format",
                value: format.to_string(),
            })?;

        let size = image
            .children()
            .find(|n| n.is_element() && n.tag_name().name() == "Size")
            .ok_or(DescriptorError::MissingField("Size"))?;
        let width = numeric_attribute(&size, "Width")?;
        let height = numeric_attribute(&size, "Height")?;

        let descriptor = PyramidDescriptor::new(tile_size, overlap, encoding).map_err(|_| {
            DescriptorError::InvalidField {
                field: "TileSize",
                value: tile_size.to_string(),
            }
        })?;

        Ok(Self {
            descriptor,
            width,
            height,
        })
    }
}

fn numeric_attribute(node: &roxmltree::Node, name: &'static str) -> Result<u32, DescriptorError> {
    let value = node
        .attribute(name)
        .ok_or(DescriptorError::MissingField(name))?;
    value.trim().parse().map_err(|_| DescriptorError::InvalidField {
        field: name,
        value: value.to_string(),
    })
}
