//! Slide properties as flat key/value pairs.
//!
//! Keys follow the names slide viewers already read:
//!
//! ```text
//! openslide.level-count            number of native levels
//! openslide.level[N].width         native level dimensions
//! openslide.level[N].height
//! openslide.level[N].downsample
//! openslide.vendor                 "aperio" for SVS files
//! openslide.mpp-x / mpp-y          microns per pixel, from the Aperio MPP
//! openslide.objective-power        from the Aperio AppMag
//! tiff.ImageDescription            raw description of the base level
//! aperio.{key}                     every `key = value` pair of an SVS description
//! ```

use std::collections::BTreeMap;

use super::reader::SlideImage;

/// Properties derived from the native levels alone.
pub fn level_properties<T: SlideImage + ?Sized>(slide: &T) -> BTreeMap<String, String> {
    let mut properties = BTreeMap::new();
    properties.insert(
        "openslide.level-count".to_string(),
        slide.level_count().to_string(),
    );
    for level in 0..slide.level_count() {
        if let Some(info) = slide.level_info(level) {
            properties.insert(format!("openslide.level[{}].width", level), info.width.to_string());
            properties.insert(
                format!("openslide.level[{}].height", level),
                info.height.to_string(),
            );
            properties.insert(
                format!("openslide.level[{}].downsample", level),
                info.downsample.to_string(),
            );
        }
    }
    properties
}

/// Properties carried by a base-level `ImageDescription`.
///
/// Aperio descriptions look like:
///
/// ```text
/// Aperio Image Library v10.0.51
/// 46920x33014 [0,100 46000x32914] (256x256) JPEG/RGB Q=30|AppMag = 20|MPP = 0.4990
/// ```
///
/// The first `|`-separated part is a free-form header; every later part is
/// a `key = value` pair.
pub fn description_properties(description: &str) -> BTreeMap<String, String> {
    let mut properties = BTreeMap::new();
    properties.insert(
        "tiff.ImageDescription".to_string(),
        description.to_string(),
    );

    if !description.starts_with("Aperio") {
        return properties;
    }
    properties.insert("openslide.vendor".to_string(), "aperio".to_string());

    for part in description.split('|').skip(1) {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() {
            continue;
        }
        properties.insert(format!("aperio.{}", key), value.to_string());

        match key {
            "MPP" if value.parse::<f64>().is_ok() => {
                properties.insert("openslide.mpp-x".to_string(), value.to_string());
                properties.insert("openslide.mpp-y".to_string(), value.to_string());
            }
            "AppMag" if value.parse::<f64>().is_ok() => {
                properties.insert("openslide.objective-power".to_string(), value.to_string());
            }
            _ => {}
        }
    }

    properties
}
