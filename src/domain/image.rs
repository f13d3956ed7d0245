//! Decoded images and the options used to request them.

use serde::{Deserialize, Serialize};

use super::asset::AssetId;

/// How a source image is scaled into the requested target size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentMode {
    /// Scale so the whole image fits inside the target
    AspectFit,
    /// Scale so the image covers the whole target
    AspectFill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSize {
    pub width: u32,
    pub height: u32,
}

impl TargetSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Dimensions of a `source_width` x `source_height` image scaled into this
    /// target with the given mode, preserving aspect ratio.
    ///
    /// Never returns a zero dimension for a non-empty source. An empty source or
    /// target yields `(0, 0)`.
    pub fn fit(&self, source_width: u32, source_height: u32, mode: ContentMode) -> (u32, u32) {
        if source_width == 0 || source_height == 0 || self.width == 0 || self.height == 0 {
            return (0, 0);
        }

        let scale_x = f64::from(self.width) / f64::from(source_width);
        let scale_y = f64::from(self.height) / f64::from(source_height);
        let scale = match mode {
            ContentMode::AspectFit => scale_x.min(scale_y),
            ContentMode::AspectFill => scale_x.max(scale_y),
        };

        let scaled = |dimension: u32| ((f64::from(dimension) * scale).round() as u32).max(1);
        (scaled(source_width), scaled(source_height))
    }
}

/// Options passed to an image decoder for each asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRequestOptions {
    pub target_size: TargetSize,
    pub content_mode: ContentMode,
}

impl Default for ImageRequestOptions {
    fn default() -> Self {
        Self {
            target_size: TargetSize::new(350, 350),
            content_mode: ContentMode::AspectFit,
        }
    }
}

/// A decoded, display-ready image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub asset_id: AssetId,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}
