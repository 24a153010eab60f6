use std::path::Path;

use anyhow::{Context, Result};
use image::{DynamicImage, RgbImage, imageops::FilterType};

use crate::config::ResizeQuality;

/// Decode an image file.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<DynamicImage> {
    let path = path.as_ref();
    image::open(path).with_context(|| format!("failed to open image {}", path.display()))
}

/// Map the resize preference onto an `image` sampling filter.
pub fn resize_filter(quality: ResizeQuality) -> FilterType {
    match quality {
        ResizeQuality::Quality => FilterType::Triangle,
        ResizeQuality::Speed => FilterType::Nearest,
    }
}

/// Resize an RGB image to exactly `width` x `height`.
///
/// Returns the input unchanged (cloned) when it already has the requested size.
pub fn resize_rgb(image: &RgbImage, width: u32, height: u32, quality: ResizeQuality) -> RgbImage {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    image::imageops::resize(image, width, height, resize_filter(quality))
}
