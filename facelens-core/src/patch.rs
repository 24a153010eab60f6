//! Face patch extraction.
//!
//! A patch is the pixel region under a box. Rows and columns that fall outside the source image
//! are filled with zeros, so a patch always has the box's extents even near image borders.

use facelens_utils::{ResizeQuality, resize_rgb};
use image::{RgbImage, imageops};

use crate::error::{FaceError, Result};
use crate::geometry::BoundingBox;

/// Integer crop region in source image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchRegion {
    /// Top-left x coordinate (may lie outside the source image).
    pub x: i64,
    /// Top-left y coordinate (may lie outside the source image).
    pub y: i64,
    pub width: u32,
    pub height: u32,
    pub pad_left: u32,
    pub pad_top: u32,
    pub pad_right: u32,
    pub pad_bottom: u32,
}

impl PatchRegion {
    /// Round the corners of `bbox` to whole pixels and record the padding needed for an image of
    /// `img_w` x `img_h`. Degenerate or non-finite boxes are rejected.
    pub fn from_box(bbox: &BoundingBox, img_w: u32, img_h: u32) -> Result<Self> {
        let (x1, y1, x2, y2) = bbox.round().corners();
        if bbox.is_degenerate() || !x2.is_finite() || !y2.is_finite() {
            return Err(FaceError::invalid(format!(
                "cannot extract a patch for degenerate box {bbox:?}"
            )));
        }
        let x = x1 as i64;
        let y = y1 as i64;
        let width = ((x2 - x1) as i64).max(1) as u32;
        let height = ((y2 - y1) as i64).max(1) as u32;

        let pad_left = (-x).max(0) as u32;
        let pad_top = (-y).max(0) as u32;
        let pad_right = (x + width as i64 - img_w as i64).max(0) as u32;
        let pad_bottom = (y + height as i64 - img_h as i64).max(0) as u32;
        Ok(Self {
            x,
            y,
            width,
            height,
            pad_left,
            pad_top,
            pad_right,
            pad_bottom,
        })
    }

    pub fn requires_padding(&self) -> bool {
        self.pad_left > 0 || self.pad_top > 0 || self.pad_right > 0 || self.pad_bottom > 0
    }

    /// The part of the region that intersects the image, as `(x, y, width, height)`.
    pub fn in_bounds_rect(&self, img_w: u32, img_h: u32) -> Option<(u32, u32, u32, u32)> {
        let x1 = self.x.clamp(0, img_w as i64);
        let y1 = self.y.clamp(0, img_h as i64);
        let x2 = (self.x + self.width as i64).clamp(0, img_w as i64);
        let y2 = (self.y + self.height as i64).clamp(0, img_h as i64);
        if x2 <= x1 || y2 <= y1 {
            None
        } else {
            Some((x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32))
        }
    }
}

/// Cut the region under `bbox` out of `image`, zero-filling outside the image.
pub fn extract_patch(image: &RgbImage, bbox: &BoundingBox) -> Result<RgbImage> {
    let (img_w, img_h) = image.dimensions();
    let region = PatchRegion::from_box(bbox, img_w, img_h)?;
    let mut canvas = RgbImage::new(region.width, region.height);
    if let Some((src_x, src_y, src_w, src_h)) = region.in_bounds_rect(img_w, img_h) {
        let sub = imageops::crop_imm(image, src_x, src_y, src_w, src_h).to_image();
        let dest_x = src_x as i64 - region.x;
        let dest_y = src_y as i64 - region.y;
        imageops::replace(&mut canvas, &sub, dest_x, dest_y);
    }
    Ok(canvas)
}

/// Extract the patch under `bbox` and resize it to `width` x `height`.
pub fn extract_resized(
    image: &RgbImage,
    bbox: &BoundingBox,
    width: u32,
    height: u32,
    quality: ResizeQuality,
) -> Result<RgbImage> {
    if width == 0 || height == 0 {
        return Err(FaceError::invalid("patch output size must be non-zero"));
    }
    let patch = extract_patch(image, bbox)?;
    Ok(resize_rgb(&patch, width, height, quality))
}
