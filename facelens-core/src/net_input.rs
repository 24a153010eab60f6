//! Input normalisation: resize, pad and stack source images into one batch tensor.
//!
//! Every image in a batch is resized (aspect ratio preserved) so its longer side equals the
//! network input size and then zero-padded to a square. The per-image resize and padding offsets
//! are kept in a [`NetInput`] so decoders can map network-space coordinates back onto each
//! source image. Batch order is the only correlation key between inputs and outputs.

use facelens_utils::{ResizeQuality, resize_rgb, timing_guard};
use image::RgbImage;
use ndarray::{Array4, ArrayViewMut3, Axis};

use crate::error::{FaceError, Result};
use crate::geometry::{BoundingBox, Point};

/// Where the resized image sits inside the padded square.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PadAlignment {
    /// Image at the top-left corner, padding on the right/bottom.
    #[default]
    TopLeft,
    /// Image centred, padding split evenly (odd remainders go right/bottom).
    Center,
}

/// Memory layout of the produced tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TensorLayout {
    /// `[N, H, W, 3]`
    #[default]
    Nhwc,
    /// `[N, 3, H, W]`
    Nchw,
}

/// Per-channel pixel normalisation: `(value - mean[c]) * scale`, RGB channel order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelNormalization {
    pub mean: [f32; 3],
    pub scale: f32,
}

impl PixelNormalization {
    /// Raw `0..=255` values.
    pub const IDENTITY: Self = Self {
        mean: [0.0; 3],
        scale: 1.0,
    };
    /// Maps `0..=255` to `-1..=1` (SSD MobileNet).
    pub const SYMMETRIC: Self = Self {
        mean: [127.5; 3],
        scale: 1.0 / 127.5,
    };
    /// MTCNN stage inputs.
    pub const MTCNN: Self = Self {
        mean: [127.5; 3],
        scale: 0.007_812_5,
    };
    /// Tiny face detector.
    pub const TINY_DETECTOR: Self = Self {
        mean: [117.001, 114.697, 97.404],
        scale: 1.0 / 256.0,
    };
    /// 68-point landmark network.
    pub const LANDMARKS: Self = Self {
        mean: [122.782, 117.001, 104.298],
        scale: 1.0 / 255.0,
    };
    /// Recognition (descriptor) network.
    pub const RECOGNITION: Self = Self {
        mean: [122.782, 117.001, 104.298],
        scale: 1.0 / 256.0,
    };

    #[inline]
    fn apply(&self, channel: usize, value: u8) -> f32 {
        (value as f32 - self.mean[channel]) * self.scale
    }
}

impl Default for PixelNormalization {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// How a network wants its input batch built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetInputConfig {
    /// Side length `S` of the square network input.
    pub input_size: u32,
    pub alignment: PadAlignment,
    pub layout: TensorLayout,
    pub normalization: PixelNormalization,
    pub resize_quality: ResizeQuality,
}

impl NetInputConfig {
    pub fn new(input_size: u32) -> Self {
        Self {
            input_size,
            alignment: PadAlignment::TopLeft,
            layout: TensorLayout::Nhwc,
            normalization: PixelNormalization::IDENTITY,
            resize_quality: ResizeQuality::Quality,
        }
    }

    pub fn with_alignment(mut self, alignment: PadAlignment) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_layout(mut self, layout: TensorLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_normalization(mut self, normalization: PixelNormalization) -> Self {
        self.normalization = normalization;
        self
    }

    pub fn with_resize_quality(mut self, resize_quality: ResizeQuality) -> Self {
        self.resize_quality = resize_quality;
        self
    }
}

/// Resize and padding applied to one image of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub original_width: u32,
    pub original_height: u32,
    /// Size of the image after the aspect-preserving resize, before padding.
    pub resized_width: u32,
    pub resized_height: u32,
    /// Padding inserted before the image's top-left corner.
    pub offset_x: u32,
    pub offset_y: u32,
}

impl BatchEntry {
    fn compute(width: u32, height: u32, input_size: u32, alignment: PadAlignment) -> Self {
        let scale = input_size as f32 / width.max(height) as f32;
        let resize = |side: u32| ((side as f32 * scale).round() as u32).clamp(1, input_size);
        let (resized_width, resized_height) = (resize(width), resize(height));
        let (offset_x, offset_y) = match alignment {
            PadAlignment::TopLeft => (0, 0),
            PadAlignment::Center => (
                (input_size - resized_width) / 2,
                (input_size - resized_height) / 2,
            ),
        };
        Self {
            original_width: width,
            original_height: height,
            resized_width,
            resized_height,
            offset_x,
            offset_y,
        }
    }

    /// Horizontal factor from original to network pixels.
    pub fn scale_x(&self) -> f32 {
        self.resized_width as f32 / self.original_width as f32
    }

    /// Vertical factor from original to network pixels.
    pub fn scale_y(&self) -> f32 {
        self.resized_height as f32 / self.original_height as f32
    }

    pub fn offset(&self) -> Point {
        Point::new(self.offset_x as f32, self.offset_y as f32)
    }

    /// Map a network-space point onto the original image.
    pub fn to_original(&self, p: Point) -> Point {
        Point::new(
            (p.x - self.offset_x as f32) / self.scale_x(),
            (p.y - self.offset_y as f32) / self.scale_y(),
        )
    }

    /// Map an original-image point into network space.
    pub fn to_network(&self, p: Point) -> Point {
        Point::new(
            p.x * self.scale_x() + self.offset_x as f32,
            p.y * self.scale_y() + self.offset_y as f32,
        )
    }

    /// Map a network-space box onto the original image (not clipped).
    pub fn box_to_original(&self, b: &BoundingBox) -> BoundingBox {
        let top_left = self.to_original(b.top_left());
        BoundingBox::new(
            top_left.x,
            top_left.y,
            b.width / self.scale_x(),
            b.height / self.scale_y(),
        )
    }
}

/// Per-image metadata for one forward pass, in batch order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInput {
    input_size: u32,
    entries: Vec<BatchEntry>,
}

impl NetInput {
    /// Compute batch metadata for images of the given `(width, height)`.
    pub fn plan(dimensions: &[(u32, u32)], input_size: u32, alignment: PadAlignment) -> Result<Self> {
        if dimensions.is_empty() {
            return Err(FaceError::invalid("batch must contain at least one image"));
        }
        if input_size == 0 {
            return Err(FaceError::invalid("network input size must be greater than zero"));
        }
        let entries = dimensions
            .iter()
            .enumerate()
            .map(|(index, &(w, h))| {
                if w == 0 || h == 0 {
                    Err(FaceError::invalid(format!(
                        "image {index} has zero dimensions ({w}x{h})"
                    )))
                } else {
                    Ok(BatchEntry::compute(w, h, input_size, alignment))
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            input_size,
            entries,
        })
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    pub fn batch_size(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn entry(&self, index: usize) -> Option<&BatchEntry> {
        self.entries.get(index)
    }
}

/// A batch tensor plus the metadata needed to decode its outputs.
#[derive(Debug, Clone)]
pub struct NormalizedBatch {
    pub tensor: Array4<f32>,
    pub input: NetInput,
}

/// Build a single padded batch tensor from `images`.
pub fn normalize_batch(images: &[&RgbImage], config: &NetInputConfig) -> Result<NormalizedBatch> {
    let _guard = timing_guard("facelens::normalize_batch", log::Level::Trace);
    let dims: Vec<(u32, u32)> = images.iter().map(|img| img.dimensions()).collect();
    let input = NetInput::plan(&dims, config.input_size, config.alignment)?;

    let size = config.input_size as usize;
    let mut tensor = empty_tensor(images.len(), size, size, config.layout);
    for ((image, entry), mut slot) in images
        .iter()
        .zip(input.entries())
        .zip(tensor.axis_iter_mut(Axis(0)))
    {
        let resized = resize_rgb(
            image,
            entry.resized_width,
            entry.resized_height,
            config.resize_quality,
        );
        write_pixels(
            &mut slot,
            &resized,
            (entry.offset_x as usize, entry.offset_y as usize),
            &config.normalization,
            config.layout,
        );
    }

    Ok(NormalizedBatch { tensor, input })
}

/// Stack equally sized images into one tensor without resizing or padding.
pub fn stack_images(
    images: &[RgbImage],
    normalization: &PixelNormalization,
    layout: TensorLayout,
) -> Result<Array4<f32>> {
    let first = images
        .first()
        .ok_or_else(|| FaceError::invalid("cannot stack an empty image list"))?;
    let (w, h) = first.dimensions();
    if w == 0 || h == 0 {
        return Err(FaceError::invalid("cannot stack zero-sized images"));
    }
    if let Some(index) = images.iter().position(|img| img.dimensions() != (w, h)) {
        return Err(FaceError::invalid(format!(
            "image {index} is {:?}, expected {w}x{h}",
            images[index].dimensions()
        )));
    }

    let mut tensor = empty_tensor(images.len(), h as usize, w as usize, layout);
    for (image, mut slot) in images.iter().zip(tensor.axis_iter_mut(Axis(0))) {
        write_pixels(&mut slot, image, (0, 0), normalization, layout);
    }
    Ok(tensor)
}

fn empty_tensor(batch: usize, height: usize, width: usize, layout: TensorLayout) -> Array4<f32> {
    match layout {
        TensorLayout::Nhwc => Array4::zeros((batch, height, width, 3)),
        TensorLayout::Nchw => Array4::zeros((batch, 3, height, width)),
    }
}

fn write_pixels(
    slot: &mut ArrayViewMut3<'_, f32>,
    image: &RgbImage,
    (offset_x, offset_y): (usize, usize),
    normalization: &PixelNormalization,
    layout: TensorLayout,
) {
    for (x, y, pixel) in image.enumerate_pixels() {
        let (xi, yi) = (x as usize + offset_x, y as usize + offset_y);
        for c in 0..3 {
            let value = normalization.apply(c, pixel[c]);
            match layout {
                TensorLayout::Nhwc => slot[(yi, xi, c)] = value,
                TensorLayout::Nchw => slot[(c, yi, xi)] = value,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_scales_longer_side_to_input() {
        let input = NetInput::plan(&[(200, 100), (50, 100)], 100, PadAlignment::Center).unwrap();
        let wide = input.entry(0).unwrap();
        assert_eq!((wide.resized_width, wide.resized_height), (100, 50));
        assert_eq!((wide.offset_x, wide.offset_y), (0, 25));
        assert_eq!(wide.scale_x(), 0.5);

        let tall = input.entry(1).unwrap();
        assert_eq!((tall.resized_width, tall.resized_height), (50, 100));
        assert_eq!((tall.offset_x, tall.offset_y), (25, 0));
        assert_eq!(tall.scale_y(), 1.0);
    }

    #[test]
    fn top_left_alignment_has_no_offset() {
        let input = NetInput::plan(&[(640, 480)], 320, PadAlignment::TopLeft).unwrap();
        let entry = input.entries()[0];
        assert_eq!((entry.offset_x, entry.offset_y), (0, 0));
        assert_eq!((entry.resized_width, entry.resized_height), (320, 240));
    }

    #[test]
    fn network_mapping_inverts() {
        let input = NetInput::plan(&[(300, 120)], 150, PadAlignment::Center).unwrap();
        let entry = input.entries()[0];
        let p = Point::new(123.0, 45.0);
        let back = entry.to_original(entry.to_network(p));
        assert!((back.x - p.x).abs() < 1e-3 && (back.y - p.y).abs() < 1e-3);

        let b = entry.box_to_original(&BoundingBox::new(0.0, 45.0, 150.0, 60.0));
        assert!((b.x - 0.0).abs() < 1e-3);
        assert!((b.y - 0.0).abs() < 1e-3);
        assert!((b.width - 300.0).abs() < 1e-3);
        assert!((b.height - 120.0).abs() < 1e-3);
    }

    #[test]
    fn plan_rejects_empty_and_degenerate_input() {
        assert!(matches!(
            NetInput::plan(&[], 100, PadAlignment::TopLeft),
            Err(FaceError::InvalidInput(_))
        ));
        assert!(NetInput::plan(&[(10, 10)], 0, PadAlignment::TopLeft).is_err());
        assert!(NetInput::plan(&[(10, 0)], 10, PadAlignment::TopLeft).is_err());
    }

    #[test]
    fn normalize_batch_pads_with_zero_and_keeps_order() {
        let red = RgbImage::from_pixel(4, 2, image::Rgb([255, 0, 0]));
        let blue = RgbImage::from_pixel(2, 4, image::Rgb([0, 0, 255]));
        let config = NetInputConfig::new(4).with_alignment(PadAlignment::Center);
        let batch = normalize_batch(&[&red, &blue], &config).unwrap();

        assert_eq!(batch.tensor.shape(), &[2, 4, 4, 3]);
        // red: rows 1..3 filled, rows 0 and 3 padding
        assert_eq!(batch.tensor[(0, 0, 0, 0)], 0.0);
        assert_eq!(batch.tensor[(0, 1, 0, 0)], 255.0);
        assert_eq!(batch.tensor[(0, 3, 3, 0)], 0.0);
        // blue: columns 1..3 filled
        assert_eq!(batch.tensor[(1, 0, 0, 2)], 0.0);
        assert_eq!(batch.tensor[(1, 0, 1, 2)], 255.0);
        assert_eq!(batch.input.batch_size(), 2);
        assert_eq!(batch.input.entries()[1].original_height, 4);
    }

    #[test]
    fn nchw_layout_and_normalization() {
        let image = RgbImage::from_pixel(2, 2, image::Rgb([255, 127, 0]));
        let tensor = stack_images(
            &[image.clone(), image],
            &PixelNormalization::SYMMETRIC,
            TensorLayout::Nchw,
        )
        .unwrap();
        assert_eq!(tensor.shape(), &[2, 3, 2, 2]);
        assert!((tensor[(1, 0, 1, 1)] - 1.0).abs() < 1e-6);
        assert!((tensor[(1, 2, 0, 0)] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn stack_images_rejects_mixed_sizes() {
        let a = RgbImage::new(2, 2);
        let b = RgbImage::new(3, 2);
        assert!(stack_images(&[a, b], &PixelNormalization::IDENTITY, TensorLayout::Nhwc).is_err());
        assert!(stack_images(&[], &PixelNormalization::IDENTITY, TensorLayout::Nhwc).is_err());
    }
}
