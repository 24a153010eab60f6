//! Landmark sets and the coordinate frames they are decoded in.
//!
//! Landmark networks see a crop of the source image that has been resized and padded. A
//! [`LandmarkFrame`] captures that chain once, and [`remap_landmarks`] applies it to produce a
//! fresh [`LandmarkSet`] in original-image coordinates. Nothing here mutates in place, so a
//! frame can never be applied twice to the same set.

use serde::{Deserialize, Serialize};

use crate::error::{FaceError, Result};
use crate::geometry::{BoundingBox, Point, center_of};
use crate::net_input::BatchEntry;

/// Number of points predicted by the 68-point landmark networks.
pub const LANDMARKS_68: usize = 68;
/// Number of points predicted by the MTCNN output stage.
pub const LANDMARKS_5: usize = 5;

/// Facial landmarks in absolute original-image coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandmarkSet {
    pub positions: Vec<Point>,
    pub image_width: u32,
    pub image_height: u32,
    /// Origin of the crop the positions were computed in; zero for full-image landmarks.
    pub shift: Point,
}

impl LandmarkSet {
    pub fn new(positions: Vec<Point>, image_width: u32, image_height: u32) -> Self {
        Self {
            positions,
            image_width,
            image_height,
            shift: Point::ORIGIN,
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Positions relative to the crop they were predicted in.
    pub fn relative_positions(&self) -> Vec<Point> {
        self.positions.iter().map(|p| *p - self.shift).collect()
    }

    /// Smallest box around every position.
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        BoundingBox::enclosing(&self.positions)
    }

    /// Left eye, right eye and mouth centres.
    ///
    /// Supports the 68-point layout (eyes 36-41 and 42-47, mouth 48-67) and the 5-point layout
    /// (eyes 0 and 1, mouth corners 3 and 4).
    pub fn reference_points(&self) -> Result<[Point; 3]> {
        let p = &self.positions;
        let centre = |points: &[Point]| center_of(points).unwrap_or_default();
        match p.len() {
            LANDMARKS_68 => Ok([centre(&p[36..42]), centre(&p[42..48]), centre(&p[48..68])]),
            LANDMARKS_5 => Ok([p[0], p[1], centre(&p[3..5])]),
            other => Err(FaceError::invalid(format!(
                "reference points need 5 or 68 landmarks, got {other}"
            ))),
        }
    }

    pub fn left_eye(&self) -> Result<Point> {
        Ok(self.reference_points()?[0])
    }

    pub fn right_eye(&self) -> Result<Point> {
        Ok(self.reference_points()?[1])
    }

    pub fn mouth(&self) -> Result<Point> {
        Ok(self.reference_points()?[2])
    }
}

/// Affine map from a network's local coordinates onto the original image.
///
/// `remap(p) = origin + (p - shift) / scale`, applied per axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LandmarkFrame {
    /// Top-left of the crop in the original image.
    pub origin: Point,
    pub scale_x: f32,
    pub scale_y: f32,
    /// Padding offset inside the network input.
    pub shift: Point,
}

impl LandmarkFrame {
    /// Frame of the full image: the identity map.
    pub const IDENTITY: Self = Self {
        origin: Point::ORIGIN,
        scale_x: 1.0,
        scale_y: 1.0,
        shift: Point::ORIGIN,
    };

    /// Frame of a crop at `crop_origin` that was resized and padded as described by `entry`.
    pub fn for_patch(crop_origin: Point, entry: &BatchEntry) -> Self {
        Self {
            origin: crop_origin,
            scale_x: entry.scale_x(),
            scale_y: entry.scale_y(),
            shift: entry.offset(),
        }
    }

    /// Frame for points given as fractions of `bbox` (0 at the left/top edge, 1 at the right/bottom).
    pub fn relative_to_box(bbox: &BoundingBox) -> Self {
        Self {
            origin: bbox.top_left(),
            scale_x: 1.0 / bbox.width,
            scale_y: 1.0 / bbox.height,
            shift: Point::ORIGIN,
        }
    }

    pub fn remap(&self, p: Point) -> Point {
        Point::new(
            self.origin.x + (p.x - self.shift.x) / self.scale_x,
            self.origin.y + (p.y - self.shift.y) / self.scale_y,
        )
    }

    pub fn unmap(&self, q: Point) -> Point {
        Point::new(
            (q.x - self.origin.x) * self.scale_x + self.shift.x,
            (q.y - self.origin.y) * self.scale_y + self.shift.y,
        )
    }

    fn is_valid(&self) -> bool {
        self.scale_x.is_finite() && self.scale_y.is_finite() && self.scale_x > 0.0 && self.scale_y > 0.0
    }
}

/// Map local points through `frame` into a new set on an `image_width` x `image_height` image.
pub fn remap_landmarks(
    local: &[Point],
    frame: &LandmarkFrame,
    image_width: u32,
    image_height: u32,
) -> LandmarkSet {
    LandmarkSet {
        positions: local.iter().map(|p| frame.remap(*p)).collect(),
        image_width,
        image_height,
        shift: frame.origin,
    }
}

/// Decode one row of a landmark network output.
///
/// `row` holds interleaved `x0, y0, x1, y1, ...` values relative to the square `input_size`
/// network input. `crop` is the (whole-pixel) box the network input was cut from and `entry` the
/// resize/padding applied to it.
pub fn decode_landmark_output(
    row: &[f32],
    input_size: u32,
    entry: &BatchEntry,
    crop: &BoundingBox,
    image_width: u32,
    image_height: u32,
) -> Result<LandmarkSet> {
    if row.is_empty() || row.len() % 2 != 0 {
        return Err(FaceError::output(
            "landmarks",
            format!("expected an even number of coordinates, got {}", row.len()),
        ));
    }
    let frame = LandmarkFrame::for_patch(crop.top_left(), entry);
    if !frame.is_valid() {
        return Err(FaceError::invalid(format!("crop {crop:?} has no extent")));
    }
    let s = input_size as f32;
    let local: Vec<Point> = row
        .chunks_exact(2)
        .map(|xy| Point::new(xy[0] * s, xy[1] * s))
        .collect();
    Ok(remap_landmarks(&local, &frame, image_width, image_height))
}
