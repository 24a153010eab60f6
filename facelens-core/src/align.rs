//! Alignment boxes: the square crop handed to the recognition network.

use facelens_utils::{AlignmentKind, AlignmentSettings};

use crate::detector::Detection;
use crate::error::{FaceError, Result};
use crate::geometry::{BoundingBox, center_of};
use crate::landmarks::LandmarkSet;

const DLIB_REL_X: f32 = 0.5;
const DLIB_REL_Y: f32 = 0.43;
const DLIB_REL_SCALE: f32 = 0.5;

/// Strategy for deriving the alignment box from landmarks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AlignmentOptions {
    /// Box around the eye and mouth centres, grown by `margin` of each side.
    ReferencePoints { margin: f32 },
    /// Box around every landmark, grown by `padding` of each side.
    MinBoundingBox { padding: f32 },
    /// Square sized from the mean eye-to-mouth distance and placed around the reference centre.
    Dlib,
}

impl Default for AlignmentOptions {
    fn default() -> Self {
        AlignmentOptions::ReferencePoints { margin: 0.2 }
    }
}

impl AlignmentOptions {
    pub fn validate(&self) -> Result<()> {
        let amount = match *self {
            AlignmentOptions::ReferencePoints { margin } => margin,
            AlignmentOptions::MinBoundingBox { padding } => padding,
            AlignmentOptions::Dlib => return Ok(()),
        };
        if amount.is_finite() && amount >= 0.0 {
            Ok(())
        } else {
            Err(FaceError::config(format!(
                "alignment margin must be a non-negative number (got {amount})"
            )))
        }
    }
}

impl From<&AlignmentSettings> for AlignmentOptions {
    fn from(settings: &AlignmentSettings) -> Self {
        match settings.kind {
            AlignmentKind::ReferencePoints => AlignmentOptions::ReferencePoints {
                margin: settings.margin,
            },
            AlignmentKind::MinBoundingBox => AlignmentOptions::MinBoundingBox {
                padding: settings.margin,
            },
            AlignmentKind::Dlib => AlignmentOptions::Dlib,
        }
    }
}

/// Compute the square alignment box of a detected face, clipped to its image.
///
/// The result can be non-square when clipping cuts it at an image border.
pub fn alignment_box(
    detection: &Detection,
    landmarks: &LandmarkSet,
    options: &AlignmentOptions,
) -> Result<BoundingBox> {
    options.validate()?;
    if landmarks.is_empty() {
        return Err(FaceError::invalid("cannot align a face without landmarks"));
    }

    let raw = match *options {
        AlignmentOptions::ReferencePoints { margin } => {
            let refs = landmarks.reference_points()?;
            let tight = BoundingBox::enclosing(&refs)
                .ok_or_else(|| FaceError::invalid("no reference points"))?;
            tight.pad(tight.width * margin, tight.height * margin)
        }
        AlignmentOptions::MinBoundingBox { padding } => {
            let tight = landmarks
                .bounding_box()
                .ok_or_else(|| FaceError::invalid("no landmark positions"))?;
            tight.pad(tight.width * padding, tight.height * padding)
        }
        AlignmentOptions::Dlib => dlib_box(landmarks)?,
    };

    let aligned = raw
        .pad_to_square()
        .clip_to_image(detection.image_width, detection.image_height);
    if aligned.is_degenerate() {
        return Err(FaceError::invalid(format!(
            "alignment box {raw:?} lies outside the {}x{} image",
            detection.image_width, detection.image_height
        )));
    }
    Ok(aligned)
}

fn dlib_box(landmarks: &LandmarkSet) -> Result<BoundingBox> {
    let refs = landmarks.reference_points()?;
    let [left_eye, right_eye, mouth] = refs;
    let eye_to_mouth = (mouth.distance(left_eye) + mouth.distance(right_eye)) / 2.0;
    let size = (eye_to_mouth / DLIB_REL_SCALE).floor();
    let centre = center_of(&refs).unwrap_or_default();
    let x = (centre.x - DLIB_REL_X * size).max(0.0).floor();
    let y = (centre.y - DLIB_REL_Y * size).max(0.0).floor();
    Ok(BoundingBox::new(x, y, size, size))
}
