//! Face detectors.
//!
//! [`FaceDetector`] is a closed set of detector variants, picked from [`DetectorOptions`] once at
//! construction. Every variant maps its boxes back onto each source image, clips them and drops
//! boxes that end up empty.

pub mod mtcnn;
pub mod ssd;
pub mod tiny;

use facelens_utils::DetectorSettings;
use image::RgbImage;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::backend::{Backend, NetworkSet};
use crate::decode::Candidate;
use crate::error::{FaceError, Result};
use crate::geometry::BoundingBox;
use crate::landmarks::LandmarkSet;
use crate::net_input::BatchEntry;

pub use mtcnn::{MtcnnDetector, MtcnnOptions};
pub use ssd::{SsdDetector, SsdOptions};
pub use tiny::{TinyDetector, TinyOptions};

/// A face location in original-image pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub score: f32,
    /// Dimensions of the image the box belongs to.
    pub image_width: u32,
    pub image_height: u32,
    pub class_label: Option<String>,
}

impl Detection {
    pub fn new(bbox: BoundingBox, score: f32, image_width: u32, image_height: u32) -> Self {
        Self {
            bbox,
            score,
            image_width,
            image_height,
            class_label: None,
        }
    }

    pub fn with_class_label(mut self, label: impl Into<String>) -> Self {
        self.class_label = Some(label.into());
        self
    }

    /// Box as fractions of the image dimensions.
    pub fn relative_box(&self) -> BoundingBox {
        self.bbox
            .rescale(1.0 / self.image_width as f32, 1.0 / self.image_height as f32)
    }
}

/// A detection plus the landmarks the detector produced with it, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub detection: Detection,
    pub landmarks: Option<LandmarkSet>,
}

impl From<Detection> for DetectedFace {
    fn from(detection: Detection) -> Self {
        Self {
            detection,
            landmarks: None,
        }
    }
}

/// Validated options of one detector variant.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorOptions {
    Ssd(SsdOptions),
    Tiny(TinyOptions),
    Mtcnn(MtcnnOptions),
}

impl Default for DetectorOptions {
    fn default() -> Self {
        DetectorOptions::Ssd(SsdOptions::default())
    }
}

impl DetectorOptions {
    pub fn validate(&self) -> Result<()> {
        match self {
            DetectorOptions::Ssd(o) => o.validate(),
            DetectorOptions::Tiny(o) => o.validate(),
            DetectorOptions::Mtcnn(o) => o.validate(),
        }
    }
}

impl From<&DetectorSettings> for DetectorOptions {
    fn from(settings: &DetectorSettings) -> Self {
        match settings {
            DetectorSettings::Ssd(s) => DetectorOptions::Ssd(s.into()),
            DetectorSettings::Tiny(s) => DetectorOptions::Tiny(s.into()),
            DetectorSettings::Mtcnn(s) => DetectorOptions::Mtcnn(s.into()),
        }
    }
}

/// A ready-to-run detector.
#[derive(Debug, Clone)]
pub enum FaceDetector {
    Ssd(SsdDetector),
    Tiny(TinyDetector),
    Mtcnn(MtcnnDetector),
}

impl FaceDetector {
    /// Validate `options` and build the matching detector.
    pub fn new(options: &DetectorOptions) -> Result<Self> {
        options.validate()?;
        Ok(match options {
            DetectorOptions::Ssd(o) => FaceDetector::Ssd(SsdDetector::new(o.clone())?),
            DetectorOptions::Tiny(o) => FaceDetector::Tiny(TinyDetector::new(o.clone())?),
            DetectorOptions::Mtcnn(o) => FaceDetector::Mtcnn(MtcnnDetector::new(o.clone())?),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            FaceDetector::Ssd(_) => "ssd",
            FaceDetector::Tiny(_) => "tiny",
            FaceDetector::Mtcnn(_) => "mtcnn",
        }
    }

    /// Detect faces in every image; result `i` belongs to `images[i]`.
    pub fn detect<B: Backend>(
        &self,
        backend: &B,
        networks: &NetworkSet<B::Network>,
        images: &[&RgbImage],
    ) -> Result<Vec<Vec<DetectedFace>>> {
        if images.is_empty() {
            return Err(FaceError::invalid("no images to detect faces in"));
        }
        match self {
            FaceDetector::Ssd(d) => d.detect(backend, networks, images),
            FaceDetector::Tiny(d) => d.detect(backend, networks, images),
            FaceDetector::Mtcnn(d) => images
                .iter()
                .map(|image| d.detect(backend, networks, image))
                .collect(),
        }
    }
}

/// Map network-space candidates onto their source image, clip, and drop boxes that cover no
/// whole pixel.
///
/// Candidates with a class index are labelled `class_<index>`.
pub(crate) fn to_detections(candidates: &[Candidate], entry: &BatchEntry) -> Vec<Detection> {
    let (w, h) = (entry.original_width, entry.original_height);
    candidates
        .iter()
        .filter_map(|c| {
            let bbox = entry.box_to_original(&c.bbox).clip_to_image(w, h);
            if bbox.covers_no_pixel() {
                debug!("dropping degenerate detection {:?} (score {:.3})", c.bbox, c.score);
                return None;
            }
            let detection = Detection::new(bbox, c.score.clamp(0.0, 1.0), w, h);
            Some(match c.class_index {
                Some(class) => detection.with_class_label(format!("class_{class}")),
                None => detection,
            })
        })
        .collect()
}
