//! MTCNN cascade detector.

use std::sync::atomic::{AtomicBool, Ordering};

use facelens_utils::{MtcnnSettings, OverlapMetric, ResizeQuality, timing_guard};
use image::RgbImage;
use log::debug;

use crate::backend::{Backend, NetworkSet, NetworkSlot};
use crate::cascade::{
    CELL_SIZE, StageParams, output_stage, proposal_stage, pyramid_scales, refine_stage,
    scaled_dimensions,
};
use crate::error::{FaceError, Result, ensure_positive, ensure_unit_interval};

use super::{DetectedFace, Detection};

const STAGE_NAMES: [&str; 3] = ["proposal", "refine", "output"];

#[derive(Debug, Clone, PartialEq)]
pub struct MtcnnOptions {
    /// Smallest face, in source pixels, the pyramid is built to find.
    pub min_face_size: u32,
    /// Downscale factor between pyramid levels, in `(0, 1)`.
    pub scale_factor: f32,
    pub max_num_scales: usize,
    /// Explicit pyramid scales, used instead of `min_face_size` and `scale_factor`.
    pub scale_steps: Option<Vec<f32>>,
    /// Proposal, refine and output stage score thresholds.
    pub score_thresholds: [f32; 3],
    pub nms_thresholds: [f32; 3],
    pub stage_metrics: [OverlapMetric; 3],
    pub resize_quality: ResizeQuality,
}

impl Default for MtcnnOptions {
    fn default() -> Self {
        (&MtcnnSettings::default()).into()
    }
}

impl From<&MtcnnSettings> for MtcnnOptions {
    fn from(settings: &MtcnnSettings) -> Self {
        Self {
            min_face_size: settings.min_face_size,
            scale_factor: settings.scale_factor,
            max_num_scales: settings.max_num_scales,
            scale_steps: settings.scale_steps.clone(),
            score_thresholds: settings.score_thresholds,
            nms_thresholds: settings.nms_thresholds,
            stage_metrics: settings.stage_metrics,
            resize_quality: ResizeQuality::Quality,
        }
    }
}

impl MtcnnOptions {
    pub fn validate(&self) -> Result<()> {
        ensure_positive("mtcnn min_face_size", self.min_face_size)?;
        if !(self.scale_factor > 0.0 && self.scale_factor < 1.0) {
            return Err(FaceError::config(format!(
                "mtcnn scale_factor must be within (0, 1) (got {})",
                self.scale_factor
            )));
        }
        if self.max_num_scales == 0 {
            return Err(FaceError::config("mtcnn max_num_scales must be greater than zero"));
        }
        if let Some(steps) = &self.scale_steps {
            if steps.is_empty() {
                return Err(FaceError::config("mtcnn scale_steps must not be empty"));
            }
            if let Some(bad) = steps.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
                return Err(FaceError::config(format!(
                    "mtcnn scale_steps must be positive (got {bad})"
                )));
            }
        }
        for (i, name) in STAGE_NAMES.iter().enumerate() {
            ensure_unit_interval(&format!("mtcnn {name} score threshold"), self.score_thresholds[i])?;
            ensure_unit_interval(&format!("mtcnn {name} nms threshold"), self.nms_thresholds[i])?;
        }
        Ok(())
    }

    /// Pyramid scales used for a `width` x `height` image.
    ///
    /// Levels smaller than one proposal cell are left out; at most `max_num_scales` remain.
    pub fn scales_for(&self, width: u32, height: u32) -> Vec<f32> {
        let candidates = match &self.scale_steps {
            Some(steps) => steps.clone(),
            None => pyramid_scales(
                width,
                height,
                self.min_face_size,
                self.scale_factor,
                self.max_num_scales,
            ),
        };
        candidates
            .into_iter()
            .filter(|&scale| {
                let (w, h) = scaled_dimensions(width, height, scale);
                w.min(h) >= CELL_SIZE
            })
            .take(self.max_num_scales)
            .collect()
    }

    fn stage(&self, index: usize) -> StageParams {
        StageParams {
            score_threshold: self.score_thresholds[index],
            nms_threshold: self.nms_thresholds[index],
            metric: self.stage_metrics[index],
        }
    }
}

#[derive(Debug, Clone)]
pub struct MtcnnDetector {
    options: MtcnnOptions,
}

impl MtcnnDetector {
    pub fn new(options: MtcnnOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { options })
    }

    pub fn options(&self) -> &MtcnnOptions {
        &self.options
    }

    /// Run the full cascade on one image. Every face carries five landmarks.
    pub fn detect<B: Backend>(
        &self,
        backend: &B,
        networks: &NetworkSet<B::Network>,
        image: &RgbImage,
    ) -> Result<Vec<DetectedFace>> {
        self.detect_with_cancel(backend, networks, image, &AtomicBool::new(false))
    }

    /// Like [`detect`](Self::detect), returning [`FaceError::Cancelled`] when `cancel` is set
    /// before a stage starts.
    pub fn detect_with_cancel<B: Backend>(
        &self,
        backend: &B,
        networks: &NetworkSet<B::Network>,
        image: &RgbImage,
        cancel: &AtomicBool,
    ) -> Result<Vec<DetectedFace>> {
        let _guard = timing_guard("facelens::mtcnn::detect", log::Level::Debug);
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(FaceError::invalid("cannot detect faces in an empty image"));
        }
        let proposal = networks.require(NetworkSlot::MtcnnProposal)?;
        let refine = networks.require(NetworkSlot::MtcnnRefine)?;
        let output = networks.require(NetworkSlot::MtcnnOutput)?;
        let checkpoint = || {
            if cancel.load(Ordering::Relaxed) {
                Err(FaceError::Cancelled)
            } else {
                Ok(())
            }
        };
        let quality = self.options.resize_quality;

        let scales = self.options.scales_for(width, height);
        if scales.is_empty() {
            debug!("mtcnn: {width}x{height} image is smaller than the minimum face size");
            return Ok(Vec::new());
        }

        checkpoint()?;
        let proposals = proposal_stage(backend, proposal, image, &scales, &self.options.stage(0), quality)?;
        debug!("mtcnn: {} proposals from {} scales", proposals.len(), scales.len());

        checkpoint()?;
        let refined = refine_stage(backend, refine, image, &proposals, &self.options.stage(1), quality)?;

        checkpoint()?;
        let faces = output_stage(backend, output, image, &refined, &self.options.stage(2), quality)?;
        debug!("mtcnn: {} faces", faces.len());

        Ok(faces
            .into_iter()
            .map(|(candidate, landmarks)| DetectedFace {
                detection: Detection::new(
                    candidate.bbox,
                    candidate.score.clamp(0.0, 1.0),
                    width,
                    height,
                ),
                landmarks: Some(landmarks),
            })
            .collect())
    }
}
