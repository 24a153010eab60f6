//! Tiny face detector: a single grid-regression head.

use facelens_utils::{OverlapMetric, ResizeQuality, TinySettings, timing_guard};
use image::RgbImage;
use log::debug;
use ndarray::{Axis, Ix4};

use crate::backend::{Backend, NetworkSet, NetworkSlot, run_network, take_output};
use crate::decode::{GridHead, decode_grid};
use crate::error::{FaceError, Result, ensure_positive, ensure_unit_interval};
use crate::net_input::{NetInputConfig, PadAlignment, PixelNormalization, normalize_batch};
use crate::nms::non_max_suppression;

use super::{DetectedFace, to_detections};

const NETWORK: &str = "tiny";
const GRID_STRIDE: u32 = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct TinyOptions {
    /// Network input size; a multiple of 32.
    pub input_size: u32,
    /// Inclusive lower bound on face score.
    pub score_threshold: f32,
    pub nms_threshold: f32,
    pub head: GridHead,
    pub resize_quality: ResizeQuality,
}

impl Default for TinyOptions {
    fn default() -> Self {
        (&TinySettings::default()).into()
    }
}

impl From<&TinySettings> for TinyOptions {
    fn from(settings: &TinySettings) -> Self {
        Self {
            input_size: settings.input_size,
            score_threshold: settings.score_threshold,
            nms_threshold: settings.nms_threshold,
            head: GridHead::tiny_face(),
            resize_quality: ResizeQuality::Quality,
        }
    }
}

impl TinyOptions {
    pub fn validate(&self) -> Result<()> {
        ensure_positive("tiny input_size", self.input_size)?;
        if self.input_size % GRID_STRIDE != 0 {
            return Err(FaceError::config(format!(
                "tiny input_size must be a multiple of {GRID_STRIDE} (got {})",
                self.input_size
            )));
        }
        ensure_unit_interval("tiny score_threshold", self.score_threshold)?;
        ensure_unit_interval("tiny nms_threshold", self.nms_threshold)?;
        if self.head.anchors.is_empty() {
            return Err(FaceError::config("tiny detector needs at least one box prior"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TinyDetector {
    options: TinyOptions,
}

impl TinyDetector {
    pub fn new(options: TinyOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { options })
    }

    pub fn options(&self) -> &TinyOptions {
        &self.options
    }

    /// Expects one `[N, H, W, A * (5 + C)]` output.
    pub fn detect<B: Backend>(
        &self,
        backend: &B,
        networks: &NetworkSet<B::Network>,
        images: &[&RgbImage],
    ) -> Result<Vec<Vec<DetectedFace>>> {
        let _guard = timing_guard("facelens::tiny::detect", log::Level::Debug);
        let network = networks.require(NetworkSlot::Tiny)?;
        let config = NetInputConfig::new(self.options.input_size)
            .with_alignment(PadAlignment::TopLeft)
            .with_normalization(PixelNormalization::TINY_DETECTOR)
            .with_resize_quality(self.options.resize_quality);
        let batch = normalize_batch(images, &config)?;

        let mut outputs = run_network(backend, NETWORK, network, &batch.tensor)?;
        let grid = take_output(&mut outputs, 0, NETWORK)?
            .into_dimensionality::<Ix4>()
            .map_err(|e| FaceError::output(NETWORK, format!("grid must be rank 4: {e}")))?;
        if grid.len_of(Axis(0)) != images.len() {
            return Err(FaceError::output(
                NETWORK,
                format!("grid batch is {}, expected {}", grid.len_of(Axis(0)), images.len()),
            ));
        }
        let cols = grid.len_of(Axis(2));
        if cols == 0 {
            return Err(FaceError::output(NETWORK, "grid has no cells"));
        }
        let head = GridHead {
            stride: self.options.input_size as f32 / cols as f32,
            ..self.options.head.clone()
        };

        let mut results = Vec::with_capacity(images.len());
        for (index, entry) in batch.input.entries().iter().enumerate() {
            let candidates = decode_grid(
                grid.index_axis(Axis(0), index),
                &head,
                self.options.score_threshold,
            )?;
            let decoded = candidates.len();
            let kept = non_max_suppression(
                candidates,
                self.options.nms_threshold,
                OverlapMetric::Union,
                None,
            );
            debug!("tiny image {index}: {decoded} candidates, {} after nms", kept.len());
            results.push(
                to_detections(&kept, entry)
                    .into_iter()
                    .map(DetectedFace::from)
                    .collect(),
            );
        }
        Ok(results)
    }
}
