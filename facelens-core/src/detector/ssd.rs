//! SSD MobileNet v1 face detector.

use facelens_utils::{OverlapMetric, ResizeQuality, SsdSettings, timing_guard};
use image::RgbImage;
use log::debug;
use ndarray::{ArrayD, ArrayView2, Axis, Ix3, s};

use crate::backend::{Backend, NetworkSet, NetworkSlot, run_network, take_output};
use crate::decode::{AnchorLayer, AnchorSet, BoxCoder, ScoreActivation, decode_anchor_boxes};
use crate::error::{FaceError, Result, ensure_positive, ensure_unit_interval};
use crate::net_input::{NetInputConfig, PadAlignment, PixelNormalization, normalize_batch};
use crate::nms::non_max_suppression;

use super::{DetectedFace, to_detections};

const NETWORK: &str = "ssd";

/// Anchor scale range of the multi-scale anchor generator.
const MIN_SCALE: f32 = 0.2;
const MAX_SCALE: f32 = 0.95;
/// Input pixels per feature-map cell of each box-predictor layer.
const LAYER_STRIDES: [u32; 6] = [16, 32, 64, 128, 256, 512];

#[derive(Debug, Clone, PartialEq)]
pub struct SsdOptions {
    pub input_size: u32,
    /// Inclusive lower bound on face confidence.
    pub min_confidence: f32,
    pub nms_threshold: f32,
    pub max_results: usize,
    pub coder: BoxCoder,
    pub activation: ScoreActivation,
    /// Score column holding the face class; the last column when unset.
    pub score_column: Option<usize>,
    /// Anchors shipped with the model; generated from `input_size` when unset.
    pub anchors: Option<AnchorSet>,
    pub resize_quality: ResizeQuality,
}

impl Default for SsdOptions {
    fn default() -> Self {
        (&SsdSettings::default()).into()
    }
}

impl From<&SsdSettings> for SsdOptions {
    fn from(settings: &SsdSettings) -> Self {
        Self {
            input_size: settings.input_size,
            min_confidence: settings.min_confidence,
            nms_threshold: settings.nms_threshold,
            max_results: settings.max_results,
            coder: BoxCoder::SSD_MOBILENET,
            activation: ScoreActivation::Sigmoid,
            score_column: None,
            anchors: None,
            resize_quality: ResizeQuality::Quality,
        }
    }
}

impl SsdOptions {
    pub fn validate(&self) -> Result<()> {
        ensure_positive("ssd input_size", self.input_size)?;
        ensure_unit_interval("ssd min_confidence", self.min_confidence)?;
        ensure_unit_interval("ssd nms_threshold", self.nms_threshold)?;
        if self.max_results == 0 {
            return Err(FaceError::config("ssd max_results must be greater than zero"));
        }
        if !(self.coder.center_variance > 0.0 && self.coder.size_variance > 0.0) {
            return Err(FaceError::config("ssd box coder variances must be positive"));
        }
        Ok(())
    }
}

/// Multi-scale grid anchors of the MobileNet v1 SSD box predictor.
///
/// The first layer carries three anchors per cell (a small 0.1 box plus two aspect ratios); the
/// others carry five aspect ratios plus one box at the geometric mean of neighbouring scales.
pub fn ssd_mobilenet_anchors(input_size: u32) -> AnchorSet {
    let size = input_size as f32;
    let count = LAYER_STRIDES.len();
    let scale_at = |i: usize| {
        if i >= count {
            1.0
        } else {
            MIN_SCALE + (MAX_SCALE - MIN_SCALE) * i as f32 / (count - 1) as f32
        }
    };
    let boxed = |scale: f32, aspect: f32| {
        let root = aspect.sqrt();
        (scale * root * size, scale / root * size)
    };

    let layers: Vec<AnchorLayer> = LAYER_STRIDES
        .iter()
        .enumerate()
        .map(|(i, &stride)| {
            let cells = input_size.div_ceil(stride).max(1) as usize;
            let scale = scale_at(i);
            let sizes = if i == 0 {
                vec![boxed(0.1, 1.0), boxed(scale, 2.0), boxed(scale, 0.5)]
            } else {
                let mut sizes: Vec<(f32, f32)> = [1.0, 2.0, 0.5, 3.0, 1.0 / 3.0]
                    .iter()
                    .map(|&aspect| boxed(scale, aspect))
                    .collect();
                sizes.push(boxed((scale * scale_at(i + 1)).sqrt(), 1.0));
                sizes
            };
            AnchorLayer {
                stride: size / cells as f32,
                feature_width: cells,
                feature_height: cells,
                sizes,
            }
        })
        .collect();
    AnchorSet::generate(&layers)
}

#[derive(Debug, Clone)]
pub struct SsdDetector {
    options: SsdOptions,
    anchors: AnchorSet,
}

impl SsdDetector {
    pub fn new(options: SsdOptions) -> Result<Self> {
        options.validate()?;
        let anchors = options
            .anchors
            .clone()
            .unwrap_or_else(|| ssd_mobilenet_anchors(options.input_size));
        Ok(Self { options, anchors })
    }

    pub fn options(&self) -> &SsdOptions {
        &self.options
    }

    pub fn anchors(&self) -> &AnchorSet {
        &self.anchors
    }

    /// Expects two outputs: box encodings `[N, A, 4]` and class scores `[N, A, C]`.
    pub fn detect<B: Backend>(
        &self,
        backend: &B,
        networks: &NetworkSet<B::Network>,
        images: &[&RgbImage],
    ) -> Result<Vec<Vec<DetectedFace>>> {
        let _guard = timing_guard("facelens::ssd::detect", log::Level::Debug);
        let network = networks.require(NetworkSlot::Ssd)?;
        let config = NetInputConfig::new(self.options.input_size)
            .with_alignment(PadAlignment::TopLeft)
            .with_normalization(PixelNormalization::SYMMETRIC)
            .with_resize_quality(self.options.resize_quality);
        let batch = normalize_batch(images, &config)?;

        let mut outputs = run_network(backend, NETWORK, network, &batch.tensor)?;
        let boxes = batched(take_output(&mut outputs, 0, NETWORK)?, images.len(), "box encodings")?;
        let scores = batched(take_output(&mut outputs, 1, NETWORK)?, images.len(), "scores")?;

        let mut results = Vec::with_capacity(images.len());
        for (index, entry) in batch.input.entries().iter().enumerate() {
            let regression = boxes.index_axis(Axis(0), index);
            let score_rows = scores.index_axis(Axis(0), index);
            let score_rows = self.face_scores(score_rows)?;
            let candidates = decode_anchor_boxes(
                regression,
                score_rows,
                &self.anchors,
                &self.options.coder,
                self.options.activation,
                self.options.min_confidence,
            )?;
            let decoded = candidates.len();
            let kept = non_max_suppression(
                candidates,
                self.options.nms_threshold,
                OverlapMetric::Union,
                Some(self.options.max_results),
            );
            debug!("ssd image {index}: {decoded} candidates, {} after nms", kept.len());
            results.push(
                to_detections(&kept, entry)
                    .into_iter()
                    .map(DetectedFace::from)
                    .collect(),
            );
        }
        Ok(results)
    }

    fn face_scores<'a>(&self, rows: ArrayView2<'a, f32>) -> Result<ArrayView2<'a, f32>> {
        let columns = rows.ncols();
        let column = match (self.options.activation, self.options.score_column) {
            (ScoreActivation::Softmax2, _) => return Ok(rows),
            (_, Some(column)) => column,
            (_, None) => columns.saturating_sub(1),
        };
        if column >= columns {
            return Err(FaceError::output(
                NETWORK,
                format!("score column {column} out of range for {columns} classes"),
            ));
        }
        Ok(rows.slice_move(s![.., column..=column]))
    }
}

fn batched(array: ArrayD<f32>, batch: usize, what: &str) -> Result<ndarray::Array3<f32>> {
    let array = array
        .into_dimensionality::<Ix3>()
        .map_err(|e| FaceError::output(NETWORK, format!("{what} must be rank 3: {e}")))?;
    if array.len_of(Axis(0)) != batch {
        return Err(FaceError::output(
            NETWORK,
            format!("{what} batch is {}, expected {batch}", array.len_of(Axis(0))),
        ));
    }
    Ok(array)
}
