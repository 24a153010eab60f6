//! The three MTCNN stages.
//!
//! The proposal net scans an image pyramid with a 12x12 window. Its proposals are cut from the
//! original image and rescored by the refine net at 24x24, and the survivors by the output net
//! at 48x48, which also places five landmarks. Every stage thresholds, suppresses and then moves
//! its boxes by the regressed corner offsets. Boxes leaving a stage are in original-image pixels.

use facelens_utils::{OverlapMetric, ResizeQuality, resize_rgb, timing_guard};
use image::RgbImage;
use log::debug;
use ndarray::{Array, Array2, ArrayD, ArrayView2, ArrayView3, Axis, Dimension, Ix2, Ix4, s};

use crate::backend::{Backend, run_network, take_output};
use crate::decode::Candidate;
use crate::error::{FaceError, Result};
use crate::geometry::{BoundingBox, Point};
use crate::landmarks::{LandmarkFrame, LandmarkSet, remap_landmarks};
use crate::net_input::{PixelNormalization, TensorLayout, stack_images};
use crate::nms::suppress_indices;
use crate::patch::extract_resized;

/// Side of the proposal net's receptive window.
pub const CELL_SIZE: u32 = 12;
/// Step between neighbouring proposal cells, in pyramid-level pixels.
const CELL_STRIDE: f32 = 2.0;
/// Suppression applied inside one pyramid level before levels are pooled.
const LEVEL_NMS_THRESHOLD: f32 = 0.5;
pub const REFINE_INPUT_SIZE: u32 = 24;
pub const OUTPUT_INPUT_SIZE: u32 = 48;
/// Landmarks placed by the output net.
pub const OUTPUT_LANDMARKS: usize = 5;

const PROPOSAL: &str = "pnet";
const REFINE: &str = "rnet";
const OUTPUT: &str = "onet";

/// Thresholds of a single stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageParams {
    /// Inclusive lower bound on the face probability.
    pub score_threshold: f32,
    pub nms_threshold: f32,
    pub metric: OverlapMetric,
}

/// A scored box with the corner offsets its network regressed for it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Proposal {
    pub bbox: BoundingBox,
    pub score: f32,
    pub region: [f32; 4],
}

/// Pyramid scales for a `width` x `height` image.
///
/// The first level maps `min_face_size` onto the 12 pixel window; each further level shrinks by
/// `scale_factor` while the smaller image side still covers a window.
pub fn pyramid_scales(
    width: u32,
    height: u32,
    min_face_size: u32,
    scale_factor: f32,
    max_num_scales: usize,
) -> Vec<f32> {
    let cell = CELL_SIZE as f32;
    let mut scale = cell / min_face_size.max(1) as f32;
    let mut min_layer = width.min(height) as f32 * scale;
    let mut scales = Vec::new();
    while min_layer >= cell && scales.len() < max_num_scales {
        scales.push(scale);
        scale *= scale_factor;
        min_layer *= scale_factor;
    }
    scales
}

/// Image dimensions at pyramid `scale`, rounded down.
pub fn scaled_dimensions(width: u32, height: u32, scale: f32) -> (u32, u32) {
    (
        (width as f32 * scale).floor() as u32,
        (height as f32 * scale).floor() as u32,
    )
}

/// Cells of one pyramid level whose face probability reaches `threshold`.
///
/// `faces` is `[H, W]` and `regions` `[H, W, 4]`; boxes are mapped back to original pixels.
pub fn proposal_cells(
    faces: ArrayView2<'_, f32>,
    regions: ArrayView3<'_, f32>,
    scale: f32,
    threshold: f32,
) -> Vec<Proposal> {
    let cell = CELL_SIZE as f32;
    faces
        .indexed_iter()
        .filter(|&(_, &score)| score >= threshold)
        .map(|((y, x), &score)| {
            let (cx, cy) = (x as f32 * CELL_STRIDE, y as f32 * CELL_STRIDE);
            let bbox = BoundingBox::from_corners(
                ((cx + 1.0) / scale).round(),
                ((cy + 1.0) / scale).round(),
                ((cx + cell) / scale).round(),
                ((cy + cell) / scale).round(),
            );
            let region = [
                regions[[y, x, 0]],
                regions[[y, x, 1]],
                regions[[y, x, 2]],
                regions[[y, x, 3]],
            ];
            Proposal {
                bbox,
                score,
                region,
            }
        })
        .collect()
}

fn suppress(proposals: Vec<Proposal>, threshold: f32, metric: OverlapMetric) -> Vec<Proposal> {
    let boxes: Vec<BoundingBox> = proposals.iter().map(|p| p.bbox).collect();
    let scores: Vec<f32> = proposals.iter().map(|p| p.score).collect();
    suppress_indices(&boxes, &scores, threshold, metric, None)
        .into_iter()
        .map(|i| proposals[i])
        .collect()
}

/// Apply the regressed offsets and fit the box to the image; `None` when nothing is left.
fn finish_box(
    bbox: &BoundingBox,
    region: [f32; 4],
    square: bool,
    width: u32,
    height: u32,
) -> Option<BoundingBox> {
    let calibrated = bbox.calibrate(region);
    let shaped = if square {
        calibrated.pad_to_square().round()
    } else {
        calibrated
    };
    let clipped = shaped.clip_to_image(width, height);
    if clipped.covers_no_pixel() {
        debug!("dropping degenerate cascade box {calibrated:?}");
        None
    } else {
        Some(clipped)
    }
}

fn shaped<D: Dimension>(array: ArrayD<f32>, network: &str, what: &str) -> Result<Array<f32, D>> {
    array
        .into_dimensionality::<D>()
        .map_err(|e| FaceError::output(network, format!("unexpected {what} rank: {e}")))
}

/// Run the proposal net over every pyramid level and pool the results.
///
/// Returns square, whole-pixel boxes clipped to the image.
pub fn proposal_stage<B: Backend>(
    backend: &B,
    network: &B::Network,
    image: &RgbImage,
    scales: &[f32],
    stage: &StageParams,
    quality: ResizeQuality,
) -> Result<Vec<Candidate>> {
    let _guard = timing_guard("facelens::mtcnn::proposal", log::Level::Debug);
    let (width, height) = image.dimensions();
    let mut pooled = Vec::new();
    for &scale in scales {
        let (level_w, level_h) = scaled_dimensions(width, height, scale);
        if level_w.min(level_h) < CELL_SIZE {
            debug!("skipping pyramid level {scale:.3}: {level_w}x{level_h} is below one cell");
            continue;
        }
        let level = resize_rgb(image, level_w, level_h, quality);
        let tensor = stack_images(
            std::slice::from_ref(&level),
            &PixelNormalization::MTCNN,
            TensorLayout::Nhwc,
        )?;
        let mut outputs = run_network(backend, PROPOSAL, network, &tensor)?;
        let prob = shaped::<Ix4>(take_output(&mut outputs, 0, PROPOSAL)?, PROPOSAL, "prob")?;
        let regions = shaped::<Ix4>(take_output(&mut outputs, 1, PROPOSAL)?, PROPOSAL, "regions")?;
        if prob.len_of(Axis(0)) == 0
            || prob.len_of(Axis(3)) < 2
            || regions.len_of(Axis(3)) < 4
            || prob.shape()[..3] != regions.shape()[..3]
        {
            return Err(FaceError::output(
                PROPOSAL,
                format!(
                    "prob {:?} and regions {:?} do not describe the same grid",
                    prob.shape(),
                    regions.shape()
                ),
            ));
        }

        let cells = proposal_cells(
            prob.slice(s![0, .., .., 1]),
            regions.slice(s![0, .., .., ..]),
            scale,
            stage.score_threshold,
        );
        let found = cells.len();
        let kept = suppress(cells, LEVEL_NMS_THRESHOLD, OverlapMetric::Union);
        debug!("pnet level {scale:.3}: {found} cells, {} after nms", kept.len());
        pooled.extend(kept);
    }

    let pooled = suppress(pooled, stage.nms_threshold, stage.metric);
    Ok(pooled
        .iter()
        .filter_map(|p| {
            finish_box(&p.bbox, p.region, true, width, height).map(|b| Candidate::new(b, p.score))
        })
        .collect())
}

struct PatchOutputs {
    scores: Array2<f32>,
    regions: Array2<f32>,
    points: Option<Array2<f32>>,
}

impl PatchOutputs {
    fn face_score(&self, row: usize) -> f32 {
        self.scores[[row, 1]]
    }

    fn region(&self, row: usize) -> [f32; 4] {
        let r = self.regions.row(row);
        [r[0], r[1], r[2], r[3]]
    }
}

/// Cut every proposal out of `image`, resize to `size` and run `network` on the batch.
#[allow(clippy::too_many_arguments)]
fn run_patches<B: Backend>(
    backend: &B,
    network: &B::Network,
    name: &str,
    image: &RgbImage,
    proposals: &[Candidate],
    size: u32,
    quality: ResizeQuality,
    with_points: bool,
) -> Result<PatchOutputs> {
    let patches = proposals
        .iter()
        .map(|p| extract_resized(image, &p.bbox, size, size, quality))
        .collect::<Result<Vec<_>>>()?;
    let tensor = stack_images(&patches, &PixelNormalization::MTCNN, TensorLayout::Nhwc)?;
    let mut outputs = run_network(backend, name, network, &tensor)?;

    let rows = proposals.len();
    let mut column_output = |index: usize, what: &str, columns: usize| -> Result<Array2<f32>> {
        let array = shaped::<Ix2>(take_output(&mut outputs, index, name)?, name, what)?;
        if array.nrows() != rows || array.ncols() < columns {
            return Err(FaceError::output(
                name,
                format!(
                    "{what} is {:?}, expected {rows} rows of {columns} values",
                    array.shape()
                ),
            ));
        }
        Ok(array)
    };
    let scores = column_output(0, "scores", 2)?;
    let regions = column_output(1, "regions", 4)?;
    let points = if with_points {
        Some(column_output(2, "points", 2 * OUTPUT_LANDMARKS)?)
    } else {
        None
    };
    Ok(PatchOutputs {
        scores,
        regions,
        points,
    })
}

/// Rows passing the score threshold that survive suppression, best first.
fn select(proposals: &[Candidate], outputs: &PatchOutputs, stage: &StageParams) -> Vec<usize> {
    let passing: Vec<usize> = (0..proposals.len())
        .filter(|&i| outputs.face_score(i) >= stage.score_threshold)
        .collect();
    let boxes: Vec<BoundingBox> = passing.iter().map(|&i| proposals[i].bbox).collect();
    let scores: Vec<f32> = passing.iter().map(|&i| outputs.face_score(i)).collect();
    suppress_indices(&boxes, &scores, stage.nms_threshold, stage.metric, None)
        .into_iter()
        .map(|k| passing[k])
        .collect()
}

/// Rescore proposals with the refine net.
pub fn refine_stage<B: Backend>(
    backend: &B,
    network: &B::Network,
    image: &RgbImage,
    proposals: &[Candidate],
    stage: &StageParams,
    quality: ResizeQuality,
) -> Result<Vec<Candidate>> {
    if proposals.is_empty() {
        return Ok(Vec::new());
    }
    let _guard = timing_guard("facelens::mtcnn::refine", log::Level::Debug);
    let (width, height) = image.dimensions();
    let outputs = run_patches(
        backend,
        network,
        REFINE,
        image,
        proposals,
        REFINE_INPUT_SIZE,
        quality,
        false,
    )?;
    let kept = select(proposals, &outputs, stage);
    debug!("rnet: {} proposals, {} kept", proposals.len(), kept.len());
    Ok(kept
        .into_iter()
        .filter_map(|i| {
            finish_box(&proposals[i].bbox, outputs.region(i), true, width, height)
                .map(|b| Candidate::new(b, outputs.face_score(i)))
        })
        .collect())
}

/// Final scoring with the output net, which also places five landmarks per face.
///
/// Landmarks are given as fractions of the proposal box and returned in image pixels.
pub fn output_stage<B: Backend>(
    backend: &B,
    network: &B::Network,
    image: &RgbImage,
    proposals: &[Candidate],
    stage: &StageParams,
    quality: ResizeQuality,
) -> Result<Vec<(Candidate, LandmarkSet)>> {
    if proposals.is_empty() {
        return Ok(Vec::new());
    }
    let _guard = timing_guard("facelens::mtcnn::output", log::Level::Debug);
    let (width, height) = image.dimensions();
    let outputs = run_patches(
        backend,
        network,
        OUTPUT,
        image,
        proposals,
        OUTPUT_INPUT_SIZE,
        quality,
        true,
    )?;
    let points = outputs
        .points
        .as_ref()
        .ok_or_else(|| FaceError::output(OUTPUT, "missing landmark output"))?;
    let kept = select(proposals, &outputs, stage);
    debug!("onet: {} proposals, {} kept", proposals.len(), kept.len());

    Ok(kept
        .into_iter()
        .filter_map(|i| {
            let proposal = &proposals[i];
            let bbox = finish_box(&proposal.bbox, outputs.region(i), false, width, height)?;
            let row = points.row(i);
            let local: Vec<Point> = (0..OUTPUT_LANDMARKS)
                .map(|k| Point::new(row[k], row[k + OUTPUT_LANDMARKS]))
                .collect();
            let frame = LandmarkFrame::relative_to_box(&proposal.bbox);
            let landmarks = remap_landmarks(&local, &frame, width, height);
            Some((Candidate::new(bbox, outputs.face_score(i)), landmarks))
        })
        .collect())
}
