//! Box decoding for anchor-based and grid-regression detector heads.
//!
//! Decoders turn raw head outputs into scored [`Candidate`]s in network-input pixel space.
//! Confidence filtering happens here, before NMS, and the threshold is inclusive.

use ndarray::{ArrayView2, ArrayView3};

use crate::error::{FaceError, Result};
use crate::geometry::{BoundingBox, Point};

/// A scored box in network-input pixel space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub bbox: BoundingBox,
    pub score: f32,
    /// Winning class index for heads that predict classes.
    pub class_index: Option<usize>,
}

impl Candidate {
    pub fn new(bbox: BoundingBox, score: f32) -> Self {
        Self {
            bbox,
            score,
            class_index: None,
        }
    }
}

/// One feature map of an anchor-based head.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorLayer {
    /// Input pixels per feature-map cell.
    pub stride: f32,
    pub feature_width: usize,
    pub feature_height: usize,
    /// Anchor `(width, height)` in input pixels, one anchor per entry per cell.
    pub sizes: Vec<(f32, f32)>,
}

/// Ordered anchors (reference boxes) in network-input pixel space.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AnchorSet {
    anchors: Vec<BoundingBox>,
}

impl AnchorSet {
    pub fn from_boxes(anchors: Vec<BoundingBox>) -> Self {
        Self { anchors }
    }

    /// Generate anchors cell by cell (row-major), then size by size within a cell.
    pub fn generate(layers: &[AnchorLayer]) -> Self {
        let capacity = layers
            .iter()
            .map(|l| l.feature_width * l.feature_height * l.sizes.len())
            .sum();
        let mut anchors = Vec::with_capacity(capacity);
        for layer in layers {
            for row in 0..layer.feature_height {
                for col in 0..layer.feature_width {
                    let center = Point::new(
                        (col as f32 + 0.5) * layer.stride,
                        (row as f32 + 0.5) * layer.stride,
                    );
                    for &(w, h) in &layer.sizes {
                        anchors.push(BoundingBox::from_center(center, w, h));
                    }
                }
            }
        }
        Self { anchors }
    }

    /// Read anchors stored as normalized `[y1, x1, y2, x2]` rows, the layout used by TensorFlow
    /// object-detection exports, scaling them to an `input_size` square.
    pub fn from_normalized_yxyx(rows: ArrayView2<'_, f32>, input_size: f32) -> Result<Self> {
        if rows.ncols() != 4 {
            return Err(FaceError::invalid(format!(
                "anchor rows must have 4 columns (got {})",
                rows.ncols()
            )));
        }
        let anchors = rows
            .rows()
            .into_iter()
            .map(|r| {
                BoundingBox::from_corners(r[1], r[0], r[3], r[2]).rescale(input_size, input_size)
            })
            .collect();
        Ok(Self { anchors })
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn as_slice(&self) -> &[BoundingBox] {
        &self.anchors
    }
}

/// Column order of the four regression values per anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegressionOrder {
    /// `(dx, dy, dw, dh)`
    #[default]
    Xywh,
    /// `(dy, dx, dh, dw)`, TensorFlow box-coder order.
    Yxhw,
}

/// Parameters of the centre/size box parameterisation.
///
/// `center = anchor_center + (d_xy / center_variance) * anchor_size` and
/// `size = anchor_size * exp(d_wh / size_variance)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxCoder {
    pub center_variance: f32,
    pub size_variance: f32,
    pub order: RegressionOrder,
}

impl BoxCoder {
    /// Coder used by the SSD MobileNet v1 face model.
    pub const SSD_MOBILENET: Self = Self {
        center_variance: 10.0,
        size_variance: 5.0,
        order: RegressionOrder::Yxhw,
    };

    /// Decode one regression row against its anchor.
    pub fn decode(&self, anchor: &BoundingBox, row: [f32; 4]) -> BoundingBox {
        let [dx, dy, dw, dh] = match self.order {
            RegressionOrder::Xywh => row,
            RegressionOrder::Yxhw => [row[1], row[0], row[3], row[2]],
        };
        let anchor_center = anchor.center();
        let center = Point::new(
            anchor_center.x + dx / self.center_variance * anchor.width,
            anchor_center.y + dy / self.center_variance * anchor.height,
        );
        let width = anchor.width * (dw / self.size_variance).exp();
        let height = anchor.height * (dh / self.size_variance).exp();
        BoundingBox::from_center(center, width, height)
    }
}

impl Default for BoxCoder {
    fn default() -> Self {
        Self {
            center_variance: 1.0,
            size_variance: 1.0,
            order: RegressionOrder::Xywh,
        }
    }
}

/// How raw class outputs become a face probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScoreActivation {
    /// Already a probability; the last column is the face class.
    #[default]
    Identity,
    /// Logistic of the last column.
    Sigmoid,
    /// Two logits `(background, face)`; softmax then take the face column.
    Softmax2,
}

impl ScoreActivation {
    fn score(&self, row: &[f32]) -> Option<f32> {
        let last = *row.last()?;
        match self {
            ScoreActivation::Identity => Some(last),
            ScoreActivation::Sigmoid => Some(sigmoid(last)),
            ScoreActivation::Softmax2 => match row {
                [background, face] => Some(softmax2(*background, *face)),
                _ => None,
            },
        }
    }
}

pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Probability of the second class of a two-way softmax.
pub(crate) fn softmax2(a: f32, b: f32) -> f32 {
    sigmoid(b - a)
}

/// Decode an anchor-based head.
///
/// * `regression` - `[N, 4]` regression rows, one per anchor.
/// * `scores` - `[N, C]` class outputs, one row per anchor.
pub fn decode_anchor_boxes(
    regression: ArrayView2<'_, f32>,
    scores: ArrayView2<'_, f32>,
    anchors: &AnchorSet,
    coder: &BoxCoder,
    activation: ScoreActivation,
    min_confidence: f32,
) -> Result<Vec<Candidate>> {
    let n = anchors.len();
    if regression.dim() != (n, 4) {
        return Err(FaceError::output(
            "anchor head",
            format!("regression shape {:?} does not match {n} anchors", regression.shape()),
        ));
    }
    if scores.nrows() != n || scores.ncols() == 0 {
        return Err(FaceError::output(
            "anchor head",
            format!("score shape {:?} does not match {n} anchors", scores.shape()),
        ));
    }
    if activation == ScoreActivation::Softmax2 && scores.ncols() != 2 {
        return Err(FaceError::output(
            "anchor head",
            "two-way softmax needs exactly two score columns",
        ));
    }

    let mut candidates = Vec::new();
    for ((anchor, reg), score_row) in anchors
        .as_slice()
        .iter()
        .zip(regression.rows())
        .zip(scores.rows())
    {
        let score_row = score_row.to_vec();
        let Some(score) = activation.score(&score_row) else {
            continue;
        };
        if !score.is_finite() || score < min_confidence {
            continue;
        }
        let bbox = coder.decode(anchor, [reg[0], reg[1], reg[2], reg[3]]);
        if bbox.is_degenerate() || !bbox.width.is_finite() || !bbox.height.is_finite() {
            continue;
        }
        candidates.push(Candidate::new(bbox, score));
    }
    Ok(candidates)
}

/// Direct-regression grid head (YOLO style).
#[derive(Debug, Clone, PartialEq)]
pub struct GridHead {
    /// Input pixels per output cell.
    pub stride: f32,
    /// Box priors `(width, height)` in cell units.
    pub anchors: Vec<(f32, f32)>,
    /// Extra class channels after the objectness score; zero for a pure face head.
    pub num_classes: usize,
}

impl GridHead {
    /// Priors of the tiny face detector.
    pub fn tiny_face() -> Self {
        Self {
            stride: 32.0,
            anchors: vec![
                (1.603_231, 2.094_468),
                (6.041_143, 7.080_126),
                (2.882_459, 3.518_061),
                (4.266_906, 5.178_857),
                (9.041_765, 10.663_08),
            ],
            num_classes: 0,
        }
    }

    fn channels_per_anchor(&self) -> usize {
        5 + self.num_classes
    }
}

/// Decode a `[H, W, A * (5 + C)]` grid output.
///
/// Each anchor slot holds `(tx, ty, tw, th, objectness, classes...)`; the centre is
/// `(cell + sigmoid(t)) * stride` and the size `exp(t) * prior * stride`.
pub fn decode_grid(
    output: ArrayView3<'_, f32>,
    head: &GridHead,
    score_threshold: f32,
) -> Result<Vec<Candidate>> {
    let (rows, cols, channels) = output.dim();
    let per_anchor = head.channels_per_anchor();
    if head.anchors.is_empty() || channels != head.anchors.len() * per_anchor {
        return Err(FaceError::output(
            "grid head",
            format!(
                "expected {} channels for {} anchors, got {channels}",
                head.anchors.len() * per_anchor,
                head.anchors.len()
            ),
        ));
    }

    let mut candidates = Vec::new();
    for row in 0..rows {
        for col in 0..cols {
            for (a, &(prior_w, prior_h)) in head.anchors.iter().enumerate() {
                let base = a * per_anchor;
                let at = |k: usize| output[(row, col, base + k)];
                let objectness = sigmoid(at(4));
                let (score, class_index) = if head.num_classes > 0 {
                    let class_logits: Vec<f32> = (0..head.num_classes).map(|k| at(5 + k)).collect();
                    let (best, prob) = best_softmax(&class_logits);
                    (objectness * prob, Some(best))
                } else {
                    (objectness, None)
                };
                if !score.is_finite() || score < score_threshold {
                    continue;
                }

                let center = Point::new(
                    (col as f32 + sigmoid(at(0))) * head.stride,
                    (row as f32 + sigmoid(at(1))) * head.stride,
                );
                let width = at(2).exp() * prior_w * head.stride;
                let height = at(3).exp() * prior_h * head.stride;
                let bbox = BoundingBox::from_center(center, width, height);
                if bbox.is_degenerate() || !width.is_finite() || !height.is_finite() {
                    continue;
                }
                candidates.push(Candidate {
                    bbox,
                    score,
                    class_index,
                });
            }
        }
    }
    Ok(candidates)
}

/// Index and probability of the most likely class.
fn best_softmax(logits: &[f32]) -> (usize, f32) {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    let (best, value) = exps
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc });
    (best, value / total)
}
