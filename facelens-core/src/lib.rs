//! Face detection and analysis primitives.
//!
//! This crate decodes the outputs of SSD, tiny-grid and MTCNN face detectors, refines faces with
//! landmark, recognition and attribute networks, and matches descriptors against a gallery.
//! Networks run behind the [`Backend`] trait; [`TractBackend`] executes ONNX models with
//! `tract-onnx`.

/// Alignment boxes for the recognition network.
pub mod align;
/// The inference seam and the explicit network context.
pub mod backend;
/// The proposal, refine and output stages of the MTCNN cascade.
pub mod cascade;
/// Expression and age/gender decoders.
pub mod classify;
/// Anchor and grid box decoding.
pub mod decode;
/// Detector variants.
pub mod detector;
/// Error types.
pub mod error;
/// Points, boxes and box transforms.
pub mod geometry;
/// Landmark sets and coordinate frames.
pub mod landmarks;
/// Face descriptors and gallery matching.
pub mod matcher;
/// Batch tensor construction (resize, pad, normalise).
pub mod net_input;
/// Non-maximum suppression.
pub mod nms;
/// `tract-onnx` backend.
pub mod onnx;
/// Face patch extraction.
pub mod patch;
/// Staged face analysis over a [`FaceContext`].
pub mod pipeline;

pub use align::{AlignmentOptions, alignment_box};
pub use backend::{Backend, NetworkSet, NetworkSlot, ScopedTensor, run_network};
pub use classify::{AgeAndGender, FaceExpressions, Gender};
pub use decode::{AnchorSet, BoxCoder, Candidate, GridHead, ScoreActivation};
pub use detector::{
    DetectedFace, Detection, DetectorOptions, FaceDetector, MtcnnDetector, MtcnnOptions,
    SsdDetector, SsdOptions, TinyDetector, TinyOptions,
};
pub use error::{BackendError, BackendResult, FaceError, Result};
pub use geometry::{BoundingBox, Point};
pub use landmarks::{LandmarkFrame, LandmarkSet, remap_landmarks};
pub use matcher::{
    Descriptor, FaceMatch, FaceMatcher, LabeledDescriptor, UNKNOWN_LABEL, euclidean_distance,
    load_gallery, match_gallery, save_gallery,
};
pub use net_input::{NetInput, NetInputConfig, PadAlignment, PixelNormalization, TensorLayout};
pub use nms::non_max_suppression;
pub use onnx::{TractBackend, TractNetwork};
pub use pipeline::{FaceAnalysis, FaceContext, PatchOptions, PipelineOptions};

/// Returns the crate version for diagnostics.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
