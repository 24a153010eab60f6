//! Persisted settings shared by every facelens front end.
//!
//! These are plain serde structures. The core crate converts them into validated option types
//! before any network runs, so values here are allowed to be out of range until then.

use anyhow::{Context, Result};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::{fmt, fs, path::Path, str::FromStr};

/// Resampling preference used when building network inputs and face patches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResizeQuality {
    /// Bilinear sampling (default).
    #[default]
    Quality,
    /// Nearest-neighbour sampling for throughput.
    Speed,
}

impl fmt::Display for ResizeQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResizeQuality::Quality => "quality",
            ResizeQuality::Speed => "speed",
        })
    }
}

impl FromStr for ResizeQuality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quality" => Ok(ResizeQuality::Quality),
            "speed" => Ok(ResizeQuality::Speed),
            other => Err(format!(
                "invalid resize quality '{other}'; expected 'quality' or 'speed'"
            )),
        }
    }
}

/// Denominator used when measuring the overlap of two boxes during suppression.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverlapMetric {
    /// Intersection over union.
    #[default]
    Union,
    /// Intersection over the smaller of the two areas.
    Min,
}

/// How a multi-sample gallery entry is scored against a query.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchAggregation {
    /// Distance to the closest sample.
    #[default]
    BestSample,
    /// Mean distance over all samples.
    MeanDistance,
}

/// SSD (MobileNet v1) detector parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SsdSettings {
    pub input_size: u32,
    pub min_confidence: f32,
    pub nms_threshold: f32,
    /// Upper bound on detections kept per image after suppression.
    pub max_results: usize,
}

impl Default for SsdSettings {
    fn default() -> Self {
        Self {
            input_size: 512,
            min_confidence: 0.5,
            nms_threshold: 0.5,
            max_results: 100,
        }
    }
}

/// Tiny (grid regression) detector parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TinySettings {
    pub input_size: u32,
    pub score_threshold: f32,
    pub nms_threshold: f32,
}

impl Default for TinySettings {
    fn default() -> Self {
        Self {
            input_size: 416,
            score_threshold: 0.5,
            nms_threshold: 0.4,
        }
    }
}

/// MTCNN cascade parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MtcnnSettings {
    /// Smallest face (in source pixels) the pyramid is built to find.
    pub min_face_size: u32,
    /// Downscale factor between pyramid levels.
    pub scale_factor: f32,
    pub max_num_scales: usize,
    /// Explicit pyramid scales; overrides `min_face_size`/`scale_factor` when set.
    pub scale_steps: Option<Vec<f32>>,
    /// Confidence thresholds for the proposal, refine and output stages.
    pub score_thresholds: [f32; 3],
    /// NMS thresholds for the proposal, refine and output stages.
    pub nms_thresholds: [f32; 3],
    /// Overlap metric for the proposal, refine and output stages.
    pub stage_metrics: [OverlapMetric; 3],
}

impl Default for MtcnnSettings {
    fn default() -> Self {
        Self {
            min_face_size: 20,
            scale_factor: 0.709,
            max_num_scales: 10,
            scale_steps: None,
            score_thresholds: [0.6, 0.7, 0.7],
            nms_thresholds: [0.7, 0.7, 0.7],
            stage_metrics: [OverlapMetric::Union, OverlapMetric::Min, OverlapMetric::Min],
        }
    }
}

/// Which face detector to run, with its parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectorSettings {
    Ssd(SsdSettings),
    Tiny(TinySettings),
    Mtcnn(MtcnnSettings),
}

impl Default for DetectorSettings {
    fn default() -> Self {
        DetectorSettings::Ssd(SsdSettings::default())
    }
}

impl DetectorSettings {
    pub fn kind(&self) -> &'static str {
        match self {
            DetectorSettings::Ssd(_) => "ssd",
            DetectorSettings::Tiny(_) => "tiny",
            DetectorSettings::Mtcnn(_) => "mtcnn",
        }
    }
}

/// Input size of a network that consumes face patches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PatchNetworkSettings {
    pub input_size: u32,
}

impl Default for PatchNetworkSettings {
    fn default() -> Self {
        Self { input_size: 112 }
    }
}

/// Strategy used to derive the recognition crop from landmarks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentKind {
    /// Box around eye and mouth centres.
    #[default]
    ReferencePoints,
    /// Box around every landmark.
    MinBoundingBox,
    /// Eye-to-mouth distance rule.
    Dlib,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlignmentSettings {
    pub kind: AlignmentKind,
    /// Fraction of the box width/height added around the reference box.
    pub margin: f32,
}

impl Default for AlignmentSettings {
    fn default() -> Self {
        Self {
            kind: AlignmentKind::ReferencePoints,
            margin: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MatcherSettings {
    /// Distances above this value are reported as `unknown`.
    pub distance_threshold: f32,
    pub aggregation: MatchAggregation,
}

impl Default for MatcherSettings {
    fn default() -> Self {
        Self {
            distance_threshold: 0.6,
            aggregation: MatchAggregation::BestSample,
        }
    }
}

/// Locations of the ONNX graphs. Unset entries disable the corresponding stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ModelPaths {
    pub ssd: Option<String>,
    pub tiny: Option<String>,
    pub mtcnn_proposal: Option<String>,
    pub mtcnn_refine: Option<String>,
    pub mtcnn_output: Option<String>,
    pub landmarks: Option<String>,
    pub recognition: Option<String>,
    pub expression: Option<String>,
    pub age_gender: Option<String>,
}

/// Settings controlling optional runtime telemetry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetrySettings {
    pub enabled: bool,
    /// Logging level for timing records (off, error, warn, info, debug, trace).
    pub level: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            level: "debug".to_string(),
        }
    }
}

impl TelemetrySettings {
    /// Resolve the configured level string, falling back to `Debug` for unknown values.
    pub fn level_filter(&self) -> LevelFilter {
        LevelFilter::from_str(self.level.trim()).unwrap_or(LevelFilter::Debug)
    }

    pub fn set_level(&mut self, level: LevelFilter) {
        self.level = level.as_str().to_ascii_lowercase();
    }
}

/// Every user-configurable parameter of the pipeline, persisted as JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppSettings {
    pub models: ModelPaths,
    pub detector: DetectorSettings,
    pub resize_quality: ResizeQuality,
    pub landmarks: PatchNetworkSettings,
    pub recognition: PatchNetworkSettings,
    pub expression: PatchNetworkSettings,
    pub age_gender: PatchNetworkSettings,
    pub alignment: AlignmentSettings,
    pub matcher: MatcherSettings,
    pub telemetry: TelemetrySettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            models: ModelPaths::default(),
            detector: DetectorSettings::default(),
            resize_quality: ResizeQuality::default(),
            landmarks: PatchNetworkSettings { input_size: 112 },
            recognition: PatchNetworkSettings { input_size: 150 },
            expression: PatchNetworkSettings { input_size: 112 },
            age_gender: PatchNetworkSettings { input_size: 112 },
            alignment: AlignmentSettings::default(),
            matcher: MatcherSettings::default(),
            telemetry: TelemetrySettings::default(),
        }
    }
}

impl AppSettings {
    /// Load settings from a JSON file. Missing fields take their defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse settings JSON at {}", path.display()))
    }

    /// Write settings as pretty-printed JSON, replacing any existing file.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let payload =
            serde_json::to_string_pretty(self).context("failed to serialize settings JSON")?;
        fs::write(path, payload)
            .with_context(|| format!("failed to write settings file {}", path.display()))
    }
}
