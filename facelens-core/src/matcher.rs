//! Descriptor distances and nearest-neighbour labelling against a gallery.
//!
//! Ties between gallery entries resolve to the entry that appears first in gallery order.

use std::{collections::HashSet, fmt, fs, path::Path};

use anyhow::Context;
use facelens_utils::{MatchAggregation, MatcherSettings};
use serde::{Deserialize, Serialize};

use crate::error::{FaceError, Result};

/// Length of the descriptors produced by the recognition network.
pub const DESCRIPTOR_LEN: usize = 128;

/// Label returned when no gallery entry is close enough.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Face descriptor vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor(Vec<f32>);

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    /// Build a descriptor, requiring exactly [`DESCRIPTOR_LEN`] finite values.
    pub fn from_network(values: Vec<f32>) -> Result<Self> {
        if values.len() != DESCRIPTOR_LEN {
            return Err(FaceError::output(
                "recognition",
                format!("expected {DESCRIPTOR_LEN} values, got {}", values.len()),
            ));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(FaceError::output("recognition", "descriptor has non-finite values"));
        }
        Ok(Self(values))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn distance(&self, other: &Descriptor) -> Result<f32> {
        euclidean_distance(&self.0, &other.0)
    }
}

impl From<Vec<f32>> for Descriptor {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

/// Euclidean distance between two vectors of equal length.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(FaceError::invalid(format!(
            "descriptor length mismatch ({} vs {})",
            a.len(),
            b.len()
        )));
    }
    let sum: f32 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
    Ok(sum.sqrt())
}

/// A gallery entry: one identity with one or more sample descriptors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledDescriptor {
    pub label: String,
    pub descriptors: Vec<Descriptor>,
}

impl LabeledDescriptor {
    pub fn new(label: impl Into<String>, descriptors: Vec<Descriptor>) -> Self {
        Self {
            label: label.into(),
            descriptors,
        }
    }

    fn score(&self, query: &Descriptor, aggregation: MatchAggregation) -> Result<f32> {
        if self.descriptors.is_empty() {
            return Err(FaceError::invalid(format!(
                "gallery entry '{}' has no descriptors",
                self.label
            )));
        }
        let mut best = f32::INFINITY;
        let mut total = 0.0;
        for sample in &self.descriptors {
            let d = query.distance(sample)?;
            if !d.is_finite() {
                return Err(FaceError::invalid(format!(
                    "gallery entry '{}' has a sample at non-finite distance",
                    self.label
                )));
            }
            best = best.min(d);
            total += d;
        }
        Ok(match aggregation {
            MatchAggregation::BestSample => best,
            MatchAggregation::MeanDistance => total / self.descriptors.len() as f32,
        })
    }
}

/// Result of matching one descriptor against a gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMatch {
    pub label: String,
    pub distance: f32,
}

impl FaceMatch {
    pub fn is_unknown(&self) -> bool {
        self.label == UNKNOWN_LABEL
    }
}

impl fmt::Display for FaceMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:.2})", self.label, self.distance)
    }
}

/// Match `query` against `gallery`, scoring each entry by its closest sample.
///
/// Returns [`UNKNOWN_LABEL`] (with the measured distance) when the best distance exceeds
/// `threshold`.
pub fn match_gallery(
    query: &Descriptor,
    gallery: &[LabeledDescriptor],
    threshold: f32,
) -> Result<FaceMatch> {
    match_with(query, gallery, threshold, MatchAggregation::BestSample)
}

fn match_with(
    query: &Descriptor,
    gallery: &[LabeledDescriptor],
    threshold: f32,
    aggregation: MatchAggregation,
) -> Result<FaceMatch> {
    ensure_threshold(threshold)?;
    if query.as_slice().iter().any(|v| !v.is_finite()) {
        return Err(FaceError::invalid("query descriptor has non-finite values"));
    }
    let mut best: Option<(&LabeledDescriptor, f32)> = None;
    for entry in gallery {
        let distance = entry.score(query, aggregation)?;
        // strict comparison keeps the earliest entry on ties
        if best.is_none_or(|(_, d)| distance < d) {
            best = Some((entry, distance));
        }
    }
    let (entry, distance) =
        best.ok_or_else(|| FaceError::invalid("cannot match against an empty gallery"))?;
    let label = if distance > threshold {
        UNKNOWN_LABEL.to_string()
    } else {
        entry.label.clone()
    };
    Ok(FaceMatch { label, distance })
}

fn ensure_threshold(threshold: f32) -> Result<()> {
    if threshold.is_finite() && threshold >= 0.0 {
        Ok(())
    } else {
        Err(FaceError::config(format!(
            "distance threshold must be non-negative (got {threshold})"
        )))
    }
}

/// A validated gallery with a fixed threshold and aggregation rule.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceMatcher {
    gallery: Vec<LabeledDescriptor>,
    distance_threshold: f32,
    aggregation: MatchAggregation,
}

impl FaceMatcher {
    /// Build a matcher. Labels must be unique and every entry needs at least one descriptor of
    /// the same length as the others.
    pub fn new(gallery: Vec<LabeledDescriptor>, settings: &MatcherSettings) -> Result<Self> {
        if gallery.is_empty() {
            return Err(FaceError::invalid("face matcher needs at least one gallery entry"));
        }
        ensure_threshold(settings.distance_threshold)?;

        let mut labels = HashSet::new();
        let expected_len = gallery[0].descriptors.first().map(Descriptor::len);
        for entry in &gallery {
            if !labels.insert(entry.label.as_str()) {
                return Err(FaceError::invalid(format!(
                    "duplicate gallery label '{}'",
                    entry.label
                )));
            }
            if entry.label == UNKNOWN_LABEL {
                return Err(FaceError::invalid(format!(
                    "'{UNKNOWN_LABEL}' is reserved and cannot label a gallery entry"
                )));
            }
            if entry.descriptors.is_empty() {
                return Err(FaceError::invalid(format!(
                    "gallery entry '{}' has no descriptors",
                    entry.label
                )));
            }
            if entry.descriptors.iter().any(|d| Some(d.len()) != expected_len) {
                return Err(FaceError::invalid(format!(
                    "gallery entry '{}' mixes descriptor lengths",
                    entry.label
                )));
            }
        }

        Ok(Self {
            gallery,
            distance_threshold: settings.distance_threshold,
            aggregation: settings.aggregation,
        })
    }

    /// Label each descriptor with a generated `person N` name.
    pub fn from_descriptors(descriptors: Vec<Descriptor>, settings: &MatcherSettings) -> Result<Self> {
        let gallery = descriptors
            .into_iter()
            .enumerate()
            .map(|(i, d)| LabeledDescriptor::new(format!("person {}", i + 1), vec![d]))
            .collect();
        Self::new(gallery, settings)
    }

    pub fn gallery(&self) -> &[LabeledDescriptor] {
        &self.gallery
    }

    pub fn distance_threshold(&self) -> f32 {
        self.distance_threshold
    }

    /// Best match for `query`, or [`UNKNOWN_LABEL`] when nothing is within the threshold.
    pub fn find_best_match(&self, query: &Descriptor) -> Result<FaceMatch> {
        match_with(query, &self.gallery, self.distance_threshold, self.aggregation)
    }

    /// `1 - distance / threshold`, clamped to `[0, 1]`; `1` means identical.
    pub fn similarity(&self, face_match: &FaceMatch) -> f32 {
        if self.distance_threshold == 0.0 {
            return if face_match.distance == 0.0 { 1.0 } else { 0.0 };
        }
        (1.0 - face_match.distance / self.distance_threshold).clamp(0.0, 1.0)
    }
}

/// Read a gallery written by [`save_gallery`].
pub fn load_gallery<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<LabeledDescriptor>> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read gallery file {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse gallery JSON at {}", path.display()))
}

/// Write a gallery as pretty-printed JSON, replacing any existing file.
pub fn save_gallery<P: AsRef<Path>>(path: P, gallery: &[LabeledDescriptor]) -> anyhow::Result<()> {
    let path = path.as_ref();
    let payload = serde_json::to_string_pretty(gallery).context("failed to serialize gallery")?;
    fs::write(path, payload)
        .with_context(|| format!("failed to write gallery file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn d(values: &[f32]) -> Descriptor {
        Descriptor::new(values.to_vec())
    }

    #[test]
    fn distance_is_euclidean_and_checks_length() {
        assert_eq!(euclidean_distance(&[0.0, 0.0], &[3.0, 4.0]).unwrap(), 5.0);
        let err = euclidean_distance(&[0.0; 3], &[0.0; 4]).unwrap_err();
        assert!(matches!(err, FaceError::InvalidInput(_)));
    }

    #[test]
    fn exact_copy_matches_with_zero_distance() {
        let gallery = vec![
            LabeledDescriptor::new("ada", vec![d(&[0.1, 0.2])]),
            LabeledDescriptor::new("bob", vec![d(&[0.9, 0.9])]),
        ];
        let m = match_gallery(&d(&[0.9, 0.9]), &gallery, 0.6).unwrap();
        assert_eq!(m.label, "bob");
        assert_eq!(m.distance, 0.0);
    }

    #[test]
    fn beyond_threshold_reports_unknown_with_distance() {
        let gallery = vec![LabeledDescriptor::new("ada", vec![d(&[0.0, 0.0])])];
        let m = match_gallery(&d(&[3.0, 4.0]), &gallery, 0.6).unwrap();
        assert!(m.is_unknown());
        assert_eq!(m.distance, 5.0);
        assert_eq!(m.to_string(), "unknown (5.00)");
    }

    #[test]
    fn threshold_is_an_inclusive_match() {
        let gallery = vec![LabeledDescriptor::new("ada", vec![d(&[0.0, 0.0])])];
        let m = match_gallery(&d(&[0.0, 0.5]), &gallery, 0.5).unwrap();
        assert_eq!(m.label, "ada");
    }

    #[test]
    fn best_sample_wins_over_average() {
        // "far" has one perfect sample and one bad one; "near" is consistently close.
        let gallery = vec![
            LabeledDescriptor::new("near", vec![d(&[0.2, 0.0]), d(&[0.2, 0.0])]),
            LabeledDescriptor::new("far", vec![d(&[0.0, 0.0]), d(&[5.0, 0.0])]),
        ];
        let best = match_gallery(&d(&[0.0, 0.0]), &gallery, 1.0).unwrap();
        assert_eq!(best.label, "far");

        let settings = MatcherSettings {
            aggregation: MatchAggregation::MeanDistance,
            distance_threshold: 1.0,
        };
        let mean = FaceMatcher::new(gallery, &settings)
            .unwrap()
            .find_best_match(&d(&[0.0, 0.0]))
            .unwrap();
        assert_eq!(mean.label, "near");
    }

    #[test]
    fn ties_keep_first_gallery_entry() {
        let gallery = vec![
            LabeledDescriptor::new("first", vec![d(&[1.0, 0.0])]),
            LabeledDescriptor::new("second", vec![d(&[-1.0, 0.0])]),
        ];
        let m = match_gallery(&d(&[0.0, 0.0]), &gallery, 2.0).unwrap();
        assert_eq!(m.label, "first");
    }

    #[test]
    fn empty_gallery_and_entries_are_invalid() {
        assert!(match_gallery(&d(&[0.0]), &[], 0.6).is_err());
        let gallery = vec![LabeledDescriptor::new("ada", vec![])];
        assert!(match_gallery(&d(&[0.0]), &gallery, 0.6).is_err());
    }

    #[test]
    fn thresholds_must_be_finite_and_non_negative() {
        let gallery = vec![LabeledDescriptor::new("ada", vec![d(&[0.0, 0.0])])];
        for threshold in [-0.1, f32::NAN, f32::INFINITY] {
            let err = match_gallery(&d(&[0.0, 0.0]), &gallery, threshold).unwrap_err();
            assert!(matches!(err, FaceError::Configuration(_)), "{threshold}: {err:?}");
        }
        assert!(match_gallery(&d(&[0.0, 0.0]), &gallery, 0.0).is_ok());

        let settings = MatcherSettings {
            distance_threshold: -1.0,
            ..MatcherSettings::default()
        };
        assert!(matches!(
            FaceMatcher::new(gallery, &settings),
            Err(FaceError::Configuration(_))
        ));
    }

    #[test]
    fn non_finite_values_never_match() {
        let gallery = vec![
            LabeledDescriptor::new("ada", vec![d(&[0.0, 0.0])]),
            LabeledDescriptor::new("bob", vec![d(&[f32::NAN, 0.0])]),
        ];
        let err = match_gallery(&d(&[f32::NAN, 0.0]), &gallery[..1], 0.6).unwrap_err();
        assert!(matches!(err, FaceError::InvalidInput(_)));

        // a NaN sample must not be skipped in favour of a worse one
        let err = match_gallery(&d(&[0.0, 0.0]), &gallery, 0.6).unwrap_err();
        assert!(matches!(err, FaceError::InvalidInput(_)));

        let matcher = FaceMatcher::new(gallery[..1].to_vec(), &MatcherSettings::default()).unwrap();
        assert!(matcher.find_best_match(&d(&[0.0, f32::INFINITY])).is_err());
    }

    #[test]
    fn matcher_rejects_duplicate_and_reserved_labels() {
        let settings = MatcherSettings::default();
        let dup = vec![
            LabeledDescriptor::new("ada", vec![d(&[0.0])]),
            LabeledDescriptor::new("ada", vec![d(&[1.0])]),
        ];
        assert!(FaceMatcher::new(dup, &settings).is_err());
        let reserved = vec![LabeledDescriptor::new(UNKNOWN_LABEL, vec![d(&[0.0])])];
        assert!(FaceMatcher::new(reserved, &settings).is_err());

        let generated = FaceMatcher::from_descriptors(vec![d(&[0.0]), d(&[1.0])], &settings).unwrap();
        assert_eq!(generated.gallery()[1].label, "person 2");
    }

    #[test]
    fn similarity_scales_with_threshold() {
        let matcher = FaceMatcher::from_descriptors(vec![d(&[0.0])], &MatcherSettings::default()).unwrap();
        let m = matcher.find_best_match(&d(&[0.3])).unwrap();
        assert!((matcher.similarity(&m) - 0.5).abs() < 1e-5);
    }

    #[test]
    fn network_descriptor_length_is_enforced() {
        assert!(Descriptor::from_network(vec![0.0; DESCRIPTOR_LEN]).is_ok());
        assert!(Descriptor::from_network(vec![0.0; 64]).is_err());
    }

    #[test]
    fn gallery_round_trips_through_json() {
        let file = NamedTempFile::new().expect("tempfile");
        let gallery = vec![
            LabeledDescriptor::new("ada", vec![d(&[0.25, -0.5]), d(&[1.0, 2.0])]),
            LabeledDescriptor::new("bob", vec![d(&[0.0, 0.125])]),
        ];
        save_gallery(file.path(), &gallery).expect("save");
        let loaded = load_gallery(file.path()).expect("load");
        assert_eq!(loaded, gallery);
    }
}
