//! Decoders for the expression and age/gender classifier heads.

use serde::{Deserialize, Serialize};

use crate::error::{FaceError, Result};

/// Expression classes in network output order.
pub const EXPRESSION_LABELS: [&str; 7] = [
    "neutral",
    "happy",
    "sad",
    "angry",
    "fearful",
    "disgusted",
    "surprised",
];

/// Per-expression probabilities for one face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceExpressions {
    pub neutral: f32,
    pub happy: f32,
    pub sad: f32,
    pub angry: f32,
    pub fearful: f32,
    pub disgusted: f32,
    pub surprised: f32,
}

impl FaceExpressions {
    /// Decode one output row. Rows that do not already sum to one are treated as logits.
    pub fn from_output(row: &[f32]) -> Result<Self> {
        if row.len() != EXPRESSION_LABELS.len() {
            return Err(FaceError::output(
                "expression",
                format!("expected {} classes, got {}", EXPRESSION_LABELS.len(), row.len()),
            ));
        }
        let probs = if is_distribution(row) {
            row.to_vec()
        } else {
            softmax(row)
        };
        Ok(Self {
            neutral: probs[0],
            happy: probs[1],
            sad: probs[2],
            angry: probs[3],
            fearful: probs[4],
            disgusted: probs[5],
            surprised: probs[6],
        })
    }

    fn values(&self) -> [f32; 7] {
        [
            self.neutral,
            self.happy,
            self.sad,
            self.angry,
            self.fearful,
            self.disgusted,
            self.surprised,
        ]
    }

    /// `(label, probability)` pairs, most likely first.
    pub fn sorted(&self) -> Vec<(&'static str, f32)> {
        let mut pairs: Vec<(&'static str, f32)> =
            EXPRESSION_LABELS.iter().copied().zip(self.values()).collect();
        pairs.sort_by(|a, b| b.1.total_cmp(&a.1));
        pairs
    }

    pub fn dominant(&self) -> (&'static str, f32) {
        self.sorted()[0]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
}

/// Age estimate and gender prediction for one face.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgeAndGender {
    pub age: f32,
    pub gender: Gender,
    pub gender_probability: f32,
}

impl AgeAndGender {
    /// Decode an age regression value and a `[male, female]` gender row.
    pub fn from_output(age: f32, gender_row: &[f32]) -> Result<Self> {
        if !age.is_finite() {
            return Err(FaceError::output("age_gender", "age is not finite"));
        }
        let [male, female] = gender_row else {
            return Err(FaceError::output(
                "age_gender",
                format!("expected 2 gender classes, got {}", gender_row.len()),
            ));
        };
        let probs = if is_distribution(gender_row) {
            vec![*male, *female]
        } else {
            softmax(gender_row)
        };
        let (gender, gender_probability) = if probs[0] >= probs[1] {
            (Gender::Male, probs[0])
        } else {
            (Gender::Female, probs[1])
        };
        Ok(Self {
            age: age.max(0.0),
            gender,
            gender_probability,
        })
    }
}

fn is_distribution(row: &[f32]) -> bool {
    row.iter().all(|v| (0.0..=1.0).contains(v)) && (row.iter().sum::<f32>() - 1.0).abs() < 1e-3
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expressions_sort_by_probability() {
        let e = FaceExpressions::from_output(&[0.05, 0.7, 0.05, 0.05, 0.05, 0.05, 0.05]).unwrap();
        assert_eq!(e.dominant(), ("happy", 0.7));
        assert_eq!(e.sorted().len(), 7);
    }

    #[test]
    fn expression_logits_are_softmaxed() {
        let e = FaceExpressions::from_output(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 5.0]).unwrap();
        assert_eq!(e.dominant().0, "surprised");
        let total: f32 = e.sorted().iter().map(|(_, p)| p).sum();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[test]
    fn wrong_class_count_is_an_output_error() {
        assert!(matches!(
            FaceExpressions::from_output(&[1.0; 3]),
            Err(FaceError::Output { .. })
        ));
        assert!(AgeAndGender::from_output(30.0, &[0.5]).is_err());
    }

    #[test]
    fn gender_picks_more_likely_class() {
        let ag = AgeAndGender::from_output(31.5, &[0.2, 0.8]).unwrap();
        assert_eq!(ag.gender, Gender::Female);
        assert_eq!(ag.gender_probability, 0.8);
        assert_eq!(ag.age, 31.5);

        let ag = AgeAndGender::from_output(-2.0, &[3.0, -3.0]).unwrap();
        assert_eq!(ag.gender, Gender::Male);
        assert!(ag.gender_probability > 0.99);
        assert_eq!(ag.age, 0.0);
    }
}
