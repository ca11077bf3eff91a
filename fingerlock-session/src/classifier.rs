//! Fingerprint classification
//!
//! The assembled hex payload is decoded, normalised to 256 values in
//! `[0, 1]` and handed to a [`Classifier`], which returns a class label.

use std::path::Path;

use serde::Deserialize;

use crate::error::ClassificationError;

/// Fingerprint payload size, in bytes and in features
pub const FEATURE_LEN: usize = 256;

pub type ClassLabel = i64;

/// Black-box model: normalised feature vector in, class label out
pub trait Classifier: Send + 'static {
    fn predict(&self, features: &[f64; FEATURE_LEN]) -> Result<ClassLabel, ClassificationError>;
}

impl<F> Classifier for F
where
    F: Fn(&[f64; FEATURE_LEN]) -> Result<ClassLabel, ClassificationError> + Send + 'static,
{
    fn predict(&self, features: &[f64; FEATURE_LEN]) -> Result<ClassLabel, ClassificationError> {
        self(features)
    }
}

/// Normalise exactly [`FEATURE_LEN`] bytes to `byte / 255.0`
pub fn features(bytes: &[u8]) -> Result<[f64; FEATURE_LEN], ClassificationError> {
    if bytes.len() != FEATURE_LEN {
        return Err(ClassificationError::InvalidLength {
            expected: FEATURE_LEN,
            actual: bytes.len(),
        });
    }

    let mut out = [0.0; FEATURE_LEN];
    for (slot, byte) in out.iter_mut().zip(bytes) {
        *slot = f64::from(*byte) / 255.0;
    }
    Ok(out)
}

pub struct ClassificationPipeline<C> {
    classifier: C,
}

impl<C: Classifier> ClassificationPipeline<C> {
    pub fn new(classifier: C) -> Self {
        Self { classifier }
    }

    pub fn classify(&self, assembled_hex: &str) -> Result<ClassLabel, ClassificationError> {
        let bytes = fingerlock_proto::hex_decode(assembled_hex)?;
        let features = features(&bytes)?;
        self.classifier.predict(&features)
    }
}

/// Stand-in used when no model is configured; every prediction fails
#[derive(Debug, Clone, Copy, Default)]
pub struct NoModel;

impl Classifier for NoModel {
    fn predict(&self, _features: &[f64; FEATURE_LEN]) -> Result<ClassLabel, ClassificationError> {
        Err(ClassificationError::ModelUnavailable("no model configured".to_string()))
    }
}

/// Linear scorer exported from a trained model: one weight row and bias
/// per class, the label of the best score wins.
///
/// ```json
/// { "labels": [0, 1, 2], "weights": [[...256...], ...], "bias": [0.1, 0.0, -0.2] }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct LinearModel {
    labels: Vec<ClassLabel>,
    weights: Vec<Vec<f64>>,
    bias: Vec<f64>,
}

impl LinearModel {
    pub fn new(
        labels: Vec<ClassLabel>,
        weights: Vec<Vec<f64>>,
        bias: Vec<f64>,
    ) -> Result<Self, ClassificationError> {
        let model = Self { labels, weights, bias };
        model.validate()?;
        Ok(model)
    }

    pub fn load(path: &Path) -> Result<Self, ClassificationError> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            ClassificationError::ModelUnavailable(format!("{}: {e}", path.display()))
        })?;
        let model: Self = serde_json::from_str(&data)
            .map_err(|e| ClassificationError::InvalidModel(e.to_string()))?;
        model.validate()?;
        log::info!("Loaded classifier with {} classes from {}", model.labels.len(), path.display());
        Ok(model)
    }

    fn validate(&self) -> Result<(), ClassificationError> {
        if self.labels.is_empty() {
            return Err(ClassificationError::InvalidModel("no classes".to_string()));
        }
        if self.weights.len() != self.labels.len() || self.bias.len() != self.labels.len() {
            return Err(ClassificationError::InvalidModel(format!(
                "{} labels, {} weight rows, {} biases",
                self.labels.len(),
                self.weights.len(),
                self.bias.len()
            )));
        }
        if let Some(row) = self.weights.iter().find(|row| row.len() != FEATURE_LEN) {
            return Err(ClassificationError::InvalidModel(format!(
                "weight row has {} entries, expected {FEATURE_LEN}",
                row.len()
            )));
        }
        Ok(())
    }
}

impl Classifier for LinearModel {
    fn predict(&self, features: &[f64; FEATURE_LEN]) -> Result<ClassLabel, ClassificationError> {
        let scores = self.weights.iter().zip(&self.bias).map(|(row, bias)| {
            row.iter().zip(features).map(|(w, x)| w * x).sum::<f64>() + bias
        });

        let mut best: Option<(usize, f64)> = None;
        for (i, score) in scores.enumerate() {
            if score.is_nan() {
                return Err(ClassificationError::Prediction(format!("class {i} scored NaN")));
            }
            if best.is_none_or(|(_, top)| score > top) {
                best = Some((i, score));
            }
        }

        best.map(|(i, _)| self.labels[i])
            .ok_or_else(|| ClassificationError::Prediction("no classes".to_string()))
    }
}
