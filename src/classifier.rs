//! Classifier seam and the reference Gaussian naive Bayes model.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::features::FeatureMatrix;
use crate::fs_util::write_atomic;

pub const MODEL_FILE: &str = "model.json";
pub const MODEL_FORMAT_VERSION: u32 = 1;
const GAUSSIAN_NB_KIND: &str = "gaussian_nb";
const DEFAULT_VAR_SMOOTHING: f64 = 1e-9;

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("cannot train on an empty matrix")]
    EmptyTrainingSet,
    #[error("{rows} rows but {labels} labels")]
    LengthMismatch { rows: usize, labels: usize },
    #[error("classifier has not been fitted")]
    NotFitted,
    #[error("expected {expected} feature values, got {actual}")]
    FeatureCountMismatch { expected: usize, actual: usize },
    #[error("unsupported model format version: expected {expected}, got {actual}")]
    UnsupportedFormatVersion { expected: u32, actual: u32 },
    #[error("invalid model file: {0}")]
    InvalidModel(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub code: usize,
    /// Probability of the predicted class when the model exposes one.
    pub confidence: Option<f64>,
}

pub trait Classifier {
    fn fit(&mut self, matrix: &FeatureMatrix, labels: &[usize]) -> Result<(), ClassifierError>;

    fn predict(&self, row: &[f64]) -> Result<Prediction, ClassifierError>;

    fn predict_many(&self, rows: &[Vec<f64>]) -> Result<Vec<usize>, ClassifierError> {
        rows.iter()
            .map(|row| self.predict(row).map(|prediction| prediction.code))
            .collect()
    }
}

/// Per-class feature means and variances with class priors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianNb {
    var_smoothing: f64,
    feature_columns: Vec<String>,
    classes: Vec<usize>,
    class_priors: Vec<f64>,
    means: Vec<Vec<f64>>,
    variances: Vec<Vec<f64>>,
}

#[derive(Serialize, Deserialize)]
struct ModelFile {
    format_version: u32,
    kind: String,
    #[serde(flatten)]
    model: GaussianNb,
}

impl Default for GaussianNb {
    fn default() -> Self {
        Self::new()
    }
}

impl GaussianNb {
    pub fn new() -> Self {
        Self {
            var_smoothing: DEFAULT_VAR_SMOOTHING,
            feature_columns: Vec::new(),
            classes: Vec::new(),
            class_priors: Vec::new(),
            means: Vec::new(),
            variances: Vec::new(),
        }
    }

    pub fn with_var_smoothing(mut self, var_smoothing: f64) -> Self {
        self.var_smoothing = var_smoothing;
        self
    }

    pub fn feature_columns(&self) -> &[String] {
        &self.feature_columns
    }

    pub fn classes(&self) -> &[usize] {
        &self.classes
    }

    pub fn is_fitted(&self) -> bool {
        !self.classes.is_empty()
    }

    /// Posterior per fitted class, in `classes()` order.
    pub fn predict_proba(&self, row: &[f64]) -> Result<Vec<f64>, ClassifierError> {
        if !self.is_fitted() {
            return Err(ClassifierError::NotFitted);
        }
        if row.len() != self.feature_columns.len() {
            return Err(ClassifierError::FeatureCountMismatch {
                expected: self.feature_columns.len(),
                actual: row.len(),
            });
        }

        let joint: Vec<f64> = (0..self.classes.len())
            .map(|class| self.joint_log_likelihood(class, row))
            .collect();
        let max = joint.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exp: Vec<f64> = joint.iter().map(|value| (value - max).exp()).collect();
        let total: f64 = exp.iter().sum();
        Ok(exp.into_iter().map(|value| value / total).collect())
    }

    fn joint_log_likelihood(&self, class: usize, row: &[f64]) -> f64 {
        let prior = self.class_priors[class].ln();
        let likelihood: f64 = row
            .iter()
            .zip(&self.means[class])
            .zip(&self.variances[class])
            .map(|((x, mean), variance)| {
                let diff = x - mean;
                -0.5 * (2.0 * std::f64::consts::PI * variance).ln() - diff * diff / (2.0 * variance)
            })
            .sum();
        prior + likelihood
    }

    pub fn save(&self, path: &Path) -> Result<(), ClassifierError> {
        if !self.is_fitted() {
            return Err(ClassifierError::NotFitted);
        }
        let file = ModelFile {
            format_version: MODEL_FORMAT_VERSION,
            kind: GAUSSIAN_NB_KIND.to_string(),
            model: self.clone(),
        };
        write_atomic(path, &serde_json::to_vec_pretty(&file)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ClassifierError> {
        let file: ModelFile = serde_json::from_slice(&fs::read(path)?)?;
        if file.format_version != MODEL_FORMAT_VERSION {
            return Err(ClassifierError::UnsupportedFormatVersion {
                expected: MODEL_FORMAT_VERSION,
                actual: file.format_version,
            });
        }
        if file.kind != GAUSSIAN_NB_KIND {
            return Err(ClassifierError::InvalidModel(format!(
                "unexpected model kind '{}'",
                file.kind
            )));
        }
        let model = file.model;
        let n_classes = model.classes.len();
        let n_features = model.feature_columns.len();
        let consistent = n_classes > 0
            && model.class_priors.len() == n_classes
            && model.means.len() == n_classes
            && model.variances.len() == n_classes
            && model.means.iter().all(|row| row.len() == n_features)
            && model.variances.iter().all(|row| row.len() == n_features && row.iter().all(|v| *v > 0.0));
        if !consistent {
            return Err(ClassifierError::InvalidModel(
                "parameter shapes disagree with classes and feature columns".to_string(),
            ));
        }
        Ok(model)
    }
}

impl Classifier for GaussianNb {
    fn fit(&mut self, matrix: &FeatureMatrix, labels: &[usize]) -> Result<(), ClassifierError> {
        let n_samples = matrix.n_rows();
        let n_features = matrix.n_cols();
        if n_samples == 0 {
            return Err(ClassifierError::EmptyTrainingSet);
        }
        if labels.len() != n_samples {
            return Err(ClassifierError::LengthMismatch {
                rows: n_samples,
                labels: labels.len(),
            });
        }

        let mut classes = labels.to_vec();
        classes.sort_unstable();
        classes.dedup();

        // Smoothing scales with the widest feature variance over all samples.
        let max_variance = (0..n_features)
            .map(|col| column_variance(matrix.rows.iter().map(|row| row[col])))
            .fold(0.0, f64::max);
        let epsilon = if max_variance > 0.0 {
            self.var_smoothing * max_variance
        } else {
            self.var_smoothing
        };

        let mut class_priors = Vec::with_capacity(classes.len());
        let mut means = Vec::with_capacity(classes.len());
        let mut variances = Vec::with_capacity(classes.len());
        for class in &classes {
            let members: Vec<&Vec<f64>> = matrix
                .rows
                .iter()
                .zip(labels)
                .filter(|(_, label)| *label == class)
                .map(|(row, _)| row)
                .collect();
            class_priors.push(members.len() as f64 / n_samples as f64);

            let mut class_means = Vec::with_capacity(n_features);
            let mut class_variances = Vec::with_capacity(n_features);
            for col in 0..n_features {
                let values = members.iter().map(|row| row[col]);
                let mean = values.clone().sum::<f64>() / members.len() as f64;
                class_means.push(mean);
                class_variances.push(column_variance(values) + epsilon);
            }
            means.push(class_means);
            variances.push(class_variances);
        }

        self.feature_columns = matrix.columns.clone();
        self.classes = classes;
        self.class_priors = class_priors;
        self.means = means;
        self.variances = variances;
        Ok(())
    }

    fn predict(&self, row: &[f64]) -> Result<Prediction, ClassifierError> {
        let proba = self.predict_proba(row)?;
        let (best, confidence) = proba
            .iter()
            .copied()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |best, (index, p)| {
                if p > best.1 {
                    (index, p)
                } else {
                    best
                }
            });
        Ok(Prediction {
            code: self.classes[best],
            confidence: Some(confidence),
        })
    }
}

fn column_variance(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let n = values.clone().count();
    if n == 0 {
        return 0.0;
    }
    let mean = values.clone().sum::<f64>() / n as f64;
    values.map(|v| (v - mean) * (v - mean)).sum::<f64>() / n as f64
}
