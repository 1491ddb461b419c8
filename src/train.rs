//! Training run: fit the bundle, reload it, encode labels, split, fit and
//! evaluate the classifier, then persist model and label encoding together.

use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;
use tracing::{error, info};

use crate::calibration::Calibration;
use crate::classifier::{Classifier, ClassifierError, GaussianNb, MODEL_FILE};
use crate::features::{FeatureError, FeatureMatrix};
use crate::fitter::{fit_artifacts, FitConfig, DEFAULT_LABEL_COLUMN};
use crate::labels::{LabelEncoding, LabelError, LABEL_ENCODING_FILE};
use crate::table::{FeatureTable, TableError};
use crate::transformer::FeatureTransformer;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("test fraction must be within [0, 1), got {0}")]
    InvalidTestFraction(f64),
    #[error("no rows carry a label in column '{0}'")]
    NoLabelledRows(String),
    #[error("reloaded bundle at {} does not reproduce the fit-time matrix", .path.display())]
    ReloadMismatch { path: PathBuf },
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Label(#[from] LabelError),
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
}

#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub dataset_path: PathBuf,
    pub artifact_dir: PathBuf,
    pub model_dir: PathBuf,
    pub label_column: String,
    pub scale: bool,
    pub calibration: Calibration,
    pub test_fraction: f64,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            dataset_path: PathBuf::from("main_dataset.csv"),
            artifact_dir: PathBuf::from("artifacts"),
            model_dir: PathBuf::from("artifacts"),
            label_column: DEFAULT_LABEL_COLUMN.to_string(),
            scale: false,
            calibration: Calibration::identity(),
            test_fraction: 0.2,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    pub rows: usize,
    pub unlabelled_rows: usize,
    pub train_rows: usize,
    pub test_rows: usize,
    pub feature_columns: Vec<String>,
    pub labels: Vec<String>,
    pub train_accuracy: f64,
    /// `None` when the split left no test rows.
    pub test_accuracy: Option<f64>,
    /// Rows are true labels, columns predicted labels, over the test rows.
    pub confusion: Vec<Vec<u64>>,
    pub bundle_path: PathBuf,
    pub model_path: PathBuf,
    pub label_encoding_path: PathBuf,
}

pub fn train_model(config: &TrainConfig) -> Result<TrainReport, TrainError> {
    if !(0.0..1.0).contains(&config.test_fraction) {
        return Err(TrainError::InvalidTestFraction(config.test_fraction));
    }

    let table = FeatureTable::read_csv(&config.dataset_path)?;
    let fit_config = FitConfig {
        artifact_dir: config.artifact_dir.clone(),
        label_column: config.label_column.clone(),
        scale: config.scale,
        calibration: config.calibration.clone(),
        ..FitConfig::default()
    };
    let outcome = fit_artifacts(&table, &fit_config)?;

    // Train on what inference will see: the bundle as reloaded from disk.
    let transformer = FeatureTransformer::load(&config.artifact_dir, &config.calibration)?;
    let matrix = transformer.transform_table(&table)?;
    ensure_reload_consistent(&matrix, &outcome.matrix, &outcome.bundle_path)?;

    let encoding = outcome.label_encoding;
    let mut labelled = FeatureMatrix::new(matrix.columns.clone());
    let mut codes = Vec::new();
    for (row, label) in matrix.rows.into_iter().zip(&outcome.labels) {
        if let Some(label) = label {
            labelled.rows.push(row);
            codes.push(encoding.encode(label)?);
        }
    }
    if codes.is_empty() {
        return Err(TrainError::NoLabelledRows(config.label_column.clone()));
    }
    let unlabelled_rows = table.len() - codes.len();

    let (train_idx, test_idx) = stratified_split(&codes, config.test_fraction, config.seed);
    let train_matrix = select_rows(&labelled, &train_idx);
    let train_codes: Vec<usize> = train_idx.iter().map(|&i| codes[i]).collect();
    let test_matrix = select_rows(&labelled, &test_idx);
    let test_codes: Vec<usize> = test_idx.iter().map(|&i| codes[i]).collect();

    info!(
        component = "train",
        event = "train.fit.start",
        train_rows = train_codes.len(),
        test_rows = test_codes.len(),
        classes = encoding.len(),
        seed = config.seed
    );

    let mut model = GaussianNb::new();
    model.fit(&train_matrix, &train_codes)?;

    let train_pred = model.predict_many(&train_matrix.rows)?;
    let test_pred = model.predict_many(&test_matrix.rows)?;
    let train_accuracy = accuracy(&train_codes, &train_pred).unwrap_or(0.0);
    let test_accuracy = accuracy(&test_codes, &test_pred);
    let confusion = confusion_matrix(&test_codes, &test_pred, encoding.len());

    let model_path = config.model_dir.join(MODEL_FILE);
    let label_encoding_path = config.model_dir.join(LABEL_ENCODING_FILE);
    save_trained_model(&config.model_dir, &model, &encoding)?;

    let report = TrainReport {
        rows: table.len(),
        unlabelled_rows,
        train_rows: train_codes.len(),
        test_rows: test_codes.len(),
        feature_columns: matrix.columns,
        labels: encoding.labels().to_vec(),
        train_accuracy,
        test_accuracy,
        confusion,
        bundle_path: outcome.bundle_path,
        model_path,
        label_encoding_path,
    };

    info!(
        component = "train",
        event = "train.run.finish",
        rows = report.rows,
        train_accuracy = report.train_accuracy,
        test_accuracy = ?report.test_accuracy,
        model_path = %report.model_path.display()
    );

    Ok(report)
}

/// Label encoding first, model last: a reader that finds `model.json` finds its labels.
pub fn save_trained_model(
    model_dir: &Path,
    model: &GaussianNb,
    encoding: &LabelEncoding,
) -> Result<(), TrainError> {
    encoding.save(&model_dir.join(LABEL_ENCODING_FILE))?;
    model.save(&model_dir.join(MODEL_FILE))?;
    Ok(())
}

/// Per-class shuffled split; each class keeps at least one training row.
pub fn stratified_split(codes: &[usize], test_fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let n_classes = codes.iter().copied().max().map_or(0, |max| max + 1);
    let mut train = Vec::new();
    let mut test = Vec::new();

    for class in 0..n_classes {
        let mut members: Vec<usize> = codes
            .iter()
            .enumerate()
            .filter(|(_, code)| **code == class)
            .map(|(index, _)| index)
            .collect();
        if members.is_empty() {
            continue;
        }
        members.shuffle(&mut rng);
        let wanted = (members.len() as f64 * test_fraction).round() as usize;
        let n_test = wanted.min(members.len() - 1);
        test.extend_from_slice(&members[..n_test]);
        train.extend_from_slice(&members[n_test..]);
    }

    train.sort_unstable();
    test.sort_unstable();
    (train, test)
}

pub fn accuracy(truth: &[usize], predicted: &[usize]) -> Option<f64> {
    if truth.is_empty() {
        return None;
    }
    let correct = truth.iter().zip(predicted).filter(|(t, p)| t == p).count();
    Some(correct as f64 / truth.len() as f64)
}

pub fn confusion_matrix(truth: &[usize], predicted: &[usize], n_classes: usize) -> Vec<Vec<u64>> {
    let mut matrix = vec![vec![0u64; n_classes]; n_classes];
    for (&t, &p) in truth.iter().zip(predicted) {
        if t < n_classes && p < n_classes {
            matrix[t][p] += 1;
        }
    }
    matrix
}

/// The reloaded bundle must transform the table exactly as the fitted one did.
fn ensure_reload_consistent(
    reloaded: &FeatureMatrix,
    fitted: &FeatureMatrix,
    bundle_path: &Path,
) -> Result<(), TrainError> {
    if reloaded == fitted {
        return Ok(());
    }
    error!(
        component = "train",
        event = "train.matrix.reload_mismatch",
        path = %bundle_path.display()
    );
    Err(TrainError::ReloadMismatch {
        path: bundle_path.to_path_buf(),
    })
}

fn select_rows(matrix: &FeatureMatrix, indices: &[usize]) -> FeatureMatrix {
    FeatureMatrix {
        columns: matrix.columns.clone(),
        rows: indices.iter().map(|&i| matrix.rows[i].clone()).collect(),
    }
}
