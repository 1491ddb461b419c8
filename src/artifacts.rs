//! Fitted imputer/scaler bundle and its on-disk format.
//!
//! A bundle directory holds a `CURRENT` pointer naming one generation
//! directory. Each generation contains `feature_columns.json`, `imputer.json`
//! and, when scaling was enabled at fit time, `scaler.json`. Generations are
//! written in full before `CURRENT` is atomically replaced, so readers observe
//! either the previous bundle or the new one. A directory holding the three
//! files directly (no `CURRENT`) also loads.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::calibration::Calibration;
use crate::features::FeatureError;
use crate::fs_util::write_atomic;
use crate::schema::CanonicalSchema;

pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

pub const CURRENT_POINTER_FILE: &str = "CURRENT";
pub const FEATURE_COLUMNS_FILE: &str = "feature_columns.json";
pub const IMPUTER_FILE: &str = "imputer.json";
pub const SCALER_FILE: &str = "scaler.json";

const GENERATION_PREFIX: &str = "bundle-";
const IMPUTER_KIND: &str = "median_imputer";
const SCALER_KIND: &str = "standard_scaler";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedianImputer {
    fill_values: Vec<f64>,
}

impl MedianImputer {
    /// One median per column over the observed values; unobserved columns fill with 0.0.
    pub fn fit(rows: &[Vec<Option<f64>>], n_cols: usize) -> Self {
        let fill_values = (0..n_cols)
            .map(|col| {
                let mut observed: Vec<f64> = rows.iter().filter_map(|row| row[col]).collect();
                median(&mut observed).unwrap_or(0.0)
            })
            .collect();
        Self { fill_values }
    }

    pub fn from_fill_values(fill_values: Vec<f64>) -> Self {
        Self { fill_values }
    }

    pub fn fill_values(&self) -> &[f64] {
        &self.fill_values
    }

    pub fn transform_row(&self, row: &[Option<f64>]) -> Vec<f64> {
        row.iter()
            .zip(&self.fill_values)
            .map(|(cell, fill)| cell.unwrap_or(*fill))
            .collect()
    }
}

/// Centers by the column mean and divides by the population standard deviation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    mean: Vec<f64>,
    scale: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(rows: &[Vec<f64>], n_cols: usize) -> Self {
        let n = rows.len().max(1) as f64;
        let mut mean = vec![0.0; n_cols];
        let mut scale = vec![1.0; n_cols];

        for col in 0..n_cols {
            let col_mean = rows.iter().map(|row| row[col]).sum::<f64>() / n;
            let variance = rows
                .iter()
                .map(|row| {
                    let d = row[col] - col_mean;
                    d * d
                })
                .sum::<f64>()
                / n;
            let std = variance.sqrt();
            mean[col] = col_mean;
            scale[col] = if std > 0.0 && std.is_finite() { std } else { 1.0 };
        }

        Self { mean, scale }
    }

    pub fn from_parts(mean: Vec<f64>, scale: Vec<f64>) -> Self {
        Self { mean, scale }
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn scale(&self) -> &[f64] {
        &self.scale
    }

    pub fn transform_row(&self, row: &mut [f64]) {
        for ((value, mean), scale) in row.iter_mut().zip(&self.mean).zip(&self.scale) {
            *value = (*value - mean) / scale;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactBundle {
    pub schema_version: u32,
    pub schema_fingerprint: String,
    pub calibration_fingerprint: String,
    pub feature_columns: Vec<String>,
    pub imputer: MedianImputer,
    pub scaler: Option<StandardScaler>,
}

impl ArtifactBundle {
    /// Calibrate, impute, then scale; the single path shared by fit and inference.
    pub fn transform_row(&self, calibration: &Calibration, mut row: Vec<Option<f64>>) -> Vec<f64> {
        calibration.apply_row(&self.feature_columns, &mut row);
        let mut values = self.imputer.transform_row(&row);
        if let Some(scaler) = &self.scaler {
            scaler.transform_row(&mut values);
        }
        values
    }

    pub fn is_scaled(&self) -> bool {
        self.scaler.is_some()
    }

    fn validate(&self) -> Result<(), FeatureError> {
        let n = self.feature_columns.len();
        if n == 0 {
            return Err(FeatureError::InvalidBundle(
                "feature column list is empty".to_string(),
            ));
        }
        if self.imputer.fill_values.len() != n {
            return Err(FeatureError::InvalidBundle(format!(
                "imputer has {} fill values for {n} columns",
                self.imputer.fill_values.len()
            )));
        }
        if let Some(scaler) = &self.scaler {
            if scaler.mean.len() != n || scaler.scale.len() != n {
                return Err(FeatureError::InvalidBundle(format!(
                    "scaler has {}/{} parameters for {n} columns",
                    scaler.mean.len(),
                    scaler.scale.len()
                )));
            }
        }
        Ok(())
    }
}

pub fn assert_bundle_compatible(
    bundle: &ArtifactBundle,
    schema: &CanonicalSchema,
    calibration: &Calibration,
) -> Result<(), FeatureError> {
    if bundle.schema_version != schema.version() {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: schema.version(),
            actual: bundle.schema_version,
        });
    }

    let expected = schema.fingerprint();
    if bundle.schema_fingerprint != expected {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected,
            actual: bundle.schema_fingerprint.clone(),
        });
    }

    let configured = calibration.fingerprint();
    if bundle.calibration_fingerprint != configured {
        return Err(FeatureError::CalibrationMismatch {
            fitted: bundle.calibration_fingerprint.clone(),
            configured,
        });
    }

    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct ImputerFile {
    format_version: u32,
    kind: String,
    schema_version: u32,
    schema_fingerprint: String,
    calibration_fingerprint: String,
    feature_columns: Vec<String>,
    fill_values: Vec<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ScalerFile {
    format_version: u32,
    kind: String,
    feature_columns: Vec<String>,
    mean: Vec<f64>,
    scale: Vec<f64>,
}

/// Writes a new generation and promotes it; returns the generation directory.
pub fn save_bundle(dir: &Path, bundle: &ArtifactBundle) -> Result<PathBuf, FeatureError> {
    bundle.validate()?;
    fs::create_dir_all(dir)?;

    let generation = next_generation_name(dir)?;
    let generation_dir = dir.join(&generation);
    fs::create_dir_all(&generation_dir)?;

    write_atomic(
        &generation_dir.join(FEATURE_COLUMNS_FILE),
        &serde_json::to_vec(&bundle.feature_columns)?,
    )?;

    let imputer_file = ImputerFile {
        format_version: ARTIFACT_FORMAT_VERSION,
        kind: IMPUTER_KIND.to_string(),
        schema_version: bundle.schema_version,
        schema_fingerprint: bundle.schema_fingerprint.clone(),
        calibration_fingerprint: bundle.calibration_fingerprint.clone(),
        feature_columns: bundle.feature_columns.clone(),
        fill_values: bundle.imputer.fill_values.clone(),
    };
    write_atomic(
        &generation_dir.join(IMPUTER_FILE),
        &serde_json::to_vec_pretty(&imputer_file)?,
    )?;

    if let Some(scaler) = &bundle.scaler {
        let scaler_file = ScalerFile {
            format_version: ARTIFACT_FORMAT_VERSION,
            kind: SCALER_KIND.to_string(),
            feature_columns: bundle.feature_columns.clone(),
            mean: scaler.mean.clone(),
            scale: scaler.scale.clone(),
        };
        write_atomic(
            &generation_dir.join(SCALER_FILE),
            &serde_json::to_vec_pretty(&scaler_file)?,
        )?;
    }

    write_atomic(&dir.join(CURRENT_POINTER_FILE), generation.as_bytes())?;

    info!(
        component = "artifacts",
        event = "artifacts.bundle.promoted",
        dir = %dir.display(),
        generation = %generation,
        feature_columns = bundle.feature_columns.len(),
        scaled = bundle.is_scaled()
    );

    prune_generations(dir, &generation);
    Ok(generation_dir)
}

pub fn load_bundle(dir: &Path) -> Result<ArtifactBundle, FeatureError> {
    let bundle_dir = resolve_bundle_dir(dir)?;
    let bundle = load_bundle_files(&bundle_dir)?;

    debug!(
        component = "artifacts",
        event = "artifacts.bundle.loaded",
        path = %bundle_dir.display(),
        feature_columns = bundle.feature_columns.len(),
        scaled = bundle.is_scaled()
    );

    Ok(bundle)
}

fn resolve_bundle_dir(dir: &Path) -> Result<PathBuf, FeatureError> {
    let pointer = dir.join(CURRENT_POINTER_FILE);
    if pointer.is_file() {
        let name = fs::read_to_string(&pointer)?;
        let name = name.trim();
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(FeatureError::InvalidBundle(format!(
                "CURRENT pointer holds an invalid generation name '{name}'"
            )));
        }
        let generation_dir = dir.join(name);
        if !generation_dir.join(FEATURE_COLUMNS_FILE).is_file() {
            return Err(FeatureError::BundleNotFound {
                path: generation_dir,
            });
        }
        return Ok(generation_dir);
    }

    if dir.join(FEATURE_COLUMNS_FILE).is_file() {
        return Ok(dir.to_path_buf());
    }

    Err(FeatureError::BundleNotFound {
        path: dir.to_path_buf(),
    })
}

fn load_bundle_files(bundle_dir: &Path) -> Result<ArtifactBundle, FeatureError> {
    let feature_columns: Vec<String> =
        serde_json::from_slice(&fs::read(bundle_dir.join(FEATURE_COLUMNS_FILE))?)?;

    let imputer_path = bundle_dir.join(IMPUTER_FILE);
    if !imputer_path.is_file() {
        return Err(FeatureError::InvalidBundle(format!(
            "{} is missing",
            imputer_path.display()
        )));
    }
    let imputer_file: ImputerFile = serde_json::from_slice(&fs::read(&imputer_path)?)?;
    check_header(IMPUTER_FILE, imputer_file.format_version, &imputer_file.kind, IMPUTER_KIND)?;
    check_columns(IMPUTER_FILE, &feature_columns, &imputer_file.feature_columns)?;

    let scaler_path = bundle_dir.join(SCALER_FILE);
    let scaler = if scaler_path.is_file() {
        let scaler_file: ScalerFile = serde_json::from_slice(&fs::read(&scaler_path)?)?;
        check_header(SCALER_FILE, scaler_file.format_version, &scaler_file.kind, SCALER_KIND)?;
        check_columns(SCALER_FILE, &feature_columns, &scaler_file.feature_columns)?;
        Some(StandardScaler::from_parts(scaler_file.mean, scaler_file.scale))
    } else {
        None
    };

    let bundle = ArtifactBundle {
        schema_version: imputer_file.schema_version,
        schema_fingerprint: imputer_file.schema_fingerprint,
        calibration_fingerprint: imputer_file.calibration_fingerprint,
        feature_columns,
        imputer: MedianImputer::from_fill_values(imputer_file.fill_values),
        scaler,
    };
    bundle.validate()?;
    Ok(bundle)
}

fn check_header(
    file: &'static str,
    format_version: u32,
    kind: &str,
    expected_kind: &str,
) -> Result<(), FeatureError> {
    if format_version != ARTIFACT_FORMAT_VERSION {
        return Err(FeatureError::UnsupportedFormatVersion {
            file,
            expected: ARTIFACT_FORMAT_VERSION,
            actual: format_version,
        });
    }
    if kind != expected_kind {
        return Err(FeatureError::InvalidBundle(format!(
            "{file} has kind '{kind}', expected '{expected_kind}'"
        )));
    }
    Ok(())
}

fn check_columns(
    file: &'static str,
    expected: &[String],
    actual: &[String],
) -> Result<(), FeatureError> {
    if expected != actual {
        return Err(FeatureError::InvalidBundle(format!(
            "{file} columns {actual:?} disagree with {FEATURE_COLUMNS_FILE} {expected:?}"
        )));
    }
    Ok(())
}

fn next_generation_name(dir: &Path) -> Result<String, FeatureError> {
    let now_ms = Utc::now().timestamp_millis().max(0);
    for seq in 0..1_000u32 {
        let name = format!("{GENERATION_PREFIX}{now_ms:013}-{seq:03}");
        if !dir.join(&name).exists() {
            return Ok(name);
        }
    }
    Err(FeatureError::InvalidBundle(format!(
        "could not allocate a generation directory under {}",
        dir.display()
    )))
}

/// Keeps the promoted generation and the one before it.
fn prune_generations(dir: &Path, current: &str) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(
                component = "artifacts",
                event = "artifacts.prune.failed",
                dir = %dir.display(),
                error = %err
            );
            return;
        }
    };

    let mut generations: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|name| name.starts_with(GENERATION_PREFIX) && name.as_str() != current)
        .collect();
    generations.sort();
    generations.pop();

    for name in generations {
        let path = dir.join(&name);
        match fs::remove_dir_all(&path) {
            Ok(()) => debug!(
                component = "artifacts",
                event = "artifacts.prune.removed",
                path = %path.display()
            ),
            Err(err) => warn!(
                component = "artifacts",
                event = "artifacts.prune.failed",
                path = %path.display(),
                error = %err
            ),
        }
    }
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2.0)
    }
}
