//! Shared record-to-features projection used by both fitting and transforming.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::normalize::FlatRecord;
use crate::schema::CanonicalSchema;

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("cannot fit on an empty table")]
    EmptyTable,
    #[error("label column '{0}' is missing from the table")]
    MissingLabelColumn(String),
    #[error("none of the canonical feature columns are present")]
    NoFeatureColumns,
    #[error("non-numeric value '{value}' in feature column {column}")]
    NonNumeric { column: String, value: String },
    #[error("no artifact bundle found at {path}")]
    BundleNotFound { path: PathBuf },
    #[error("invalid artifact bundle: {0}")]
    InvalidBundle(String),
    #[error("unsupported artifact format version in {file}: expected {expected}, got {actual}")]
    UnsupportedFormatVersion {
        file: &'static str,
        expected: u32,
        actual: u32,
    },
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
    #[error(
        "calibration fingerprint mismatch: bundle fitted with {fitted}, configured {configured}; refit required"
    )]
    CalibrationMismatch { fitted: String, configured: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Dense numeric rows in a fixed column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl FeatureMatrix {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }
}

/// Canonical columns found in `available`, in canonical order.
pub fn select_feature_columns(schema: &CanonicalSchema, available: &[String]) -> Vec<String> {
    schema
        .columns()
        .iter()
        .filter(|column| available.iter().any(|name| name == *column))
        .map(|column| column.to_string())
        .collect()
}

/// Re-projects a record onto `columns`; absent columns become missing.
pub fn project_record(
    record: &FlatRecord,
    columns: &[String],
) -> Result<Vec<Option<f64>>, FeatureError> {
    columns
        .iter()
        .map(|column| coerce_feature_value(column, record.get(column)))
        .collect()
}

pub fn coerce_feature_value(
    column: &str,
    value: Option<&Value>,
) -> Result<Option<f64>, FeatureError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => Ok(number.as_f64().filter(|v| v.is_finite())),
        Some(Value::Bool(flag)) => Ok(Some(if *flag { 1.0 } else { 0.0 })),
        Some(Value::String(text)) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse::<f64>()
                .map(|v| Some(v).filter(|v| v.is_finite()))
                .map_err(|_| FeatureError::NonNumeric {
                    column: column.to_string(),
                    value: text.clone(),
                })
        }
        Some(nested) => Err(FeatureError::NonNumeric {
            column: column.to_string(),
            value: nested.to_string(),
        }),
    }
}
