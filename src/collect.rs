//! One collection run: ingest, decode prediction labels, write the raw and
//! train-ready tables, optionally upload both.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Number, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ingest::{IngestError, IngestReport, IngestionController};
use crate::labels::LabelEncoding;
use crate::normalize::FlatRecord;
use crate::scan::ScanPager;
use crate::table::{write_records_csv, TableError};
use crate::transformer::FeatureTransformer;

pub const PREDICTION_FIELD: &str = "prediction";
pub const PREDICTION_LABEL_FIELD: &str = "prediction_label";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("failed to build HTTP client: {0}")]
    HttpClientBuild(String),
    #[error("upload of {path} to {url} failed: {message}")]
    Request {
        path: PathBuf,
        url: String,
        message: String,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait ObjectUploader {
    fn upload(&self, local: &Path, bucket: &str, key: &str) -> Result<(), UploadError>;
}

/// `PUT {endpoint}/{bucket}/{key}` with the file body, e.g. against an
/// S3-compatible endpoint or a presigning gateway.
pub struct HttpObjectUploader {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl HttpObjectUploader {
    pub fn new(endpoint: impl Into<String>, timeout_ms: u64) -> Result<Self, UploadError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| UploadError::HttpClientBuild(err.to_string()))?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }
}

impl ObjectUploader for HttpObjectUploader {
    fn upload(&self, local: &Path, bucket: &str, key: &str) -> Result<(), UploadError> {
        let url = format!("{}/{bucket}/{key}", self.endpoint.trim_end_matches('/'));
        let body = fs::read(local)?;
        let request_error = |message: String| UploadError::Request {
            path: local.to_path_buf(),
            url: url.clone(),
            message,
        };

        let response = self
            .client
            .put(&url)
            .header("Content-Type", "text/csv")
            .body(body)
            .send()
            .map_err(|err| request_error(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(request_error(format!("unexpected HTTP status {status}")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub bucket: String,
    pub prefix: String,
}

impl UploadTarget {
    /// `prefix/name`, or just `name` when the prefix is empty.
    pub fn key_for(&self, name: &str) -> String {
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}/{name}")
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectConfig {
    pub output_dir: PathBuf,
    pub raw_csv_name: String,
    pub train_csv_name: String,
    pub upload: Option<UploadTarget>,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            raw_csv_name: "raw_scans.csv".to_string(),
            train_csv_name: "train_ready.csv".to_string(),
            upload: None,
        }
    }
}

/// Optional collaborators of a collection run.
#[derive(Default, Clone, Copy)]
pub struct CollectSinks<'a> {
    pub label_encoding: Option<&'a LabelEncoding>,
    pub transformer: Option<&'a FeatureTransformer>,
    pub uploader: Option<&'a dyn ObjectUploader>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectReport {
    pub ingest: IngestReport,
    pub raw_rows: usize,
    pub train_rows: usize,
    pub train_skipped: usize,
    pub raw_csv: Option<PathBuf>,
    pub train_csv: Option<PathBuf>,
    pub uploaded_keys: Vec<String>,
}

pub fn run_collection(
    controller: &mut IngestionController,
    pager: &mut dyn ScanPager,
    config: &CollectConfig,
    sinks: CollectSinks<'_>,
) -> Result<CollectReport, CollectError> {
    fs::create_dir_all(&config.output_dir)?;
    let run = controller.run(pager)?;

    let mut rows = run.records;
    let mut train_rows = Vec::new();
    let mut train_skipped = 0;

    for row in &mut rows {
        let label = prediction_label(row.get(PREDICTION_FIELD), sinks.label_encoding);
        row.insert(PREDICTION_LABEL_FIELD, label);

        if let Some(transformer) = sinks.transformer {
            match transformer.transform_record(row) {
                Ok(values) => train_rows.push(with_features(row, transformer.feature_columns(), &values)),
                Err(err) => {
                    train_skipped += 1;
                    debug!(
                        component = "collect",
                        event = "collect.train_row.skipped",
                        error = %err
                    );
                }
            }
        }
    }

    let raw_csv = if rows.is_empty() {
        warn!(
            component = "collect",
            event = "collect.raw.empty",
            output_dir = %config.output_dir.display()
        );
        None
    } else {
        let path = config.output_dir.join(&config.raw_csv_name);
        write_records_csv(&path, &rows)?;
        Some(path)
    };

    let train_csv = if train_rows.is_empty() {
        None
    } else {
        let path = config.output_dir.join(&config.train_csv_name);
        write_records_csv(&path, &train_rows)?;
        Some(path)
    };

    let mut uploaded_keys = Vec::new();
    if let (Some(target), Some(uploader)) = (&config.upload, sinks.uploader) {
        for path in raw_csv.iter().chain(train_csv.iter()) {
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            let key = target.key_for(&name);
            uploader.upload(path, &target.bucket, &key)?;
            info!(
                component = "collect",
                event = "collect.upload.done",
                bucket = %target.bucket,
                key = %key
            );
            uploaded_keys.push(key);
        }
    }

    let report = CollectReport {
        ingest: run.report,
        raw_rows: rows.len(),
        train_rows: train_rows.len(),
        train_skipped,
        raw_csv,
        train_csv,
        uploaded_keys,
    };

    info!(
        component = "collect",
        event = "collect.run.finish",
        raw_rows = report.raw_rows,
        train_rows = report.train_rows,
        train_skipped = report.train_skipped,
        uploads = report.uploaded_keys.len()
    );

    Ok(report)
}

/// Numeric predictions decode through the encoding; anything else keeps its text.
pub fn prediction_label(prediction: Option<&Value>, encoding: Option<&LabelEncoding>) -> Value {
    let prediction = prediction.cloned().unwrap_or(Value::Null);
    let Some(encoding) = encoding else {
        return prediction;
    };
    match &prediction {
        Value::Null => Value::Null,
        Value::Number(number) => {
            let decoded = prediction_code(number).and_then(|code| encoding.decode(code));
            Value::String(decoded.map_or_else(|| number.to_string(), str::to_string))
        }
        Value::String(text) => Value::String(text.clone()),
        other => Value::String(other.to_string()),
    }
}

fn prediction_code(number: &Number) -> Option<usize> {
    if let Some(code) = number.as_u64() {
        return usize::try_from(code).ok();
    }
    let float = number.as_f64()?;
    (float >= 0.0 && float.fract() == 0.0 && float < usize::MAX as f64).then_some(float as usize)
}

fn with_features(row: &FlatRecord, columns: &[String], values: &[f64]) -> FlatRecord {
    let mut out = row.clone();
    for (column, value) in columns.iter().zip(values) {
        let cell = Number::from_f64(*value)
            .map(Value::Number)
            .unwrap_or(Value::Null);
        out.insert(column.clone(), cell);
    }
    out
}
