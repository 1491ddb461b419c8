//! Inference: single or batched JSON requests, CSV batches, and a live message loop.

use std::io::{BufRead, Write};
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::calibration::Calibration;
use crate::classifier::{Classifier, ClassifierError, GaussianNb, MODEL_FILE};
use crate::features::FeatureError;
use crate::labels::{LabelEncoding, LabelError, LABEL_ENCODING_FILE};
use crate::normalize::RawRecord;
use crate::table::{FeatureTable, TableError};
use crate::transformer::FeatureTransformer;

#[derive(Debug, Error)]
pub enum PredictError {
    #[error("unsupported prediction payload: expected an object or an array of objects, got {0}")]
    UnsupportedPayload(String),
    #[error("model does not match the feature bundle: {0}")]
    ModelMismatch(String),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error(transparent)]
    Label(#[from] LabelError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("message is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single request object or an array of them.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PredictRequest {
    Single(RawRecord),
    Batch(Vec<RawRecord>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub prediction: String,
    pub confidence: Option<f64>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PredictReply {
    Single(PredictionResponse),
    Batch(Vec<PredictionResponse>),
}

pub struct Predictor {
    transformer: FeatureTransformer,
    classifier: Box<dyn Classifier>,
    labels: Option<LabelEncoding>,
}

impl Predictor {
    pub fn new(
        transformer: FeatureTransformer,
        classifier: Box<dyn Classifier>,
        labels: Option<LabelEncoding>,
    ) -> Self {
        Self {
            transformer,
            classifier,
            labels,
        }
    }

    /// Loads `model.json` and, when present, `label_encoding.json` from `model_dir`.
    pub fn load(
        model_dir: &Path,
        artifact_dir: &Path,
        calibration: &Calibration,
    ) -> Result<Self, PredictError> {
        let transformer = FeatureTransformer::load(artifact_dir, calibration)?;
        let model = GaussianNb::load(&model_dir.join(MODEL_FILE))?;
        if model.feature_columns() != transformer.feature_columns() {
            return Err(PredictError::ModelMismatch(format!(
                "model columns {:?}, bundle columns {:?}",
                model.feature_columns(),
                transformer.feature_columns()
            )));
        }

        let labels_path = model_dir.join(LABEL_ENCODING_FILE);
        let labels = if labels_path.is_file() {
            let labels = LabelEncoding::load(&labels_path)?;
            if let Some(max) = model.classes().iter().max() {
                if *max >= labels.len() {
                    return Err(PredictError::ModelMismatch(format!(
                        "class code {max} has no label among {}",
                        labels.len()
                    )));
                }
            }
            Some(labels)
        } else {
            warn!(
                component = "predict",
                event = "predict.labels.missing",
                path = %labels_path.display()
            );
            None
        };

        info!(
            component = "predict",
            event = "predict.model.loaded",
            model_dir = %model_dir.display(),
            feature_columns = transformer.feature_columns().len(),
            labels = labels.as_ref().map_or(0, LabelEncoding::len)
        );

        Ok(Self::new(transformer, Box::new(model), labels))
    }

    pub fn predict_raw(&self, raw: &RawRecord) -> Result<PredictionResponse, PredictError> {
        let values = self.transformer.transform_raw(raw)?;
        let prediction = self.classifier.predict(&values)?;
        let label = match &self.labels {
            Some(labels) => labels.decode_or_raw(prediction.code),
            None => prediction.code.to_string(),
        };
        Ok(PredictionResponse {
            prediction: label,
            confidence: prediction.confidence,
            timestamp: Utc::now().timestamp(),
        })
    }

    pub fn predict_request(&self, request: &PredictRequest) -> Result<PredictReply, PredictError> {
        match request {
            PredictRequest::Single(raw) => Ok(PredictReply::Single(self.predict_raw(raw)?)),
            PredictRequest::Batch(raws) => raws
                .iter()
                .map(|raw| self.predict_raw(raw))
                .collect::<Result<Vec<_>, _>>()
                .map(PredictReply::Batch),
        }
    }

    pub fn predict_json(&self, payload: &str) -> Result<PredictReply, PredictError> {
        let value: Value = serde_json::from_str(payload)?;
        let request = parse_request(value)?;
        self.predict_request(&request)
    }

    /// One prediction per CSV row, in file order.
    pub fn predict_csv(&self, path: &Path) -> Result<Vec<PredictionResponse>, PredictError> {
        let table = FeatureTable::read_csv(path)?;
        table
            .rows()
            .iter()
            .map(|row| {
                let raw: RawRecord = row
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                self.predict_raw(&raw)
            })
            .collect()
    }
}

fn parse_request(value: Value) -> Result<PredictRequest, PredictError> {
    match value {
        Value::Object(_) | Value::Array(_) => serde_json::from_value(value.clone())
            .map_err(|_| PredictError::UnsupportedPayload(describe(&value))),
        other => Err(PredictError::UnsupportedPayload(describe(&other))),
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array containing non-objects",
        Value::Object(_) => "an object",
    }
    .to_string()
}

/// Source of live sensor payloads, one JSON object per message.
///
/// Payloads are raw bytes; decoding happens per message so a bad payload
/// fails only itself.
pub trait MessageSource {
    fn next_message(&mut self) -> Result<Option<Vec<u8>>, PredictError>;
}

/// Line-delimited messages from any buffered reader, e.g. stdin.
pub struct LineSource<R> {
    reader: R,
}

impl<R: BufRead> LineSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: BufRead> MessageSource for LineSource<R> {
    fn next_message(&mut self) -> Result<Option<Vec<u8>>, PredictError> {
        let mut line = Vec::new();
        if self.reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(None);
        }
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        Ok(Some(line))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopReport {
    pub processed: u64,
    pub failed: u64,
}

/// Predicts each message in turn; a bad message is reported to `errors` and skipped.
pub fn run_message_loop(
    predictor: &Predictor,
    source: &mut dyn MessageSource,
    out: &mut dyn Write,
    errors: &mut dyn Write,
) -> Result<LoopReport, PredictError> {
    let mut report = LoopReport::default();
    while let Some(message) = source.next_message()? {
        if message.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match predict_message(predictor, &message) {
            Ok(response) => {
                writeln!(out, "{}", serde_json::to_string(&response)?)?;
                out.flush()?;
                report.processed += 1;
                debug!(
                    component = "predict",
                    event = "predict.message.done",
                    prediction = %response.prediction
                );
            }
            Err(err) => {
                report.failed += 1;
                warn!(
                    component = "predict",
                    event = "predict.message.error",
                    error = %err
                );
                writeln!(errors, "Error: {err}")?;
            }
        }
    }

    info!(
        component = "predict",
        event = "predict.loop.finish",
        processed = report.processed,
        failed = report.failed
    );
    Ok(report)
}

fn predict_message(predictor: &Predictor, message: &[u8]) -> Result<PredictionResponse, PredictError> {
    let text = std::str::from_utf8(message)?;
    match serde_json::from_str::<Value>(text)? {
        Value::Object(raw) => predictor.predict_raw(&raw),
        other => Err(PredictError::UnsupportedPayload(describe(&other))),
    }
}
