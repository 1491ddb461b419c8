//! Environment-driven configuration for the binaries.
//!
//! Every value has a default; `HERBSCAN_*` variables override them. Library
//! code never reads the environment, it only receives these structs.

use std::env;
use std::fs;
use std::path::PathBuf;

use thiserror::Error;

use crate::calibration::Calibration;
use crate::collect::{CollectConfig, UploadTarget};
use crate::fitter::DEFAULT_LABEL_COLUMN;
use crate::ingest::{IngestConfig, IngestError, TimeBounds};
use crate::observability::parse_bool;
use crate::scan::HttpScanConfig;
use crate::train::TrainConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is required")]
    Missing { var: &'static str },
    #[error("{var}='{value}' is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Shared by training, collection and prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub artifact_dir: PathBuf,
    pub model_dir: PathBuf,
    pub label_column: String,
    pub scale: bool,
    pub calibration: Calibration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from("artifacts"),
            model_dir: PathBuf::from("artifacts"),
            label_column: DEFAULT_LABEL_COLUMN.to_string(),
            scale: false,
            calibration: Calibration::identity(),
        }
    }
}

/// Where a collection run reads items from.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanSource {
    Http(HttpScanConfig),
    Snapshot(PathBuf),
}

/// Everything the collection binary needs beyond the ingest settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectJob {
    pub collect: CollectConfig,
    pub label_encoding_path: Option<PathBuf>,
    pub bundle_dir: Option<PathBuf>,
    pub upload_endpoint: Option<String>,
}

pub fn pipeline_config_from_env() -> Result<PipelineConfig, ConfigError> {
    let mut config = PipelineConfig::default();

    if let Some(dir) = var("HERBSCAN_ARTIFACT_DIR") {
        config.artifact_dir = PathBuf::from(dir);
        config.model_dir = config.artifact_dir.clone();
    }
    if let Some(dir) = var("HERBSCAN_MODEL_DIR") {
        config.model_dir = PathBuf::from(dir);
    }
    if let Some(column) = var("HERBSCAN_LABEL_COLUMN") {
        config.label_column = column;
    }
    if let Some(scale) = parsed_bool("HERBSCAN_SCALE")? {
        config.scale = scale;
    }
    config.calibration = calibration_from_env()?;

    Ok(config)
}

/// `HERBSCAN_CALIBRATION` holds inline JSON, `HERBSCAN_CALIBRATION_PATH` a JSON file;
/// both map feature names to `{"gain": .., "offset": ..}`.
pub fn calibration_from_env() -> Result<Calibration, ConfigError> {
    if let Some(inline) = var("HERBSCAN_CALIBRATION") {
        return parse_calibration("HERBSCAN_CALIBRATION", &inline);
    }
    if let Some(path) = var("HERBSCAN_CALIBRATION_PATH") {
        let path = PathBuf::from(path);
        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        return parse_calibration("HERBSCAN_CALIBRATION_PATH", &text);
    }
    Ok(Calibration::identity())
}

fn parse_calibration(var: &'static str, text: &str) -> Result<Calibration, ConfigError> {
    serde_json::from_str(text).map_err(|err| ConfigError::Invalid {
        var,
        value: text.to_string(),
        reason: err.to_string(),
    })
}

pub fn ingest_config_from_env() -> Result<IngestConfig, ConfigError> {
    let table = var("HERBSCAN_TABLE").ok_or(ConfigError::Missing {
        var: "HERBSCAN_TABLE",
    })?;
    let bounds = TimeBounds::from_dates(
        var("HERBSCAN_START").as_deref(),
        var("HERBSCAN_END").as_deref(),
    )?;

    let mut config = IngestConfig {
        table,
        bounds,
        ..IngestConfig::default()
    };
    config.limit = parsed::<u64>("HERBSCAN_LIMIT")?.filter(|limit| *limit > 0);
    if let Some(rate) = parsed::<f64>("HERBSCAN_SAMPLE_RATE")? {
        if !(0.0..=1.0).contains(&rate) {
            return Err(ConfigError::Invalid {
                var: "HERBSCAN_SAMPLE_RATE",
                value: rate.to_string(),
                reason: "must be within [0, 1]".to_string(),
            });
        }
        config.sample_rate = rate;
    }
    config.seed = parsed::<u64>("HERBSCAN_SEED")?;
    config.page_size = parsed::<u32>("HERBSCAN_PAGE_SIZE")?.filter(|size| *size > 0);

    Ok(config)
}

pub fn http_scan_config_from_env() -> Result<HttpScanConfig, ConfigError> {
    let mut config = HttpScanConfig::default();
    if let Some(region) = var("HERBSCAN_REGION").or_else(|| var("AWS_REGION")) {
        config.region = region;
    }
    if let Some(endpoint) = var("HERBSCAN_SCAN_ENDPOINT") {
        config.endpoint = endpoint;
    }
    if let Some(timeout_ms) = parsed::<u64>("HERBSCAN_HTTP_TIMEOUT_MS")? {
        config.timeout_ms = timeout_ms;
    }
    Ok(config)
}

/// A snapshot path wins over the HTTP endpoint.
pub fn scan_source_from_env() -> Result<ScanSource, ConfigError> {
    match var("HERBSCAN_SNAPSHOT_PATH") {
        Some(path) => Ok(ScanSource::Snapshot(PathBuf::from(path))),
        None => Ok(ScanSource::Http(http_scan_config_from_env()?)),
    }
}

pub fn collect_job_from_env() -> Result<CollectJob, ConfigError> {
    let mut collect = CollectConfig::default();
    if let Some(dir) = var("HERBSCAN_OUT_DIR") {
        collect.output_dir = PathBuf::from(dir);
    }
    if let Some(name) = var("HERBSCAN_RAW_CSV") {
        collect.raw_csv_name = name;
    }
    if let Some(name) = var("HERBSCAN_TRAIN_CSV") {
        collect.train_csv_name = name;
    }
    collect.upload = var("HERBSCAN_UPLOAD_BUCKET").map(|bucket| UploadTarget {
        bucket,
        prefix: var("HERBSCAN_UPLOAD_PREFIX").unwrap_or_default(),
    });

    let upload_endpoint = var("HERBSCAN_UPLOAD_ENDPOINT");
    if collect.upload.is_some() && upload_endpoint.is_none() {
        return Err(ConfigError::Missing {
            var: "HERBSCAN_UPLOAD_ENDPOINT",
        });
    }

    Ok(CollectJob {
        collect,
        label_encoding_path: var("HERBSCAN_LABEL_ENCODING").map(PathBuf::from),
        bundle_dir: var("HERBSCAN_BUNDLE_DIR").map(PathBuf::from),
        upload_endpoint,
    })
}

pub fn train_config_from_env(pipeline: &PipelineConfig) -> Result<TrainConfig, ConfigError> {
    let mut config = TrainConfig {
        artifact_dir: pipeline.artifact_dir.clone(),
        model_dir: pipeline.model_dir.clone(),
        label_column: pipeline.label_column.clone(),
        scale: pipeline.scale,
        calibration: pipeline.calibration.clone(),
        ..TrainConfig::default()
    };
    if let Some(path) = var("HERBSCAN_DATASET") {
        config.dataset_path = PathBuf::from(path);
    }
    if let Some(fraction) = parsed::<f64>("HERBSCAN_TEST_FRACTION")? {
        config.test_fraction = fraction;
    }
    if let Some(seed) = parsed::<u64>("HERBSCAN_TRAIN_SEED")? {
        config.seed = seed;
    }
    Ok(config)
}

fn var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parsed<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|raw| {
            raw.parse::<T>().map_err(|err| ConfigError::Invalid {
                var: name,
                value: raw.clone(),
                reason: err.to_string(),
            })
        })
        .transpose()
}

fn parsed_bool(name: &'static str) -> Result<Option<bool>, ConfigError> {
    var(name)
        .map(|raw| {
            parse_bool(&raw).ok_or_else(|| ConfigError::Invalid {
                var: name,
                value: raw.clone(),
                reason: "expected a boolean".to_string(),
            })
        })
        .transpose()
}
