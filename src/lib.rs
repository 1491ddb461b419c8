//! herbscan core crate.
//!
//! Sensor readings flow from the reading store through ingestion (paged
//! scans, dedup, windowing, normalization) into one shared feature pipeline
//! (alias mapping, calibration, median imputation, optional scaling) used
//! identically at training and prediction time.

mod artifacts;
mod calibration;
mod classifier;
mod collect;
mod config;
mod features;
mod fitter;
mod fs_util;
mod ingest;
mod labels;
mod normalize;
mod observability;
mod predict;
mod scan;
mod schema;
mod table;
mod train;
mod transformer;

pub use artifacts::{
    assert_bundle_compatible, load_bundle, save_bundle, ArtifactBundle, MedianImputer,
    StandardScaler, ARTIFACT_FORMAT_VERSION, CURRENT_POINTER_FILE, FEATURE_COLUMNS_FILE,
    IMPUTER_FILE, SCALER_FILE,
};
pub use calibration::{Calibration, Correction};
pub use classifier::{
    Classifier, ClassifierError, GaussianNb, Prediction, MODEL_FILE, MODEL_FORMAT_VERSION,
};
pub use collect::{
    prediction_label, run_collection, CollectConfig, CollectError, CollectReport, CollectSinks,
    HttpObjectUploader, ObjectUploader, UploadError, UploadTarget, PREDICTION_LABEL_FIELD,
};
pub use config::{
    calibration_from_env, collect_job_from_env, http_scan_config_from_env,
    ingest_config_from_env, pipeline_config_from_env, scan_source_from_env,
    train_config_from_env, CollectJob, ConfigError, PipelineConfig, ScanSource,
};
pub use features::{
    coerce_feature_value, project_record, select_feature_columns, FeatureError, FeatureMatrix,
};
pub use fitter::{fit_artifacts, label_text, FitConfig, FitOutcome, DEFAULT_LABEL_COLUMN};
pub use ingest::{
    decode_wire_item, decode_wire_value, DedupKey, IngestConfig, IngestError, IngestReport,
    IngestRun, IngestState, IngestionController, TimeBounds,
};
pub use labels::{LabelEncoding, LabelError, LABEL_ENCODING_FILE};
pub use normalize::{
    has_dedup_identity, normalize_record, normalize_request, FlatRecord, RawRecord,
    DEVICE_ID_FIELD, METADATA_FIELDS, RAW_JSON_FIELD, SENSOR_READINGS_FIELD, TIMESTAMP_FIELD,
};
pub use observability::{
    init_logging, log_app_finish, log_app_start, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use predict::{
    run_message_loop, LineSource, LoopReport, MessageSource, PredictError, PredictReply,
    PredictRequest, PredictionResponse, Predictor,
};
pub use scan::{
    encode_wire_item, encode_wire_value, HttpScanConfig, HttpScanPager, ScanError, ScanFilter,
    ScanPage, ScanPager, ScanRequest, SqliteScanPager, StartKey, SCAN_TARGET,
};
pub use schema::{CanonicalSchema, FEATURE_COLUMNS, FEATURE_SCHEMA_VERSION, KEY_ALIASES};
pub use table::{write_records_csv, FeatureTable, TableError};
pub use train::{
    accuracy, confusion_matrix, save_trained_model, stratified_split, train_model, TrainConfig,
    TrainError, TrainReport,
};
pub use transformer::{FeatureTransformer, RecordOutcome};
