//! Read-only handle applying a persisted bundle to inference-time records.

use std::path::Path;

use tracing::{debug, info};

use crate::artifacts::{assert_bundle_compatible, load_bundle, ArtifactBundle};
use crate::calibration::Calibration;
use crate::features::{project_record, FeatureError, FeatureMatrix};
use crate::normalize::{normalize_request, FlatRecord, RawRecord};
use crate::schema::CanonicalSchema;
use crate::table::FeatureTable;

#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Transformed(Vec<f64>),
    Skipped { reason: String },
}

impl RecordOutcome {
    pub fn values(&self) -> Option<&[f64]> {
        match self {
            Self::Transformed(values) => Some(values),
            Self::Skipped { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeatureTransformer {
    bundle: ArtifactBundle,
    calibration: Calibration,
    schema: CanonicalSchema,
}

impl FeatureTransformer {
    pub fn load(dir: &Path, calibration: &Calibration) -> Result<Self, FeatureError> {
        let bundle = load_bundle(dir)?;
        Self::from_bundle(bundle, calibration)
    }

    pub fn from_bundle(
        bundle: ArtifactBundle,
        calibration: &Calibration,
    ) -> Result<Self, FeatureError> {
        let schema = CanonicalSchema::standard();
        assert_bundle_compatible(&bundle, &schema, calibration)?;

        info!(
            component = "transformer",
            event = "transformer.ready",
            feature_columns = bundle.feature_columns.len(),
            scaled = bundle.is_scaled()
        );

        Ok(Self {
            bundle,
            calibration: calibration.clone(),
            schema,
        })
    }

    pub fn bundle(&self) -> &ArtifactBundle {
        &self.bundle
    }

    pub fn feature_columns(&self) -> &[String] {
        &self.bundle.feature_columns
    }

    pub fn transform_record(&self, record: &FlatRecord) -> Result<Vec<f64>, FeatureError> {
        let row = project_record(record, &self.bundle.feature_columns)?;
        Ok(self.bundle.transform_row(&self.calibration, row))
    }

    /// Alias mapping over the request's top-level keys, then the usual transform.
    pub fn transform_raw(&self, raw: &RawRecord) -> Result<Vec<f64>, FeatureError> {
        self.transform_record(&normalize_request(raw, &self.schema))
    }

    pub fn transform_batch(&self, records: &[FlatRecord]) -> Vec<RecordOutcome> {
        records
            .iter()
            .enumerate()
            .map(|(index, record)| match self.transform_record(record) {
                Ok(values) => RecordOutcome::Transformed(values),
                Err(err) => {
                    debug!(
                        component = "transformer",
                        event = "transformer.record.skipped",
                        index,
                        error = %err
                    );
                    RecordOutcome::Skipped {
                        reason: err.to_string(),
                    }
                }
            })
            .collect()
    }

    /// Fails on the first record that cannot be transformed.
    pub fn transform_table(&self, table: &FeatureTable) -> Result<FeatureMatrix, FeatureError> {
        let mut matrix = FeatureMatrix::new(self.bundle.feature_columns.clone());
        for record in table.rows() {
            matrix.rows.push(self.transform_record(record)?);
        }
        Ok(matrix)
    }
}
