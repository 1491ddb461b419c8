//! Fits the imputer/scaler bundle on a feature table and promotes it to disk.

use std::path::PathBuf;

use serde_json::Value;
use tracing::info;

use crate::artifacts::{save_bundle, ArtifactBundle, MedianImputer, StandardScaler};
use crate::calibration::Calibration;
use crate::features::{project_record, select_feature_columns, FeatureError, FeatureMatrix};
use crate::labels::LabelEncoding;
use crate::schema::CanonicalSchema;
use crate::table::FeatureTable;

pub const DEFAULT_LABEL_COLUMN: &str = "Herb_Name";

#[derive(Debug, Clone)]
pub struct FitConfig {
    pub artifact_dir: PathBuf,
    pub label_column: String,
    pub scale: bool,
    pub calibration: Calibration,
    pub schema: CanonicalSchema,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from("artifacts"),
            label_column: DEFAULT_LABEL_COLUMN.to_string(),
            scale: false,
            calibration: Calibration::identity(),
            schema: CanonicalSchema::standard(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FitOutcome {
    pub bundle: ArtifactBundle,
    pub bundle_path: PathBuf,
    pub label_encoding: LabelEncoding,
    /// Label text per table row; `None` where the label cell is missing.
    pub labels: Vec<Option<String>>,
    pub matrix: FeatureMatrix,
}

pub fn fit_artifacts(table: &FeatureTable, config: &FitConfig) -> Result<FitOutcome, FeatureError> {
    if table.is_empty() {
        return Err(FeatureError::EmptyTable);
    }
    if !table.has_column(&config.label_column) {
        return Err(FeatureError::MissingLabelColumn(config.label_column.clone()));
    }
    let feature_columns = select_feature_columns(&config.schema, table.columns());
    if feature_columns.is_empty() {
        return Err(FeatureError::NoFeatureColumns);
    }

    info!(
        component = "fitter",
        event = "artifacts.fit.start",
        rows = table.len(),
        feature_columns = feature_columns.len(),
        scale = config.scale
    );

    let mut calibrated = Vec::with_capacity(table.len());
    for record in table.rows() {
        let mut row = project_record(record, &feature_columns)?;
        config.calibration.apply_row(&feature_columns, &mut row);
        calibrated.push(row);
    }

    let imputer = MedianImputer::fit(&calibrated, feature_columns.len());
    let scaler = config.scale.then(|| {
        let imputed: Vec<Vec<f64>> = calibrated
            .iter()
            .map(|row| imputer.transform_row(row))
            .collect();
        StandardScaler::fit(&imputed, feature_columns.len())
    });

    let bundle = ArtifactBundle {
        schema_version: config.schema.version(),
        schema_fingerprint: config.schema.fingerprint(),
        calibration_fingerprint: config.calibration.fingerprint(),
        feature_columns: feature_columns.clone(),
        imputer,
        scaler,
    };

    // The training matrix goes through the same path as inference.
    let mut matrix = FeatureMatrix::new(feature_columns.clone());
    for record in table.rows() {
        let row = project_record(record, &feature_columns)?;
        matrix.rows.push(bundle.transform_row(&config.calibration, row));
    }

    let labels: Vec<Option<String>> = table
        .rows()
        .iter()
        .map(|record| label_text(record.get(&config.label_column)))
        .collect();
    let label_encoding = LabelEncoding::fit(labels.iter().flatten().map(String::as_str));

    let bundle_path = save_bundle(&config.artifact_dir, &bundle)?;

    info!(
        component = "fitter",
        event = "artifacts.fit.finish",
        rows = matrix.n_rows(),
        feature_columns = matrix.n_cols(),
        labels = label_encoding.len(),
        path = %bundle_path.display()
    );

    Ok(FitOutcome {
        bundle,
        bundle_path,
        label_encoding,
        labels,
        matrix,
    })
}

/// Missing and empty cells have no label; other scalars use their text form.
pub fn label_text(value: Option<&Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) if text.trim().is_empty() => None,
        Some(Value::String(text)) => Some(text.clone()),
        Some(other) => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::FlatRecord;
    use serde_json::json;
    use tempfile::tempdir;

    fn table(rows: Vec<Value>) -> FeatureTable {
        FeatureTable::from_records(
            rows.into_iter()
                .map(|row| match row {
                    Value::Object(map) => map.into_iter().collect::<FlatRecord>(),
                    other => panic!("expected object, got {other}"),
                })
                .collect(),
        )
    }

    fn config(dir: &std::path::Path) -> FitConfig {
        FitConfig {
            artifact_dir: dir.to_path_buf(),
            ..FitConfig::default()
        }
    }

    #[test]
    fn rejects_empty_and_unlabelled_tables() {
        let temp = tempdir().unwrap();
        let cfg = config(temp.path());
        assert!(matches!(
            fit_artifacts(&FeatureTable::default(), &cfg).unwrap_err(),
            FeatureError::EmptyTable
        ));
        assert!(matches!(
            fit_artifacts(&table(vec![json!({"pH": 7.0})]), &cfg).unwrap_err(),
            FeatureError::MissingLabelColumn(_)
        ));
        assert!(matches!(
            fit_artifacts(&table(vec![json!({"Herb_Name": "a", "x": 1})]), &cfg).unwrap_err(),
            FeatureError::NoFeatureColumns
        ));
    }

    #[test]
    fn non_numeric_feature_text_is_fatal() {
        let temp = tempdir().unwrap();
        let err = fit_artifacts(
            &table(vec![json!({"Herb_Name": "a", "pH": "acidic"})]),
            &config(temp.path()),
        )
        .unwrap_err();
        assert!(matches!(err, FeatureError::NonNumeric { .. }));
    }

    #[test]
    fn fit_imputes_with_calibrated_medians() {
        let temp = tempdir().unwrap();
        let cfg = FitConfig {
            calibration: Calibration::identity().with_correction("pH", 2.0, 0.0),
            ..config(temp.path())
        };
        let outcome = fit_artifacts(
            &table(vec![
                json!({"Herb_Name": "tulsi", "pH": 1.0, "TDS_ppm": 100}),
                json!({"Herb_Name": "neem", "pH": 3.0}),
                json!({"Herb_Name": null, "pH": null, "TDS_ppm": 300}),
            ]),
            &cfg,
        )
        .unwrap();

        assert_eq!(outcome.bundle.feature_columns, vec!["pH", "TDS_ppm"]);
        assert_eq!(outcome.bundle.imputer.fill_values(), [4.0, 200.0]);
        assert_eq!(
            outcome.matrix.rows,
            vec![vec![2.0, 100.0], vec![6.0, 200.0], vec![4.0, 300.0]]
        );
        assert_eq!(outcome.label_encoding.labels(), ["neem", "tulsi"]);
        assert_eq!(outcome.labels[2], None);
        assert!(outcome.bundle_path.starts_with(temp.path()));
    }

    #[test]
    fn scaled_fit_centers_the_training_matrix() {
        let temp = tempdir().unwrap();
        let cfg = FitConfig {
            scale: true,
            ..config(temp.path())
        };
        let outcome = fit_artifacts(
            &table(vec![
                json!({"Herb_Name": "a", "pH": 6.0}),
                json!({"Herb_Name": "b", "pH": 8.0}),
            ]),
            &cfg,
        )
        .unwrap();
        assert_eq!(outcome.matrix.rows, vec![vec![-1.0], vec![1.0]]);
    }

    #[test]
    fn numeric_labels_use_their_text_form() {
        assert_eq!(label_text(Some(&json!(3))), Some("3".to_string()));
        assert_eq!(label_text(Some(&json!(" "))), None);
        assert_eq!(label_text(None), None);
    }
}
