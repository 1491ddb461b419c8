//! Sorted label <-> dense class code mapping persisted next to the model.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fs_util::write_atomic;

pub const LABEL_ENCODING_FILE: &str = "label_encoding.json";
pub const LABEL_ENCODING_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("label '{0}' is not part of the encoding")]
    UnknownLabel(String),
    #[error("label encoding is empty")]
    Empty,
    #[error("label encoding is not sorted and unique")]
    NotCanonical,
    #[error("unsupported label encoding format version: expected {expected}, got {actual}")]
    UnsupportedFormatVersion { expected: u32, actual: u32 },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Sorted unique labels mapped to dense codes `0..n`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEncoding {
    labels: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct LabelEncodingFile {
    format_version: u32,
    labels: Vec<String>,
}

impl LabelEncoding {
    pub fn fit<'a>(labels: impl IntoIterator<Item = &'a str>) -> Self {
        let unique: BTreeSet<&str> = labels.into_iter().collect();
        Self {
            labels: unique.into_iter().map(str::to_string).collect(),
        }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn encode(&self, label: &str) -> Result<usize, LabelError> {
        self.labels
            .binary_search_by(|entry| entry.as_str().cmp(label))
            .map_err(|_| LabelError::UnknownLabel(label.to_string()))
    }

    pub fn decode(&self, code: usize) -> Option<&str> {
        self.labels.get(code).map(String::as_str)
    }

    /// Decoded label, or the code's decimal text when out of range.
    pub fn decode_or_raw(&self, code: usize) -> String {
        self.decode(code)
            .map(str::to_string)
            .unwrap_or_else(|| code.to_string())
    }

    pub fn save(&self, path: &Path) -> Result<(), LabelError> {
        let file = LabelEncodingFile {
            format_version: LABEL_ENCODING_FORMAT_VERSION,
            labels: self.labels.clone(),
        };
        write_atomic(path, &serde_json::to_vec_pretty(&file)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, LabelError> {
        let file: LabelEncodingFile = serde_json::from_slice(&fs::read(path)?)?;
        if file.format_version != LABEL_ENCODING_FORMAT_VERSION {
            return Err(LabelError::UnsupportedFormatVersion {
                expected: LABEL_ENCODING_FORMAT_VERSION,
                actual: file.format_version,
            });
        }
        if file.labels.is_empty() {
            return Err(LabelError::Empty);
        }
        if file.labels.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(LabelError::NotCanonical);
        }
        Ok(Self {
            labels: file.labels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn codes_follow_sorted_label_order() {
        let encoding = LabelEncoding::fit(["tulsi", "ashwagandha", "tulsi", "neem"]);
        assert_eq!(encoding.labels(), ["ashwagandha", "neem", "tulsi"]);
        assert_eq!(encoding.encode("neem").unwrap(), 1);
        assert_eq!(encoding.decode(2), Some("tulsi"));
        assert!(matches!(
            encoding.encode("mint").unwrap_err(),
            LabelError::UnknownLabel(_)
        ));
    }

    #[test]
    fn out_of_range_codes_degrade_to_text() {
        let encoding = LabelEncoding::fit(["a", "b"]);
        assert_eq!(encoding.decode(5), None);
        assert_eq!(encoding.decode_or_raw(5), "5");
        assert_eq!(encoding.decode_or_raw(0), "a");
    }

    #[test]
    fn saved_encoding_reloads_and_rejects_unsorted_files() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(LABEL_ENCODING_FILE);
        let encoding = LabelEncoding::fit(["b", "a"]);
        encoding.save(&path).unwrap();
        assert_eq!(LabelEncoding::load(&path).unwrap(), encoding);

        fs::write(&path, r#"{"format_version":1,"labels":["b","a"]}"#).unwrap();
        assert!(matches!(
            LabelEncoding::load(&path).unwrap_err(),
            LabelError::NotCanonical
        ));
    }
}
