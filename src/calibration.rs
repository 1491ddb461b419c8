//! Per-feature arithmetic correction applied before fitting and before every transform.
//!
//! Changing any correction changes the fingerprint, and bundles fitted under a
//! different fingerprint refuse to load.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub gain: f64,
    pub offset: f64,
}

impl Correction {
    pub const IDENTITY: Self = Self {
        gain: 1.0,
        offset: 0.0,
    };

    pub fn apply(self, value: f64) -> f64 {
        value * self.gain + self.offset
    }

    fn is_identity(self) -> bool {
        self.gain.to_bits() == Self::IDENTITY.gain.to_bits()
            && self.offset.to_bits() == Self::IDENTITY.offset.to_bits()
    }
}

impl Default for Correction {
    fn default() -> Self {
        Self::IDENTITY
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Calibration {
    corrections: BTreeMap<String, Correction>,
}

impl Calibration {
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn with_correction(mut self, column: impl Into<String>, gain: f64, offset: f64) -> Self {
        self.corrections
            .insert(column.into(), Correction { gain, offset });
        self
    }

    pub fn correction(&self, column: &str) -> Correction {
        self.corrections.get(column).copied().unwrap_or_default()
    }

    /// Missing values stay missing.
    pub fn apply(&self, column: &str, value: Option<f64>) -> Option<f64> {
        value.map(|v| self.correction(column).apply(v))
    }

    pub fn apply_row(&self, columns: &[String], row: &mut [Option<f64>]) {
        for (column, cell) in columns.iter().zip(row.iter_mut()) {
            *cell = self.apply(column, *cell);
        }
    }

    pub fn is_identity(&self) -> bool {
        self.corrections.values().all(|c| c.is_identity())
    }

    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update("calibration:v1;");
        for (column, correction) in &self.corrections {
            if correction.is_identity() {
                continue;
            }
            hasher.update(format!(
                "{column}:{:016x}:{:016x};",
                correction.gain.to_bits(),
                correction.offset.to_bits()
            ));
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_leaves_values_untouched() {
        let cal = Calibration::identity();
        assert_eq!(cal.apply("pH", Some(7.25)), Some(7.25));
        assert_eq!(cal.apply("pH", None), None);
        assert!(cal.is_identity());
    }

    #[test]
    fn corrections_apply_gain_then_offset() {
        let cal = Calibration::identity().with_correction("ORP_mV", 2.0, -5.0);
        assert_eq!(cal.apply("ORP_mV", Some(10.0)), Some(15.0));
        assert_eq!(cal.apply("pH", Some(10.0)), Some(10.0));

        let columns = vec!["pH".to_string(), "ORP_mV".to_string()];
        let mut row = vec![Some(1.0), None];
        cal.apply_row(&columns, &mut row);
        assert_eq!(row, vec![Some(1.0), None]);
    }

    #[test]
    fn explicit_identity_entries_share_the_identity_fingerprint() {
        let plain = Calibration::identity();
        let explicit = Calibration::identity().with_correction("pH", 1.0, 0.0);
        assert_eq!(plain.fingerprint(), explicit.fingerprint());

        let changed = Calibration::identity().with_correction("pH", 1.0, 0.1);
        assert_ne!(plain.fingerprint(), changed.fingerprint());
    }
}
