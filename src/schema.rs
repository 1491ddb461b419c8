//! Canonical feature schema and raw-key alias resolution.

use sha2::{Digest, Sha256};
use tracing::debug;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

pub const FEATURE_COLUMNS: [&str; 7] = [
    "pH",
    "TDS_ppm",
    "ORP_mV",
    "Temperature_C",
    "Color_R",
    "Color_G",
    "Color_B",
];

pub const KEY_ALIASES: [(&str, &str); 10] = [
    ("r", "Color_R"),
    ("g", "Color_G"),
    ("b", "Color_B"),
    ("orp", "ORP_mV"),
    ("TDS", "TDS_ppm"),
    ("tds", "TDS_ppm"),
    ("temp", "Temperature_C"),
    ("temperature", "Temperature_C"),
    ("pH", "pH"),
    ("ph", "pH"),
];

/// The fixed ordered feature list plus the many-to-one alias table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanonicalSchema {
    version: u32,
    columns: &'static [&'static str],
    aliases: &'static [(&'static str, &'static str)],
}

impl Default for CanonicalSchema {
    fn default() -> Self {
        Self::standard()
    }
}

impl CanonicalSchema {
    pub const fn standard() -> Self {
        Self {
            version: FEATURE_SCHEMA_VERSION,
            columns: &FEATURE_COLUMNS,
            aliases: &KEY_ALIASES,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn columns(&self) -> &'static [&'static str] {
        self.columns
    }

    pub fn is_feature(&self, key: &str) -> bool {
        self.columns.contains(&key)
    }

    /// Canonical name for `raw` if it is a feature or a known alias, else `raw` unchanged.
    pub fn resolve_key<'a>(&self, raw: &'a str) -> &'a str {
        if self.is_feature(raw) {
            return raw;
        }
        self.aliases
            .iter()
            .find(|(alias, _)| *alias == raw)
            .map(|(_, canonical)| *canonical)
            .unwrap_or(raw)
    }

    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("version:{};", self.version));
        hasher.update("columns:");
        for column in self.columns {
            hasher.update(column.as_bytes());
            hasher.update(":f64;");
        }
        hasher.update("aliases:");
        for (alias, canonical) in self.aliases {
            hasher.update(format!("{alias}={canonical};"));
        }
        let fingerprint = hex::encode(hasher.finalize());

        debug!(
            component = "schema",
            event = "schema.fingerprint.computed",
            version = self.version,
            column_count = self.columns.len(),
            fingerprint = %fingerprint
        );

        fingerprint
    }
}
