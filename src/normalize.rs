//! Raw record flattening into canonical and passthrough fields.

use std::collections::btree_map::{self, Entry};
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::schema::CanonicalSchema;

pub const DEVICE_ID_FIELD: &str = "device_id";
pub const TIMESTAMP_FIELD: &str = "timestamp";
pub const SENSOR_READINGS_FIELD: &str = "sensor_readings";
pub const RAW_JSON_FIELD: &str = "raw_json";

/// Metadata copied verbatim from the source record, `Null` when absent.
pub const METADATA_FIELDS: [&str; 5] = [
    "prediction",
    "confidence",
    "adulteration_alert",
    "model_version",
    "source",
];

/// One ingested or to-be-predicted sample with no guaranteed shape.
pub type RawRecord = Map<String, Value>;

/// Single-level record keyed by canonical, metadata, and passthrough names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlatRecord {
    fields: BTreeMap<String, Value>,
}

impl FlatRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Replaces any previous value under `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FromIterator<(String, Value)> for FlatRecord {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a FlatRecord {
    type Item = (&'a String, &'a Value);
    type IntoIter = btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

pub fn normalize_record(raw: &RawRecord, schema: &CanonicalSchema) -> FlatRecord {
    let mut out = FlatRecord::new();
    out.insert(DEVICE_ID_FIELD, field_or_null(raw, DEVICE_ID_FIELD));
    out.insert(TIMESTAMP_FIELD, field_or_null(raw, TIMESTAMP_FIELD));

    let readings = sensor_readings(raw);
    merge_resolved(&mut out, &readings, schema);

    // Metadata is authoritative over same-named reading keys.
    out.insert(DEVICE_ID_FIELD, field_or_null(raw, DEVICE_ID_FIELD));
    out.insert(TIMESTAMP_FIELD, field_or_null(raw, TIMESTAMP_FIELD));
    for field in METADATA_FIELDS {
        out.insert(field, field_or_null(raw, field));
    }
    out.insert(RAW_JSON_FIELD, Value::String(Value::Object(raw.clone()).to_string()));

    out
}

/// Both `device_id` and `timestamp` are present and non-null.
pub fn has_dedup_identity(raw: &RawRecord) -> bool {
    [DEVICE_ID_FIELD, TIMESTAMP_FIELD]
        .iter()
        .all(|field| !matches!(raw.get(*field), None | Some(Value::Null)))
}

/// Alias mapping for a flat prediction request.
pub fn normalize_request(raw: &RawRecord, schema: &CanonicalSchema) -> FlatRecord {
    let mut out = FlatRecord::new();
    merge_resolved(&mut out, raw, schema);
    out
}

fn merge_resolved(out: &mut FlatRecord, source: &Map<String, Value>, schema: &CanonicalSchema) {
    for (key, value) in source {
        let resolved = schema.resolve_key(key);
        let exact = resolved == key.as_str();
        match out.fields.entry(resolved.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(value.clone());
            }
            // The exact canonical spelling beats any alias seen earlier.
            Entry::Occupied(mut slot) if exact => {
                slot.insert(value.clone());
            }
            Entry::Occupied(_) => {
                debug!(
                    component = "normalize",
                    event = "normalize.alias.collision",
                    key = %key,
                    resolved = %resolved
                );
            }
        }
    }
}

fn sensor_readings(raw: &RawRecord) -> Map<String, Value> {
    match raw.get(SENSOR_READINGS_FIELD) {
        Some(Value::Object(readings)) => readings.clone(),
        Some(Value::String(text)) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(readings)) => readings,
            Ok(_) => {
                debug!(
                    component = "normalize",
                    event = "normalize.readings.not_a_mapping"
                );
                Map::new()
            }
            Err(err) => {
                debug!(
                    component = "normalize",
                    event = "normalize.readings.decode_failed",
                    error = %err
                );
                Map::new()
            }
        },
        Some(Value::Null) | None => Map::new(),
        Some(_) => {
            debug!(
                component = "normalize",
                event = "normalize.readings.not_a_mapping"
            );
            Map::new()
        }
    }
}

fn field_or_null(raw: &RawRecord, field: &str) -> Value {
    raw.get(field).cloned().unwrap_or(Value::Null)
}
