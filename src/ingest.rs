//! Paginated, time-windowed ingestion with dedup, downsampling and an item cap.

use std::collections::HashSet;

use chrono::NaiveDate;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Map, Number, Value};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::normalize::{
    has_dedup_identity, normalize_record, FlatRecord, RawRecord, DEVICE_ID_FIELD, TIMESTAMP_FIELD,
};
use crate::scan::{ScanError, ScanFilter, ScanPager, ScanRequest};
use crate::schema::CanonicalSchema;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid date '{value}': expected YYYY-MM-DD or epoch seconds")]
    InvalidDate { value: String },
    #[error("invalid time bounds: start {start} is after end {end}")]
    InvalidBounds { start: i64, end: i64 },
    #[error("sample rate must be within [0, 1], got {0}")]
    InvalidSampleRate(f64),
    #[error("table name must not be empty")]
    MissingTable,
    #[error("scan failed after {pages} page(s): {source}")]
    Transport {
        pages: u64,
        #[source]
        source: ScanError,
    },
}

/// Inclusive UTC epoch-second window; either side may be open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeBounds {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl TimeBounds {
    pub fn new(start: Option<i64>, end: Option<i64>) -> Result<Self, IngestError> {
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(IngestError::InvalidBounds { start, end });
            }
        }
        Ok(Self { start, end })
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Dates expand to the first and last second of their UTC day.
    pub fn from_dates(start: Option<&str>, end: Option<&str>) -> Result<Self, IngestError> {
        let start = start.map(|text| parse_bound(text, DayEdge::Start)).transpose()?;
        let end = end.map(|text| parse_bound(text, DayEdge::End)).transpose()?;
        Self::new(start, end)
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        self.filter().matches(timestamp)
    }

    pub fn filter(&self) -> ScanFilter {
        ScanFilter::from_bounds(self.start, self.end)
    }
}

#[derive(Clone, Copy)]
enum DayEdge {
    Start,
    End,
}

/// `YYYY-MM-DD` and compact `YYYYMMDD` are dates; other integers are epoch seconds.
fn parse_bound(text: &str, edge: DayEdge) -> Result<i64, IngestError> {
    let trimmed = text.trim();
    let invalid = || IngestError::InvalidDate {
        value: text.to_string(),
    };
    let compact_date = trimmed.len() == 8 && trimmed.bytes().all(|b| b.is_ascii_digit());
    let date = if compact_date {
        NaiveDate::parse_from_str(trimmed, "%Y%m%d").map_err(|_| invalid())?
    } else if let Ok(epoch) = trimmed.parse::<i64>() {
        return Ok(epoch);
    } else {
        NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").map_err(|_| invalid())?
    };
    let time = match edge {
        DayEdge::Start => date.and_hms_opt(0, 0, 0),
        DayEdge::End => date.and_hms_opt(23, 59, 59),
    };
    time.map(|dt| dt.and_utc().timestamp()).ok_or_else(invalid)
}

/// Decodes a tagged wire item into a plain record.
pub fn decode_wire_item(item: &Map<String, Value>) -> RawRecord {
    item.iter()
        .map(|(key, value)| (key.clone(), decode_wire_value(value)))
        .collect()
}

/// Tags are tried in order `S`, `N`, `BOOL`, `M`, `L`; anything else is `Null`.
pub fn decode_wire_value(value: &Value) -> Value {
    let Some(tagged) = value.as_object() else {
        debug!(
            component = "ingest",
            event = "ingest.wire.untagged",
            value = %value
        );
        return Value::Null;
    };

    if let Some(text) = tagged.get("S") {
        return match text {
            Value::String(_) => text.clone(),
            other => Value::String(other.to_string()),
        };
    }
    if let Some(number) = tagged.get("N") {
        return decode_wire_number(number);
    }
    if let Some(flag) = tagged.get("BOOL") {
        return match flag {
            Value::Bool(_) => flag.clone(),
            other => {
                debug!(
                    component = "ingest",
                    event = "ingest.wire.bad_bool",
                    value = %other
                );
                Value::Null
            }
        };
    }
    if let Some(map) = tagged.get("M") {
        return match map.as_object() {
            Some(map) => Value::Object(decode_wire_item(map)),
            None => {
                debug!(component = "ingest", event = "ingest.wire.bad_map");
                Value::Null
            }
        };
    }
    if let Some(list) = tagged.get("L") {
        return match list.as_array() {
            Some(items) => Value::Array(items.iter().map(decode_wire_value).collect()),
            None => {
                debug!(component = "ingest", event = "ingest.wire.bad_list");
                Value::Null
            }
        };
    }
    if !tagged.contains_key("NULL") {
        debug!(
            component = "ingest",
            event = "ingest.wire.unknown_tag",
            value = %value
        );
    }
    Value::Null
}

fn decode_wire_number(number: &Value) -> Value {
    let text = match number {
        Value::String(text) => text.as_str(),
        Value::Number(number) => return Value::Number(number.clone()),
        _ => "",
    };
    // Integers first, widening to u64; anything else (fractions, exponents) as f64.
    let decoded = text
        .parse::<i64>()
        .ok()
        .map(Number::from)
        .or_else(|| text.parse::<u64>().ok().map(Number::from))
        .or_else(|| text.parse::<f64>().ok().and_then(Number::from_f64));
    match decoded {
        Some(number) => Value::Number(number),
        None => {
            debug!(
                component = "ingest",
                event = "ingest.wire.bad_number",
                value = %number
            );
            Value::Null
        }
    }
}

/// `(device, timestamp)` rendered as compact JSON, so `"17"` and `17` stay distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey {
    device: String,
    timestamp: String,
}

impl DedupKey {
    pub fn from_record(raw: &RawRecord) -> Option<Self> {
        if !has_dedup_identity(raw) {
            return None;
        }
        Some(Self {
            device: raw.get(DEVICE_ID_FIELD)?.to_string(),
            timestamp: raw.get(TIMESTAMP_FIELD)?.to_string(),
        })
    }

    pub fn from_flat(record: &FlatRecord) -> Option<Self> {
        let device = record.get(DEVICE_ID_FIELD).filter(|v| !v.is_null())?;
        let timestamp = record.get(TIMESTAMP_FIELD).filter(|v| !v.is_null())?;
        Some(Self {
            device: device.to_string(),
            timestamp: timestamp.to_string(),
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    pub table: String,
    pub bounds: TimeBounds,
    /// Maximum number of fetched items; `None` scans everything.
    pub limit: Option<u64>,
    pub sample_rate: f64,
    pub seed: Option<u64>,
    pub page_size: Option<u32>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            table: String::new(),
            bounds: TimeBounds::unbounded(),
            limit: None,
            sample_rate: 1.0,
            seed: None,
            page_size: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Idle,
    FetchingPage,
    DecodingItems,
    Done,
    LimitReached,
    Failed,
}

impl IngestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::LimitReached | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub pages: u64,
    pub fetched: u64,
    pub duplicates: u64,
    pub unprocessable: u64,
    pub sampled_out: u64,
    pub emitted: u64,
    pub state: IngestState,
}

impl IngestReport {
    fn new() -> Self {
        Self {
            pages: 0,
            fetched: 0,
            duplicates: 0,
            unprocessable: 0,
            sampled_out: 0,
            emitted: 0,
            state: IngestState::Idle,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestRun {
    pub records: Vec<FlatRecord>,
    pub report: IngestReport,
}

pub struct IngestionController {
    config: IngestConfig,
    schema: CanonicalSchema,
    rng: StdRng,
    state: IngestState,
}

impl IngestionController {
    pub fn new(config: IngestConfig) -> Result<Self, IngestError> {
        if config.table.trim().is_empty() {
            return Err(IngestError::MissingTable);
        }
        if !(0.0..=1.0).contains(&config.sample_rate) {
            return Err(IngestError::InvalidSampleRate(config.sample_rate));
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            config,
            schema: CanonicalSchema::standard(),
            rng,
            state: IngestState::Idle,
        })
    }

    pub fn state(&self) -> IngestState {
        self.state
    }

    pub fn run(&mut self, pager: &mut dyn ScanPager) -> Result<IngestRun, IngestError> {
        let request = ScanRequest {
            table: self.config.table.clone(),
            filter: self.config.bounds.filter(),
            page_size: self.config.page_size,
        };
        let limit = self.config.limit.filter(|limit| *limit > 0);

        info!(
            component = "ingest",
            event = "ingest.run.start",
            table = %request.table,
            filter = request.filter.expression().unwrap_or("none"),
            start = ?self.config.bounds.start,
            end = ?self.config.bounds.end,
            limit = ?limit,
            sample_rate = self.config.sample_rate
        );

        let mut report = IngestReport::new();
        let mut seen: HashSet<DedupKey> = HashSet::new();
        let mut records = Vec::new();
        let mut start_key = None;

        self.transition(IngestState::FetchingPage);
        while self.state == IngestState::FetchingPage {
            let page = match pager.scan_page(&request, start_key.as_ref()) {
                Ok(page) => page,
                Err(source) => {
                    self.transition(IngestState::Failed);
                    error!(
                        component = "ingest",
                        event = "ingest.run.failed",
                        pages = report.pages,
                        fetched = report.fetched,
                        error = %source
                    );
                    return Err(IngestError::Transport {
                        pages: report.pages,
                        source,
                    });
                }
            };
            report.pages += 1;

            debug!(
                component = "ingest",
                event = "ingest.page.fetched",
                page = report.pages,
                items = page.items.len(),
                has_more = page.last_evaluated_key.is_some()
            );

            self.transition(IngestState::DecodingItems);
            for item in &page.items {
                report.fetched += 1;
                let raw = decode_wire_item(item);
                if let Some(flat) = self.admit(&raw, &mut seen, &mut report) {
                    records.push(flat);
                    report.emitted += 1;
                }
                if limit.is_some_and(|limit| report.fetched >= limit) {
                    break;
                }
            }

            let next_state = if limit.is_some_and(|limit| report.fetched >= limit) {
                IngestState::LimitReached
            } else if page.last_evaluated_key.is_none() {
                IngestState::Done
            } else {
                IngestState::FetchingPage
            };
            start_key = page.last_evaluated_key;
            self.transition(next_state);
        }

        report.state = self.state;
        info!(
            component = "ingest",
            event = "ingest.run.finish",
            state = ?report.state,
            pages = report.pages,
            fetched = report.fetched,
            duplicates = report.duplicates,
            unprocessable = report.unprocessable,
            sampled_out = report.sampled_out,
            emitted = report.emitted
        );

        Ok(IngestRun { records, report })
    }

    fn admit(
        &mut self,
        raw: &RawRecord,
        seen: &mut HashSet<DedupKey>,
        report: &mut IngestReport,
    ) -> Option<FlatRecord> {
        let Some(key) = DedupKey::from_record(raw) else {
            report.unprocessable += 1;
            debug!(component = "ingest", event = "ingest.item.unprocessable");
            return None;
        };
        if !seen.insert(key) {
            report.duplicates += 1;
            return None;
        }
        if self.config.sample_rate < 1.0 && self.rng.random::<f64>() >= self.config.sample_rate {
            report.sampled_out += 1;
            return None;
        }
        Some(normalize_record(raw, &self.schema))
    }

    fn transition(&mut self, next: IngestState) {
        debug!(
            component = "ingest",
            event = "ingest.state",
            from = ?self.state,
            to = ?next
        );
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::{ScanPage, StartKey};
    use serde_json::json;

    struct PagedMock {
        pages: Vec<Vec<Value>>,
        calls: usize,
    }

    impl ScanPager for PagedMock {
        fn scan_page(
            &mut self,
            _request: &ScanRequest,
            start_key: Option<&StartKey>,
        ) -> Result<ScanPage, ScanError> {
            let index = start_key
                .and_then(|key| key.0.get("page"))
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize;
            self.calls += 1;
            let items = self.pages[index]
                .iter()
                .map(|item| item.as_object().unwrap().clone())
                .collect();
            let last_evaluated_key = (index + 1 < self.pages.len()).then(|| {
                let mut key = Map::new();
                key.insert("page".to_string(), json!(index + 1));
                StartKey(key)
            });
            Ok(ScanPage {
                items,
                last_evaluated_key,
            })
        }
    }

    fn item(device: &str, ts: i64) -> Value {
        json!({
            "device_id": {"S": device},
            "timestamp": {"N": ts.to_string()},
            "sensor_readings": {"M": {"ph": {"N": "7.1"}}}
        })
    }

    fn config() -> IngestConfig {
        IngestConfig {
            table: "readings".to_string(),
            seed: Some(7),
            ..IngestConfig::default()
        }
    }

    #[test]
    fn dates_expand_to_whole_utc_days() {
        let bounds = TimeBounds::from_dates(Some("2024-01-01"), Some("2024-01-02")).unwrap();
        assert_eq!(bounds.start, Some(1_704_067_200));
        assert_eq!(bounds.end, Some(1_704_239_999));
        assert!(bounds.contains(1_704_239_999));
        assert!(!bounds.contains(1_704_240_000));

        assert!(matches!(
            TimeBounds::from_dates(Some("01/02/2024"), None).unwrap_err(),
            IngestError::InvalidDate { .. }
        ));
        assert!(matches!(
            TimeBounds::from_dates(Some("2024-01-03"), Some("2024-01-02")).unwrap_err(),
            IngestError::InvalidBounds { .. }
        ));
    }

    #[test]
    fn compact_dates_are_dates_not_epoch_seconds() {
        let bounds = TimeBounds::from_dates(Some("20240101"), Some("20240102")).unwrap();
        assert_eq!(bounds.start, Some(1_704_067_200));
        assert_eq!(bounds.end, Some(1_704_239_999));

        assert!(matches!(
            TimeBounds::from_dates(Some("20241340"), None).unwrap_err(),
            IngestError::InvalidDate { .. }
        ));

        let epoch = TimeBounds::from_dates(Some("1704067200"), Some("1704070800")).unwrap();
        assert_eq!(epoch.start, Some(1_704_067_200));
        assert_eq!(epoch.end, Some(1_704_070_800));
    }

    #[test]
    fn wire_values_decode_to_plain_json() {
        let item = json!({
            "s": {"S": "x"},
            "i": {"N": "42"},
            "f": {"N": "7.25"},
            "b": {"BOOL": true},
            "m": {"M": {"k": {"N": "1"}}},
            "l": {"L": [{"S": "a"}, {"NULL": true}]},
            "n": {"NULL": true},
            "bad": {"N": "abc"},
            "unknown": {"SS": ["a"]}
        });
        let decoded = decode_wire_item(item.as_object().unwrap());
        assert_eq!(
            Value::Object(decoded),
            json!({
                "s": "x", "i": 42, "f": 7.25, "b": true,
                "m": {"k": 1}, "l": ["a", null], "n": null,
                "bad": null, "unknown": null
            })
        );
    }

    #[test]
    fn wide_and_exponent_numbers_keep_their_value() {
        let item = json!({
            "max": {"N": "18446744073709551615"},
            "exp": {"N": "1E+2"},
            "neg": {"N": "-9223372036854775808"},
            "inf": {"N": "1e999"},
            "bad": {"N": "abc"}
        });
        let decoded = decode_wire_item(item.as_object().unwrap());
        assert_eq!(decoded["max"].as_u64(), Some(u64::MAX));
        assert_eq!(decoded["exp"].as_f64(), Some(100.0));
        assert_eq!(decoded["neg"].as_i64(), Some(i64::MIN));
        assert_eq!(decoded["inf"], Value::Null);
        assert_eq!(decoded["bad"], Value::Null);
    }

    #[test]
    fn dedup_keys_keep_types_apart() {
        let text = json!({"device_id": "d", "timestamp": "17"});
        let number = json!({"device_id": "d", "timestamp": 17});
        let a = DedupKey::from_record(text.as_object().unwrap()).unwrap();
        let b = DedupKey::from_record(number.as_object().unwrap()).unwrap();
        assert_ne!(a, b);
        assert!(DedupKey::from_record(json!({"device_id": "d"}).as_object().unwrap()).is_none());
    }

    #[test]
    fn duplicates_and_unidentified_items_are_counted_and_skipped() {
        let mut pager = PagedMock {
            pages: vec![
                vec![item("a", 1), item("a", 1), json!({"device_id": {"S": "a"}})],
                vec![item("a", 2), item("a", 1)],
            ],
            calls: 0,
        };
        let run = IngestionController::new(config())
            .unwrap()
            .run(&mut pager)
            .unwrap();

        assert_eq!(run.report.pages, 2);
        assert_eq!(run.report.fetched, 5);
        assert_eq!(run.report.duplicates, 2);
        assert_eq!(run.report.unprocessable, 1);
        assert_eq!(run.report.emitted, 2);
        assert_eq!(run.report.state, IngestState::Done);
        assert_eq!(run.records[0].get("pH"), Some(&json!(7.1)));
    }

    #[test]
    fn cap_counts_fetched_items_and_stops_paging() {
        let mut pager = PagedMock {
            pages: vec![
                vec![item("a", 1), item("a", 1), item("a", 2)],
                vec![item("a", 3)],
            ],
            calls: 0,
        };
        let mut controller = IngestionController::new(IngestConfig {
            limit: Some(2),
            ..config()
        })
        .unwrap();
        let run = controller.run(&mut pager).unwrap();

        assert_eq!(run.report.fetched, 2);
        assert_eq!(run.report.emitted, 1);
        assert_eq!(run.report.state, IngestState::LimitReached);
        assert_eq!(controller.state(), IngestState::LimitReached);
        assert_eq!(pager.calls, 1);
    }

    #[test]
    fn sampling_is_reproducible_with_a_seed() {
        let pages = vec![(0..200).map(|ts| item("a", ts)).collect::<Vec<_>>()];
        let run_once = || {
            let mut pager = PagedMock {
                pages: pages.clone(),
                calls: 0,
            };
            IngestionController::new(IngestConfig {
                sample_rate: 0.5,
                ..config()
            })
            .unwrap()
            .run(&mut pager)
            .unwrap()
        };

        let a = run_once();
        let b = run_once();
        assert_eq!(a.report, b.report);
        assert_eq!(a.report.emitted + a.report.sampled_out, 200);
        assert!(a.report.sampled_out > 0 && a.report.emitted > 0);
    }

    #[test]
    fn zero_sample_rate_drops_everything_and_invalid_rates_are_rejected() {
        let mut pager = PagedMock {
            pages: vec![vec![item("a", 1), item("b", 1)]],
            calls: 0,
        };
        let run = IngestionController::new(IngestConfig {
            sample_rate: 0.0,
            ..config()
        })
        .unwrap()
        .run(&mut pager)
        .unwrap();
        assert_eq!(run.report.sampled_out, 2);
        assert!(run.records.is_empty());

        assert!(matches!(
            IngestionController::new(IngestConfig {
                sample_rate: 1.5,
                ..config()
            })
            .err(),
            Some(IngestError::InvalidSampleRate(_))
        ));
    }
}
