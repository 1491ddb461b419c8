//! Paginated scans over the reading store.
//!
//! Items travel in the store's tagged wire format (`{"S": ..}`, `{"N": ..}`,
//! ...). Two pagers ship with the crate: [`HttpScanPager`] speaks the
//! DynamoDB `Scan` JSON protocol against a configurable endpoint (DynamoDB
//! Local or a request-signing proxy), and [`SqliteScanPager`] reads a local
//! snapshot of wire items.

use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::normalize::{RawRecord, TIMESTAMP_FIELD};

pub const SCAN_TARGET: &str = "DynamoDB_20120810.Scan";
const AMZ_JSON_CONTENT_TYPE: &str = "application/x-amz-json-1.0";
const TIMESTAMP_NAME_PLACEHOLDER: &str = "#ts";
const SNAPSHOT_TABLE: &str = "scan_items";
const SNAPSHOT_DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to build HTTP client: {0}")]
    HttpClientBuild(String),
    #[error("scan request to {url} failed: {message}")]
    HttpRequest { url: String, message: String },
    #[error("malformed scan response: {0}")]
    MalformedResponse(String),
    #[error("invalid start key: {0}")]
    InvalidStartKey(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Native filter over the item `timestamp` attribute; bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanFilter {
    #[default]
    None,
    Between { start: i64, end: i64 },
    AtLeast { start: i64 },
    AtMost { end: i64 },
}

impl ScanFilter {
    pub fn from_bounds(start: Option<i64>, end: Option<i64>) -> Self {
        match (start, end) {
            (Some(start), Some(end)) => Self::Between { start, end },
            (Some(start), None) => Self::AtLeast { start },
            (None, Some(end)) => Self::AtMost { end },
            (None, None) => Self::None,
        }
    }

    pub fn expression(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Between { .. } => Some("timestamp BETWEEN :s AND :e"),
            Self::AtLeast { .. } => Some("timestamp >= :s"),
            Self::AtMost { .. } => Some("timestamp <= :e"),
        }
    }

    /// Placeholder bindings in wire form, e.g. `{":s": {"N": "1704067200"}}`.
    pub fn attribute_values(&self) -> Map<String, Value> {
        let mut values = Map::new();
        if let Some(start) = self.start() {
            values.insert(":s".to_string(), json!({"N": start.to_string()}));
        }
        if let Some(end) = self.end() {
            values.insert(":e".to_string(), json!({"N": end.to_string()}));
        }
        values
    }

    pub fn start(&self) -> Option<i64> {
        match self {
            Self::Between { start, .. } | Self::AtLeast { start } => Some(*start),
            _ => None,
        }
    }

    pub fn end(&self) -> Option<i64> {
        match self {
            Self::Between { end, .. } | Self::AtMost { end } => Some(*end),
            _ => None,
        }
    }

    pub fn matches(&self, timestamp: i64) -> bool {
        self.start().map_or(true, |start| timestamp >= start)
            && self.end().map_or(true, |end| timestamp <= end)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    pub table: String,
    pub filter: ScanFilter,
    pub page_size: Option<u32>,
}

/// Opaque continuation token returned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StartKey(pub Map<String, Value>);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanPage {
    /// Items in tagged wire form.
    pub items: Vec<Map<String, Value>>,
    pub last_evaluated_key: Option<StartKey>,
}

pub trait ScanPager {
    fn scan_page(
        &mut self,
        request: &ScanRequest,
        start_key: Option<&StartKey>,
    ) -> Result<ScanPage, ScanError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpScanConfig {
    pub endpoint: String,
    pub region: String,
    pub timeout_ms: u64,
}

impl Default for HttpScanConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000".to_string(),
            region: "us-east-1".to_string(),
            timeout_ms: 30_000,
        }
    }
}

trait JsonPoster {
    fn post(&self, url: &str, target: &str, body: Vec<u8>) -> Result<Vec<u8>, ScanError>;
}

struct ReqwestBlockingPoster {
    client: reqwest::blocking::Client,
}

impl ReqwestBlockingPoster {
    fn new(timeout_ms: u64) -> Result<Self, ScanError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| ScanError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl JsonPoster for ReqwestBlockingPoster {
    fn post(&self, url: &str, target: &str, body: Vec<u8>) -> Result<Vec<u8>, ScanError> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", AMZ_JSON_CONTENT_TYPE)
            .header("X-Amz-Target", target)
            .body(body)
            .send()
            .map_err(|err| ScanError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            return Err(ScanError::HttpRequest {
                url: url.to_string(),
                message: format!("unexpected HTTP status {status}: {detail}"),
            });
        }

        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| ScanError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })
    }
}

#[derive(Deserialize)]
struct ScanResponse {
    #[serde(rename = "Items", default)]
    items: Vec<Map<String, Value>>,
    #[serde(rename = "LastEvaluatedKey", default)]
    last_evaluated_key: Option<Map<String, Value>>,
}

pub struct HttpScanPager {
    config: HttpScanConfig,
    poster: Box<dyn JsonPoster>,
}

impl HttpScanPager {
    pub fn new(config: HttpScanConfig) -> Result<Self, ScanError> {
        let poster = ReqwestBlockingPoster::new(config.timeout_ms)?;
        Ok(Self {
            config,
            poster: Box::new(poster),
        })
    }

    pub fn config(&self) -> &HttpScanConfig {
        &self.config
    }
}

impl ScanPager for HttpScanPager {
    fn scan_page(
        &mut self,
        request: &ScanRequest,
        start_key: Option<&StartKey>,
    ) -> Result<ScanPage, ScanError> {
        let body = serde_json::to_vec(&scan_request_body(request, start_key))?;
        // One request per page; a failure ends the page and the caller's run.
        let payload = self.poster.post(&self.config.endpoint, SCAN_TARGET, body)?;
        let response: ScanResponse = serde_json::from_slice(&payload)
            .map_err(|err| ScanError::MalformedResponse(err.to_string()))?;

        debug!(
            component = "scan",
            event = "scan.http.page",
            endpoint = %self.config.endpoint,
            region = %self.config.region,
            items = response.items.len(),
            has_more = response.last_evaluated_key.is_some()
        );

        Ok(ScanPage {
            items: response.items,
            last_evaluated_key: response.last_evaluated_key.map(StartKey),
        })
    }
}

/// `timestamp` is a reserved word on the wire, so the attribute goes through a name placeholder.
fn scan_request_body(request: &ScanRequest, start_key: Option<&StartKey>) -> Value {
    let mut body = Map::new();
    body.insert("TableName".to_string(), json!(request.table));
    if let Some(expression) = request.filter.expression() {
        body.insert(
            "FilterExpression".to_string(),
            json!(expression.replacen(TIMESTAMP_FIELD, TIMESTAMP_NAME_PLACEHOLDER, 1)),
        );
        let mut names = Map::new();
        names.insert(TIMESTAMP_NAME_PLACEHOLDER.to_string(), json!(TIMESTAMP_FIELD));
        body.insert("ExpressionAttributeNames".to_string(), Value::Object(names));
        body.insert(
            "ExpressionAttributeValues".to_string(),
            Value::Object(request.filter.attribute_values()),
        );
    }
    if let Some(limit) = request.page_size {
        body.insert("Limit".to_string(), json!(limit));
    }
    if let Some(key) = start_key {
        body.insert("ExclusiveStartKey".to_string(), Value::Object(key.0.clone()));
    }
    Value::Object(body)
}

/// Local snapshot of wire items, paged by rowid.
pub struct SqliteScanPager {
    conn: Connection,
}

impl SqliteScanPager {
    pub fn open(path: &Path) -> Result<Self, ScanError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            CREATE TABLE IF NOT EXISTS scan_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER,
                item TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS scan_items_timestamp ON scan_items(timestamp);
            ",
        )?;
        Ok(Self { conn })
    }

    /// Appends plain records, encoding them to wire form.
    pub fn insert_records(&mut self, records: &[RawRecord]) -> Result<usize, ScanError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {SNAPSHOT_TABLE} (timestamp, item) VALUES (?1, ?2)"
            ))?;
            for record in records {
                let timestamp = record.get(TIMESTAMP_FIELD).and_then(Value::as_i64);
                let item = encode_wire_item(record);
                stmt.execute(params![timestamp, serde_json::to_string(&item)?])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    pub fn count(&self) -> Result<u64, ScanError> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {SNAPSHOT_TABLE}"),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

impl ScanPager for SqliteScanPager {
    fn scan_page(
        &mut self,
        request: &ScanRequest,
        start_key: Option<&StartKey>,
    ) -> Result<ScanPage, ScanError> {
        let after_id = match start_key {
            Some(key) => snapshot_key_id(key)?,
            None => 0,
        };
        let limit = request.page_size.unwrap_or(SNAPSHOT_DEFAULT_PAGE_SIZE).max(1);

        let mut stmt = self.conn.prepare(&format!(
            "
            SELECT id, item
            FROM {SNAPSHOT_TABLE}
            WHERE id > ?1
              AND (?2 IS NULL OR timestamp >= ?2)
              AND (?3 IS NULL OR timestamp <= ?3)
            ORDER BY id ASC
            LIMIT ?4
            "
        ))?;
        let mut rows = stmt.query(params![
            after_id,
            request.filter.start(),
            request.filter.end(),
            i64::from(limit)
        ])?;

        let mut items = Vec::new();
        let mut last_id = None;
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let text: String = row.get(1)?;
            match serde_json::from_str::<Value>(&text)? {
                Value::Object(item) => items.push(item),
                _ => {
                    return Err(ScanError::MalformedResponse(format!(
                        "snapshot row {id} is not a wire item"
                    )))
                }
            }
            last_id = Some(id);
        }

        let last_evaluated_key = match last_id {
            Some(id) if items.len() as u32 == limit => {
                let mut key = Map::new();
                key.insert("id".to_string(), json!({"N": id.to_string()}));
                Some(StartKey(key))
            }
            _ => None,
        };

        Ok(ScanPage {
            items,
            last_evaluated_key,
        })
    }
}

fn snapshot_key_id(key: &StartKey) -> Result<i64, ScanError> {
    key.0
        .get("id")
        .and_then(|id| id.get("N"))
        .and_then(Value::as_str)
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| ScanError::InvalidStartKey(Value::Object(key.0.clone()).to_string()))
}

/// Plain record to tagged wire form; the inverse of the ingest decoder.
pub fn encode_wire_item(record: &RawRecord) -> Map<String, Value> {
    record
        .iter()
        .map(|(key, value)| (key.clone(), encode_wire_value(value)))
        .collect()
}

pub fn encode_wire_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({"NULL": true}),
        Value::Bool(flag) => json!({ "BOOL": flag }),
        Value::Number(number) => json!({ "N": number.to_string() }),
        Value::String(text) => json!({ "S": text }),
        Value::Array(items) => json!({ "L": items.iter().map(encode_wire_value).collect::<Vec<_>>() }),
        Value::Object(map) => {
            let encoded: Map<String, Value> = map
                .iter()
                .map(|(key, value)| (key.clone(), encode_wire_value(value)))
                .collect();
            json!({ "M": encoded })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tempfile::tempdir;

    struct MockPoster {
        responses: RefCell<Vec<Result<Vec<u8>, ScanError>>>,
        bodies: Rc<RefCell<Vec<Value>>>,
    }

    impl JsonPoster for MockPoster {
        fn post(&self, _url: &str, target: &str, body: Vec<u8>) -> Result<Vec<u8>, ScanError> {
            assert_eq!(target, SCAN_TARGET);
            self.bodies
                .borrow_mut()
                .push(serde_json::from_slice(&body).unwrap());
            self.responses.borrow_mut().remove(0)
        }
    }

    fn http_pager(
        responses: Vec<Result<Vec<u8>, ScanError>>,
    ) -> (HttpScanPager, Rc<RefCell<Vec<Value>>>) {
        let bodies = Rc::new(RefCell::new(Vec::new()));
        let pager = HttpScanPager {
            config: HttpScanConfig::default(),
            poster: Box::new(MockPoster {
                responses: RefCell::new(responses),
                bodies: Rc::clone(&bodies),
            }),
        };
        (pager, bodies)
    }

    fn request(filter: ScanFilter) -> ScanRequest {
        ScanRequest {
            table: "readings".to_string(),
            filter,
            page_size: Some(2),
        }
    }

    #[test]
    fn filter_translation_covers_every_bound_shape() {
        assert_eq!(
            ScanFilter::from_bounds(Some(1), Some(2)).expression(),
            Some("timestamp BETWEEN :s AND :e")
        );
        assert_eq!(
            ScanFilter::from_bounds(Some(1), None).expression(),
            Some("timestamp >= :s")
        );
        assert_eq!(
            ScanFilter::from_bounds(None, Some(2)).expression(),
            Some("timestamp <= :e")
        );
        assert_eq!(ScanFilter::from_bounds(None, None).expression(), None);

        let values = ScanFilter::from_bounds(Some(10), Some(20)).attribute_values();
        assert_eq!(values.get(":s"), Some(&json!({"N": "10"})));
        assert_eq!(values.get(":e"), Some(&json!({"N": "20"})));
        assert!(ScanFilter::AtMost { end: 5 }.matches(5));
        assert!(!ScanFilter::AtLeast { start: 6 }.matches(5));
    }

    #[test]
    fn http_pager_sends_scan_body_and_forwards_start_key() {
        let page = json!({
            "Items": [{"device_id": {"S": "a"}}],
            "LastEvaluatedKey": {"device_id": {"S": "a"}}
        });
        let (mut pager, bodies) = http_pager(vec![Ok(serde_json::to_vec(&page).unwrap())]);

        let start = StartKey(json!({"device_id": {"S": "z"}}).as_object().unwrap().clone());
        let out = pager
            .scan_page(&request(ScanFilter::Between { start: 1, end: 2 }), Some(&start))
            .unwrap();

        assert_eq!(out.items.len(), 1);
        assert!(out.last_evaluated_key.is_some());

        let body = &bodies.borrow()[0];
        assert_eq!(body["TableName"], "readings");
        assert_eq!(body["FilterExpression"], "#ts BETWEEN :s AND :e");
        assert_eq!(body["ExpressionAttributeNames"]["#ts"], "timestamp");
        assert_eq!(body["ExpressionAttributeValues"][":s"], json!({"N": "1"}));
        assert_eq!(body["Limit"], 2);
        assert_eq!(body["ExclusiveStartKey"], json!({"device_id": {"S": "z"}}));
    }

    #[test]
    fn http_pager_surfaces_a_failed_request_without_retrying() {
        let failure = || {
            Err(ScanError::HttpRequest {
                url: "http://localhost:8000".to_string(),
                message: "connection refused".to_string(),
            })
        };
        let ok_page = serde_json::to_vec(&json!({"Items": []})).unwrap();
        let (mut pager, bodies) = http_pager(vec![failure(), Ok(ok_page)]);
        let err = pager.scan_page(&request(ScanFilter::None), None).unwrap_err();
        assert!(matches!(err, ScanError::HttpRequest { .. }));
        assert_eq!(bodies.borrow().len(), 1);
        assert!(bodies.borrow()[0].get("FilterExpression").is_none());
    }

    #[test]
    fn sqlite_pager_pages_through_filtered_snapshot() {
        let temp = tempdir().unwrap();
        let mut pager = SqliteScanPager::open(&temp.path().join("snapshot.sqlite")).unwrap();
        let records: Vec<RawRecord> = (0..5)
            .map(|i| {
                json!({"device_id": "d", "timestamp": 100 + i, "sensor_readings": {"ph": 7.0}})
                    .as_object()
                    .unwrap()
                    .clone()
            })
            .collect();
        pager.insert_records(&records).unwrap();
        assert_eq!(pager.count().unwrap(), 5);

        let req = request(ScanFilter::Between { start: 101, end: 104 });
        let first = pager.scan_page(&req, None).unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.items[0]["timestamp"], json!({"N": "101"}));
        let second = pager
            .scan_page(&req, first.last_evaluated_key.as_ref())
            .unwrap();
        assert_eq!(second.items.len(), 2);
        let third = pager
            .scan_page(&req, second.last_evaluated_key.as_ref())
            .unwrap();
        assert!(third.items.is_empty());
        assert!(third.last_evaluated_key.is_none());
    }

    #[test]
    fn wire_encoding_tags_every_variant() {
        let encoded = encode_wire_value(&json!({"a": [1, 2.5, "x", true, null]}));
        assert_eq!(
            encoded,
            json!({"M": {"a": {"L": [
                {"N": "1"}, {"N": "2.5"}, {"S": "x"}, {"BOOL": true}, {"NULL": true}
            ]}}})
        );
    }
}
