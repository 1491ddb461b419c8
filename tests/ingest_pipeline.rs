use std::collections::HashSet;

use herbscan::{
    encode_wire_item, DedupKey, IngestConfig, IngestError, IngestState, IngestionController,
    RawRecord, ScanError, ScanPage, ScanPager, ScanRequest, SqliteScanPager, StartKey, TimeBounds,
    TIMESTAMP_FIELD,
};
use serde_json::{json, Map, Value};
use tempfile::tempdir;

const DAY: i64 = 86_400;
const JAN_1_2024: i64 = 1_704_067_200;

/// In-memory table that applies the scan filter and pages by offset.
struct MemoryTable {
    items: Vec<RawRecord>,
    fail_after_pages: Option<usize>,
    calls: usize,
}

impl MemoryTable {
    fn new(items: Vec<RawRecord>) -> Self {
        Self {
            items,
            fail_after_pages: None,
            calls: 0,
        }
    }
}

impl ScanPager for MemoryTable {
    fn scan_page(
        &mut self,
        request: &ScanRequest,
        start_key: Option<&StartKey>,
    ) -> Result<ScanPage, ScanError> {
        if self.fail_after_pages.is_some_and(|pages| self.calls >= pages) {
            return Err(ScanError::HttpRequest {
                url: "memory://table".to_string(),
                message: "connection reset".to_string(),
            });
        }
        self.calls += 1;

        let offset = start_key
            .and_then(|key| key.0.get("offset"))
            .and_then(|offset| offset.get("N"))
            .and_then(Value::as_str)
            .and_then(|text| text.parse::<usize>().ok())
            .unwrap_or(0);
        let page_size = request.page_size.unwrap_or(25) as usize;

        let matching: Vec<&RawRecord> = self
            .items
            .iter()
            .filter(|item| match item.get(TIMESTAMP_FIELD).and_then(Value::as_i64) {
                Some(ts) => request.filter.matches(ts),
                None => request.filter.expression().is_none(),
            })
            .collect();

        let end = (offset + page_size).min(matching.len());
        let items = matching[offset..end]
            .iter()
            .map(|item| encode_wire_item(item))
            .collect();
        let last_evaluated_key = (end < matching.len()).then(|| {
            let mut key = Map::new();
            key.insert("offset".to_string(), json!({"N": end.to_string()}));
            StartKey(key)
        });

        Ok(ScanPage {
            items,
            last_evaluated_key,
        })
    }
}

fn reading(device: &str, timestamp: i64, ph: f64) -> RawRecord {
    let value = json!({
        "device_id": device,
        "timestamp": timestamp,
        "sensor_readings": { "ph": ph, "tds": 400, "r": 120 },
        "prediction": 1,
        "source": "pi"
    });
    match value {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

/// Three days of readings every 15 minutes from two devices, with every
/// tenth reading re-delivered.
fn three_day_store() -> Vec<RawRecord> {
    let mut items = Vec::new();
    let mut step = 0;
    let mut ts = JAN_1_2024 - DAY;
    while ts < JAN_1_2024 + 2 * DAY {
        for device in ["pi-1", "pi-2"] {
            let record = reading(device, ts, 6.0 + (step % 10) as f64 * 0.1);
            if step % 10 == 0 {
                items.push(record.clone());
            }
            items.push(record);
            step += 1;
        }
        ts += 15 * 60;
    }
    items
}

fn config(bounds: TimeBounds, limit: Option<u64>) -> IngestConfig {
    IngestConfig {
        table: "herb_readings".to_string(),
        bounds,
        limit,
        seed: Some(7),
        page_size: Some(16),
        ..IngestConfig::default()
    }
}

fn keys(records: &[herbscan::FlatRecord]) -> Vec<DedupKey> {
    records
        .iter()
        .map(|record| DedupKey::from_flat(record).expect("emitted records carry identity"))
        .collect()
}

#[test]
fn capped_window_scan_stays_in_bounds_and_unique() {
    let bounds = TimeBounds::from_dates(Some("2024-01-01"), Some("2024-01-02")).expect("bounds");
    assert_eq!(bounds.start, Some(JAN_1_2024));
    assert_eq!(bounds.end, Some(JAN_1_2024 + 2 * DAY - 1));

    let mut controller = IngestionController::new(config(bounds, Some(50))).expect("controller");
    let mut table = MemoryTable::new(three_day_store());
    let run = controller.run(&mut table).expect("scan succeeds");

    assert!(run.records.len() <= 50);
    assert_eq!(run.report.fetched, 50);
    assert_eq!(run.report.state, IngestState::LimitReached);
    assert_eq!(
        run.report.emitted + run.report.duplicates + run.report.unprocessable + run.report.sampled_out,
        run.report.fetched
    );

    for record in &run.records {
        let ts = record
            .get(TIMESTAMP_FIELD)
            .and_then(Value::as_i64)
            .expect("timestamp");
        assert!(bounds.contains(ts), "timestamp {ts} outside window");
    }
    let unique: HashSet<DedupKey> = keys(&run.records).into_iter().collect();
    assert_eq!(unique.len(), run.records.len());
}

#[test]
fn full_scan_drops_redelivered_readings() {
    let store = three_day_store();
    let distinct: HashSet<(String, String)> = store
        .iter()
        .map(|item| (item["device_id"].to_string(), item["timestamp"].to_string()))
        .collect();

    let mut controller =
        IngestionController::new(config(TimeBounds::unbounded(), None)).expect("controller");
    let run = controller.run(&mut MemoryTable::new(store.clone())).expect("scan");

    assert_eq!(run.report.state, IngestState::Done);
    assert_eq!(run.report.fetched as usize, store.len());
    assert_eq!(run.records.len(), distinct.len());
    assert_eq!(run.report.duplicates as usize, store.len() - distinct.len());
}

#[test]
fn rescanning_the_same_table_is_idempotent() {
    let store = three_day_store();
    let bounds = TimeBounds::from_dates(Some("2024-01-01"), Some("2024-01-01")).expect("bounds");

    let first = IngestionController::new(config(bounds, None))
        .expect("controller")
        .run(&mut MemoryTable::new(store.clone()))
        .expect("first scan");
    let second = IngestionController::new(config(bounds, None))
        .expect("controller")
        .run(&mut MemoryTable::new(store))
        .expect("second scan");

    assert_eq!(first.records, second.records);
    assert_eq!(first.report, second.report);
}

#[test]
fn seeded_sampling_is_reproducible() {
    let run_with = |seed| {
        let cfg = IngestConfig {
            sample_rate: 0.3,
            seed: Some(seed),
            ..config(TimeBounds::unbounded(), None)
        };
        IngestionController::new(cfg)
            .expect("controller")
            .run(&mut MemoryTable::new(three_day_store()))
            .expect("scan")
    };

    let a = run_with(11);
    let b = run_with(11);
    assert_eq!(keys(&a.records), keys(&b.records));
    assert!(a.report.sampled_out > 0);
    assert!(a.report.emitted > 0);
}

#[test]
fn zero_sample_rate_emits_nothing_but_still_scans() {
    let cfg = IngestConfig {
        sample_rate: 0.0,
        ..config(TimeBounds::unbounded(), None)
    };
    let run = IngestionController::new(cfg)
        .expect("controller")
        .run(&mut MemoryTable::new(three_day_store()))
        .expect("scan");
    assert!(run.records.is_empty());
    assert_eq!(run.report.state, IngestState::Done);
    assert_eq!(
        run.report.sampled_out + run.report.duplicates,
        run.report.fetched
    );
}

#[test]
fn items_without_identity_are_counted_not_emitted() {
    let mut store = vec![reading("pi-1", JAN_1_2024, 6.2)];
    let mut orphan = reading("pi-1", JAN_1_2024 + 60, 6.3);
    orphan.remove(TIMESTAMP_FIELD);
    store.push(orphan);
    let mut null_device = reading("pi-2", JAN_1_2024 + 120, 6.4);
    null_device.insert("device_id".to_string(), Value::Null);
    store.push(null_device);

    let run = IngestionController::new(config(TimeBounds::unbounded(), None))
        .expect("controller")
        .run(&mut MemoryTable::new(store))
        .expect("scan");
    assert_eq!(run.records.len(), 1);
    assert_eq!(run.report.unprocessable, 2);
}

#[test]
fn transport_failure_surfaces_after_partial_progress() {
    let mut table = MemoryTable::new(three_day_store());
    table.fail_after_pages = Some(2);
    let mut controller =
        IngestionController::new(config(TimeBounds::unbounded(), None)).expect("controller");

    let err = controller.run(&mut table).expect_err("third page fails");
    match err {
        IngestError::Transport { pages, source } => {
            assert_eq!(pages, 2);
            assert!(matches!(source, ScanError::HttpRequest { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(controller.state(), IngestState::Failed);
}

#[test]
fn invalid_configuration_is_rejected_up_front() {
    assert!(matches!(
        TimeBounds::from_dates(Some("2024-01-03"), Some("2024-01-01")),
        Err(IngestError::InvalidBounds { .. })
    ));
    assert!(matches!(
        TimeBounds::from_dates(Some("01/02/2024"), None),
        Err(IngestError::InvalidDate { .. })
    ));
    assert!(matches!(
        IngestionController::new(IngestConfig {
            sample_rate: 1.5,
            ..config(TimeBounds::unbounded(), None)
        }),
        Err(IngestError::InvalidSampleRate(_))
    ));
    assert!(matches!(
        IngestionController::new(IngestConfig::default()),
        Err(IngestError::MissingTable)
    ));
}

#[test]
fn sqlite_snapshot_pages_through_the_window() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("snapshot").join("scans.sqlite");
    let mut pager = SqliteScanPager::open(&path).expect("open snapshot");
    let store = three_day_store();
    assert_eq!(pager.insert_records(&store).expect("insert"), store.len());
    assert_eq!(pager.count().expect("count"), store.len() as u64);

    let bounds = TimeBounds::from_dates(Some("2024-01-02"), Some("2024-01-02")).expect("bounds");
    let in_window = store
        .iter()
        .filter(|item| bounds.contains(item["timestamp"].as_i64().expect("ts")))
        .count() as u64;

    let run = IngestionController::new(config(bounds, None))
        .expect("controller")
        .run(&mut pager)
        .expect("scan");

    assert_eq!(run.report.state, IngestState::Done);
    assert_eq!(run.report.fetched, in_window);
    assert!(run.report.pages > 1);
    assert_eq!(run.report.emitted + run.report.duplicates, in_window);

    let first = &run.records[0];
    assert_eq!(first.get("device_id"), Some(&json!("pi-1")));
    assert_eq!(first.get(TIMESTAMP_FIELD), Some(&json!(JAN_1_2024 + DAY)));
    assert!(first.get("pH").and_then(Value::as_f64).is_some());
    assert_eq!(first.get("TDS_ppm"), Some(&json!(400)));
    assert_eq!(first.get("source"), Some(&json!("pi")));
    assert!(first.get("raw_json").and_then(Value::as_str).is_some());
}
