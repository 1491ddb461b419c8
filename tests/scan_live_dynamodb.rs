#![cfg(feature = "live-scan-tests")]

//! Runs against a live reading store, e.g. DynamoDB Local:
//! `HERBSCAN_SCAN_ENDPOINT=http://localhost:8000 HERBSCAN_TABLE=herb_readings \
//!  cargo test --features live-scan-tests --test scan_live_dynamodb`

use std::collections::HashSet;

use herbscan::{
    http_scan_config_from_env, DedupKey, HttpScanPager, IngestConfig, IngestState,
    IngestionController, ScanPager, ScanRequest, TimeBounds, TIMESTAMP_FIELD,
};
use serde_json::Value;

fn table() -> String {
    std::env::var("HERBSCAN_TABLE").unwrap_or_else(|_| "herb_readings".to_string())
}

#[test]
fn live_first_page_decodes() {
    let config = http_scan_config_from_env().expect("scan config");
    let mut pager = HttpScanPager::new(config).expect("client builds");
    let request = ScanRequest {
        table: table(),
        filter: TimeBounds::unbounded().filter(),
        page_size: Some(10),
    };

    let page = pager.scan_page(&request, None).expect("first page");
    assert!(page.items.len() <= 10);
    for item in &page.items {
        assert!(item.values().all(Value::is_object), "items are tagged");
    }
}

#[test]
fn live_capped_scan_respects_window_and_identity() {
    let config = http_scan_config_from_env().expect("scan config");
    let mut pager = HttpScanPager::new(config).expect("client builds");
    let bounds = TimeBounds::from_dates(Some("2024-01-01"), None).expect("bounds");

    let mut controller = IngestionController::new(IngestConfig {
        table: table(),
        bounds,
        limit: Some(50),
        page_size: Some(20),
        ..IngestConfig::default()
    })
    .expect("controller");
    let run = controller.run(&mut pager).expect("live scan");

    assert!(matches!(
        run.report.state,
        IngestState::Done | IngestState::LimitReached
    ));
    assert!(run.report.fetched <= 50);

    let mut seen = HashSet::new();
    for record in &run.records {
        if let Some(ts) = record.get(TIMESTAMP_FIELD).and_then(Value::as_i64) {
            assert!(bounds.contains(ts));
        }
        assert!(seen.insert(DedupKey::from_flat(record).expect("identity")));
    }
}
