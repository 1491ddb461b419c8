use std::time::Instant;

use herbscan::{
    collect_job_from_env, ingest_config_from_env, init_logging, log_app_finish, log_app_start,
    logging_config_from_env, pipeline_config_from_env, run_collection, scan_source_from_env,
    CollectSinks, FeatureTransformer, HttpObjectUploader, HttpScanPager, IngestionController,
    LabelEncoding, ObjectUploader, ScanPager, ScanSource, SqliteScanPager,
};

const BINARY: &str = "collect_scans";
const UPLOAD_TIMEOUT_MS: u64 = 60_000;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let started = Instant::now();
    let logging = logging_config_from_env();
    init_logging(&logging)?;
    log_app_start(BINARY, &logging);

    let pipeline = pipeline_config_from_env()?;
    let ingest = ingest_config_from_env()?;
    let job = collect_job_from_env()?;

    let mut pager: Box<dyn ScanPager> = match scan_source_from_env()? {
        ScanSource::Http(cfg) => Box::new(HttpScanPager::new(cfg)?),
        ScanSource::Snapshot(path) => Box::new(SqliteScanPager::open(&path)?),
    };

    let label_encoding = job
        .label_encoding_path
        .as_deref()
        .map(LabelEncoding::load)
        .transpose()?;
    let transformer = job
        .bundle_dir
        .as_deref()
        .map(|dir| FeatureTransformer::load(dir, &pipeline.calibration))
        .transpose()?;
    let uploader = job
        .upload_endpoint
        .as_deref()
        .map(|endpoint| HttpObjectUploader::new(endpoint, UPLOAD_TIMEOUT_MS))
        .transpose()?;

    println!(
        "Collection start | table={} start={:?} end={:?} limit={:?} sample_rate={} out={}",
        ingest.table,
        ingest.bounds.start,
        ingest.bounds.end,
        ingest.limit,
        ingest.sample_rate,
        job.collect.output_dir.display()
    );

    let mut controller = IngestionController::new(ingest)?;
    let sinks = CollectSinks {
        label_encoding: label_encoding.as_ref(),
        transformer: transformer.as_ref(),
        uploader: uploader.as_ref().map(|u| u as &dyn ObjectUploader),
    };
    let report = run_collection(&mut controller, pager.as_mut(), &job.collect, sinks)?;

    println!(
        "Done. Raw rows: {}. Train-ready rows: {}. Outputs written to {}",
        report.raw_rows,
        report.train_rows,
        job.collect.output_dir.display()
    );
    println!(
        "Scan: pages={} fetched={} duplicates={} unprocessable={} sampled_out={} state={:?}",
        report.ingest.pages,
        report.ingest.fetched,
        report.ingest.duplicates,
        report.ingest.unprocessable,
        report.ingest.sampled_out,
        report.ingest.state
    );
    for key in &report.uploaded_keys {
        println!("Uploaded: {key}");
    }

    log_app_finish(BINARY, started.elapsed().as_millis());
    Ok(())
}
