use std::io::{self, BufReader};
use std::path::PathBuf;

use herbscan::{
    init_logging, log_app_start, logging_config_from_env, pipeline_config_from_env,
    run_message_loop, LineSource, Predictor,
};

const BINARY: &str = "predict";

enum Mode {
    Json(PathBuf),
    Csv(PathBuf),
    Live,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging = logging_config_from_env();
    init_logging(&logging)?;
    log_app_start(BINARY, &logging);

    let mode = mode_from_env()?;
    let pipeline = pipeline_config_from_env()?;
    let predictor = Predictor::load(
        &pipeline.model_dir,
        &pipeline.artifact_dir,
        &pipeline.calibration,
    )?;

    match mode {
        Mode::Json(path) => {
            let payload = std::fs::read_to_string(&path)?;
            let reply = predictor.predict_json(&payload)?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        Mode::Csv(path) => {
            let replies = predictor.predict_csv(&path)?;
            println!("{}", serde_json::to_string_pretty(&replies)?);
        }
        Mode::Live => {
            let stdin = io::stdin();
            let mut source = LineSource::new(BufReader::new(stdin.lock()));
            let report = run_message_loop(
                &predictor,
                &mut source,
                &mut io::stdout(),
                &mut io::stderr(),
            )?;
            eprintln!(
                "Live loop closed. processed={} failed={}",
                report.processed, report.failed
            );
        }
    }

    Ok(())
}

fn mode_from_env() -> Result<Mode, Box<dyn std::error::Error>> {
    let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
    if let Some(path) = var("HERBSCAN_PREDICT_JSON") {
        return Ok(Mode::Json(PathBuf::from(path)));
    }
    if let Some(path) = var("HERBSCAN_PREDICT_CSV") {
        return Ok(Mode::Csv(PathBuf::from(path)));
    }
    if var("HERBSCAN_PREDICT_LIVE").is_some() {
        return Ok(Mode::Live);
    }
    Err("set HERBSCAN_PREDICT_JSON, HERBSCAN_PREDICT_CSV or HERBSCAN_PREDICT_LIVE".into())
}
