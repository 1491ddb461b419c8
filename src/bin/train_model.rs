use std::time::Instant;

use herbscan::{
    init_logging, log_app_finish, log_app_start, logging_config_from_env,
    pipeline_config_from_env, train_config_from_env, train_model,
};

const BINARY: &str = "train_model";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let started = Instant::now();
    let logging = logging_config_from_env();
    init_logging(&logging)?;
    log_app_start(BINARY, &logging);

    let pipeline = pipeline_config_from_env()?;
    let config = train_config_from_env(&pipeline)?;
    let report = train_model(&config)?;

    println!(
        "Rows: {} (unlabelled {}), train {} / test {}",
        report.rows, report.unlabelled_rows, report.train_rows, report.test_rows
    );
    println!("Train accuracy: {:.4}", report.train_accuracy);
    match report.test_accuracy {
        Some(accuracy) => println!("Test accuracy: {accuracy:.4}"),
        None => println!("Test accuracy: n/a (no test rows)"),
    }

    println!("Confusion matrix (rows=true, cols=pred):");
    let width = report.labels.iter().map(String::len).max().unwrap_or(1);
    for (label, row) in report.labels.iter().zip(&report.confusion) {
        let cells: Vec<String> = row.iter().map(|count| format!("{count:>5}")).collect();
        println!("  {label:<width$} {}", cells.join(" "));
    }

    println!("Feature columns: {}", report.feature_columns.join(", "));
    println!("Saved: {}", report.bundle_path.display());
    println!("Saved: {}", report.model_path.display());
    println!("Saved: {}", report.label_encoding_path.display());

    log_app_finish(BINARY, started.elapsed().as_millis());
    Ok(())
}
