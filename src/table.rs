//! Comma-delimited tables of flat records.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde_json::{Number, Value};
use thiserror::Error;
use tracing::info;

use crate::fs_util::write_atomic_with;
use crate::normalize::FlatRecord;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Header plus rows; the header is the sorted union of every row's keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureTable {
    columns: Vec<String>,
    rows: Vec<FlatRecord>,
}

impl FeatureTable {
    pub fn from_records(rows: Vec<FlatRecord>) -> Self {
        let columns = union_header(&rows);
        Self { columns, rows }
    }

    pub fn read_csv(path: &Path) -> Result<Self, TableError> {
        let file = fs::File::open(path)?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_reader(file);

        let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let row = columns
                .iter()
                .zip(record.iter())
                .map(|(column, cell)| (column.clone(), parse_cell(cell)))
                .collect();
            rows.push(row);
        }

        info!(
            component = "table",
            event = "table.csv.read",
            path = %path.display(),
            columns = columns.len(),
            rows = rows.len()
        );

        Ok(Self { columns, rows })
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), TableError> {
        write_csv_atomic(path, &self.columns, &self.rows)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|column| column == name)
    }

    pub fn rows(&self) -> &[FlatRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

pub fn write_records_csv(path: &Path, rows: &[FlatRecord]) -> Result<(), TableError> {
    write_csv_atomic(path, &union_header(rows), rows)
}

fn write_csv_atomic(path: &Path, header: &[String], rows: &[FlatRecord]) -> Result<(), TableError> {
    write_atomic_with(path, |file| {
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(header)?;
        for row in rows {
            writer.write_record(header.iter().map(|column| format_cell(row.get(column))))?;
        }
        writer.flush()?;
        Ok::<(), TableError>(())
    })?;

    info!(
        component = "table",
        event = "table.csv.written",
        path = %path.display(),
        columns = header.len(),
        rows = rows.len()
    );
    Ok(())
}

fn union_header(rows: &[FlatRecord]) -> Vec<String> {
    let keys: BTreeSet<&str> = rows.iter().flat_map(|row| row.keys()).collect();
    keys.into_iter().map(str::to_string).collect()
}

fn format_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(Value::Bool(flag)) => flag.to_string(),
        Some(Value::Number(number)) => number.to_string(),
        Some(nested) => nested.to_string(),
    }
}

fn parse_cell(cell: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    if let Ok(int) = cell.parse::<i64>() {
        return Value::Number(int.into());
    }
    if let Ok(float) = cell.parse::<f64>() {
        if let Some(number) = Number::from_f64(float) {
            return Value::Number(number);
        }
    }
    match cell {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(cell.to_string()),
    }
}
