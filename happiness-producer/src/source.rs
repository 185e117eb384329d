//! Load happiness records from a CSV export of the dataset.
//!
//! Rows are validated with the same rules the consumer applies, so nothing
//! the consumer would reject as incomplete is ever published. Datasets that
//! only carry the `continent` (or `country`) label get their numeric code
//! derived by factorisation: labels are numbered in order of first
//! appearance, starting at 0, and an empty label gets -1.
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::Path;

use serde_json::{Map, Number, Value};
use tracing::{info, warn};

use happiness_common::record::{
    RawRecord, CONTINENT, CONTINENT_NUMERIC, COUNTRY, COUNTRY_NUMERIC,
};

use crate::error::ProducerError;

/// The records of a source file, fully materialized.
#[derive(Debug, Default)]
pub struct CsvSource {
    records: Vec<RawRecord>,
    skipped: usize,
}

impl CsvSource {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ProducerError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|error| ProducerError::OpenSourceError {
            path: path.display().to_string(),
            error,
        })?;

        let source = Self::from_reader(file)?;
        info!(
            path = %path.display(),
            records = source.len(),
            skipped = source.skipped(),
            "loaded source file"
        );
        Ok(source)
    }

    pub fn from_reader<R: io::Read>(reader: R) -> Result<Self, ProducerError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = reader.headers()?.clone();
        let rows = reader.records().collect::<Result<Vec<_>, _>>()?;

        let mut derived = Vec::new();
        for (code, label) in [(CONTINENT_NUMERIC, CONTINENT), (COUNTRY_NUMERIC, COUNTRY)] {
            if column_index(&headers, code).is_some() {
                continue;
            }
            let index = column_index(&headers, label).ok_or(ProducerError::MissingColumn(code))?;
            derived.push((code, factorize(rows.iter().map(|row| row.get(index).unwrap_or("")))));
        }

        let mut source = CsvSource::default();
        for (position, row) in rows.iter().enumerate() {
            let mut fields: Map<String, Value> = headers
                .iter()
                .zip(row.iter())
                .filter_map(|(name, cell)| Some((name.to_owned(), cell_value(name, cell)?)))
                .collect();
            for (code, codes) in &derived {
                fields.insert((*code).to_owned(), Value::from(codes[position]));
            }

            match RawRecord::try_from(fields) {
                Ok(record) => source.records.push(record),
                Err(error) => {
                    let line = row.position().map(|position| position.line());
                    warn!(?line, %error, "skipping invalid source row");
                    source.skipped += 1;
                }
            }
        }

        Ok(source)
    }

    pub fn records(&self) -> &[RawRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Rows dropped because they did not form a valid record.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

fn column_index(headers: &csv::StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|header| header == name)
}

/// Type a CSV cell: labels stay strings, everything else is a number when it
/// parses as one. Empty and non-finite cells count as missing.
fn cell_value(column: &str, cell: &str) -> Option<Value> {
    if cell.is_empty() {
        return None;
    }
    if column == COUNTRY || column == CONTINENT {
        return Some(Value::String(cell.to_owned()));
    }

    if let Ok(integer) = cell.parse::<i64>() {
        return Some(Value::from(integer));
    }
    match cell.parse::<f64>() {
        Ok(float) => Number::from_f64(float).map(Value::Number),
        Err(_) => Some(Value::String(cell.to_owned())),
    }
}

fn factorize<'a>(labels: impl Iterator<Item = &'a str>) -> Vec<i64> {
    let mut codes: HashMap<&'a str, i64> = HashMap::new();

    labels
        .map(|label| {
            if label.is_empty() {
                return -1;
            }
            let next = codes.len() as i64;
            *codes.entry(label).or_insert(next)
        })
        .collect()
}
