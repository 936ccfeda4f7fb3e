use crate::csv_processor::dataset::{Dataset, Row};
use crate::utils::{Result, TranslatorError};
use csv::StringRecord;
use std::io::Read;
use std::path::Path;

pub struct CsvStreamReader {
    path: String,
}

impl CsvStreamReader {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn read_dataset(&self) -> Result<Dataset> {
        if !file_exists(&self.path) {
            return Err(TranslatorError::FileNotFound(self.path.clone()));
        }
        let file = std::fs::File::open(&self.path)?;
        read_dataset_from(file)
    }
}

/// Parses CSV text whose first record is the header row. Blank rows are
/// dropped, short rows are padded with empty cells and over-long rows are
/// rejected.
pub fn read_dataset_from<R: Read>(input: R) -> Result<Dataset> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(input);

    let headers: Vec<String> = reader.headers()?.iter().map(|s| s.trim().to_string()).collect();
    if headers.iter().all(|h| h.is_empty()) {
        return Err(TranslatorError::ValidationError(
            "CSV file is empty".to_string(),
        ));
    }

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result?;
        if is_blank(&record) {
            continue;
        }
        if record.len() > headers.len() {
            return Err(TranslatorError::ColumnCountMismatch {
                row: rows.len(),
                expected: headers.len(),
                got: record.len(),
            });
        }
        let mut row: Row = string_record_to_vec(&record);
        row.resize(headers.len(), String::new());
        rows.push(row);
    }

    if rows.is_empty() {
        return Err(TranslatorError::EmptyDataset);
    }

    Dataset::new(headers, rows)
}

fn is_blank(record: &StringRecord) -> bool {
    record.iter().all(|cell| cell.trim().is_empty())
}

pub fn string_record_to_vec(record: &StringRecord) -> Vec<String> {
    record.iter().map(|s| s.to_string()).collect()
}

pub async fn get_file_size(path: &str) -> Result<u64> {
    let metadata = tokio::fs::metadata(path).await?;
    Ok(metadata.len())
}

pub fn file_exists(path: &str) -> bool {
    Path::new(path).exists()
}
