use crate::csv_processor::dataset::{Dataset, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tiktoken_rs::cl100k_base;

const NUMERIC_SAMPLE_ROWS: usize = 10;
const NUMERIC_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub total_rows: usize,
    pub total_columns: usize,
    pub column_names: Vec<String>,
    pub numeric_columns: Vec<usize>,
    pub estimated_tokens: usize,
    pub sample_data: Vec<Row>,
}

pub fn summarize_dataset(dataset: &Dataset, sample_rows: usize) -> DatasetSummary {
    let numeric_columns = (0..dataset.column_count())
        .filter(|&idx| is_numeric_column(dataset.rows(), idx))
        .collect();

    DatasetSummary {
        total_rows: dataset.row_count(),
        total_columns: dataset.column_count(),
        column_names: dataset.headers().to_vec(),
        numeric_columns,
        estimated_tokens: estimate_dataset_tokens(dataset),
        sample_data: dataset.sample(sample_rows).to_vec(),
    }
}

/// A column counts as numeric when more than 70% of its first ten values
/// parse as numbers once separators and whitespace are stripped.
pub fn is_numeric_column(rows: &[Row], column: usize) -> bool {
    let sample_size = rows.len().min(NUMERIC_SAMPLE_ROWS);
    if sample_size == 0 {
        return false;
    }

    let numeric = rows
        .iter()
        .take(sample_size)
        .filter_map(|row| row.get(column))
        .filter(|value| {
            let cleaned: String = value
                .chars()
                .filter(|c| *c != ',' && !c.is_whitespace())
                .collect();
            !cleaned.is_empty() && cleaned.parse::<f64>().is_ok()
        })
        .count();

    numeric as f64 / sample_size as f64 > NUMERIC_THRESHOLD
}

/// Columns worth translating when the caller did not pick any.
pub fn default_columns(dataset: &Dataset) -> BTreeSet<usize> {
    (0..dataset.column_count())
        .filter(|&idx| !is_numeric_column(dataset.rows(), idx))
        .collect()
}

pub fn estimate_tokens(text: &str) -> usize {
    match cl100k_base() {
        Ok(bpe) => bpe.encode_with_special_tokens(text).len(),
        Err(_) => text.len() / 4,
    }
}

pub fn estimate_rows_tokens(rows: &[Row], headers: &[String]) -> usize {
    let bpe = match cl100k_base() {
        Ok(b) => b,
        Err(_) => {
            let total_chars: usize = rows
                .iter()
                .flat_map(|row| row.iter())
                .map(|s| s.len())
                .sum();
            return total_chars / 4;
        }
    };

    let mut total_tokens = bpe.encode_with_special_tokens(&headers.join(" ")).len();
    for row in rows {
        total_tokens += bpe.encode_with_special_tokens(&row.join(" ")).len();
    }
    total_tokens
}

fn estimate_dataset_tokens(dataset: &Dataset) -> usize {
    estimate_rows_tokens(dataset.rows(), dataset.headers())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> Dataset {
        let rows = vec![
            vec!["1,200".to_string(), "Red apple".to_string(), "3.5".to_string()],
            vec!["1 300".to_string(), "Green pear".to_string(), "n/a".to_string()],
            vec!["1400".to_string(), "Plum".to_string(), "4".to_string()],
        ];
        Dataset::new(
            vec!["price".to_string(), "name".to_string(), "rating".to_string()],
            rows,
        )
        .unwrap()
    }

    #[test]
    fn test_numeric_detection() {
        let dataset = dataset();
        assert!(is_numeric_column(dataset.rows(), 0));
        assert!(!is_numeric_column(dataset.rows(), 1));
        // two of three is below the 70% threshold
        assert!(!is_numeric_column(dataset.rows(), 2));
    }

    #[test]
    fn test_default_columns_skip_numeric() {
        let columns = default_columns(&dataset());
        assert_eq!(columns.into_iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_summary() {
        let summary = summarize_dataset(&dataset(), 2);
        assert_eq!(summary.total_rows, 3);
        assert_eq!(summary.total_columns, 3);
        assert_eq!(summary.sample_data.len(), 2);
        assert_eq!(summary.numeric_columns, vec![0]);
        assert!(summary.estimated_tokens > 0);
    }
}
