use crate::utils::{Result, TranslatorError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub type Row = Vec<String>;

/// Headers plus records, every record exactly `headers.len()` cells wide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    headers: Vec<String>,
    rows: Vec<Row>,
}

impl Dataset {
    pub fn new(headers: Vec<String>, rows: Vec<Row>) -> Result<Self> {
        if headers.is_empty() {
            return Err(TranslatorError::ValidationError(
                "dataset has no header row".to_string(),
            ));
        }

        let mut seen = HashSet::with_capacity(headers.len());
        for header in &headers {
            if !seen.insert(header.as_str()) {
                return Err(TranslatorError::ValidationError(format!(
                    "duplicate header: {}",
                    header
                )));
            }
        }

        for (row, record) in rows.iter().enumerate() {
            if record.len() != headers.len() {
                return Err(TranslatorError::ColumnCountMismatch {
                    row,
                    expected: headers.len(),
                    got: record.len(),
                });
            }
        }

        Ok(Self { headers, rows })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn sample(&self, n: usize) -> &[Row] {
        &self.rows[..n.min(self.rows.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers() -> Vec<String> {
        vec!["id".to_string(), "name".to_string()]
    }

    #[test]
    fn test_rejects_ragged_rows() {
        let err = Dataset::new(
            headers(),
            vec![
                vec!["1".to_string(), "a".to_string()],
                vec!["2".to_string()],
            ],
        )
        .unwrap_err();

        assert!(matches!(
            err,
            TranslatorError::ColumnCountMismatch {
                row: 1,
                expected: 2,
                got: 1
            }
        ));
    }

    #[test]
    fn test_rejects_duplicate_headers() {
        let result = Dataset::new(vec!["a".to_string(), "a".to_string()], vec![]);
        assert!(result.is_err());
    }

    #[test]
    fn test_sample_is_clamped() {
        let dataset = Dataset::new(headers(), vec![vec!["1".to_string(), "a".to_string()]]).unwrap();
        assert_eq!(dataset.sample(15).len(), 1);
        assert_eq!(dataset.column_index("name"), Some(1));
        assert_eq!(dataset.column_index("missing"), None);
    }
}
