use crate::csv_processor::dataset::Row;
use crate::utils::{sanitize_cell, Result, TranslatorError};
use csv::Writer;
use std::fs::File;
use std::io::Write;

pub struct CsvStreamWriter<W: Write = File> {
    headers: Vec<String>,
    writer: Option<Writer<W>>,
    sanitize: bool,
    rows_written: usize,
}

impl CsvStreamWriter<File> {
    pub fn create(path: &str, headers: Vec<String>) -> Result<Self> {
        let file = File::create(path)?;
        Self::from_writer(file, headers)
    }
}

impl<W: Write> CsvStreamWriter<W> {
    pub fn from_writer(inner: W, headers: Vec<String>) -> Result<Self> {
        let mut writer = Writer::from_writer(inner);
        writer.write_record(&headers)?;
        Ok(Self {
            headers,
            writer: Some(writer),
            sanitize: false,
            rows_written: 0,
        })
    }

    pub fn with_sanitize(mut self, sanitize: bool) -> Self {
        self.sanitize = sanitize;
        self
    }

    pub fn write_row(&mut self, row: &[String]) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            TranslatorError::IoError(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "Writer already finished",
            ))
        })?;

        if row.len() != self.headers.len() {
            return Err(TranslatorError::ColumnCountMismatch {
                row: self.rows_written,
                expected: self.headers.len(),
                got: row.len(),
            });
        }

        if self.sanitize {
            let sanitized: Vec<String> = row.iter().map(|s| sanitize_cell(s)).collect();
            writer.write_record(&sanitized)?;
        } else {
            writer.write_record(row)?;
        }
        self.rows_written += 1;
        Ok(())
    }

    pub fn write_rows(&mut self, rows: &[Row]) -> Result<()> {
        for row in rows {
            self.write_row(row)?;
        }
        Ok(())
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    /// Flushes and hands back the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        let writer = self.writer.take().ok_or_else(|| {
            TranslatorError::IoError(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "Writer already finished",
            ))
        })?;
        writer
            .into_inner()
            .map_err(|e| TranslatorError::IoError(e.into_error()))
    }
}

/// Serializes headers and rows into an in-memory CSV document.
pub fn serialize_csv(headers: &[String], rows: &[Row], sanitize: bool) -> Result<String> {
    let mut writer = CsvStreamWriter::from_writer(Vec::new(), headers.to_vec())?.with_sanitize(sanitize);
    writer.write_rows(rows)?;
    let bytes = writer.finish()?;
    String::from_utf8(bytes).map_err(|e| TranslatorError::ValidationError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> Row {
        cells.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_serialize_quotes_as_needed() {
        let csv = serialize_csv(
            &row(&["id", "text"]),
            &[row(&["1", "hello, world"]), row(&["2", "plain"])],
            false,
        )
        .unwrap();
        assert_eq!(csv, "id,text\n1,\"hello, world\"\n2,plain\n");
    }

    #[test]
    fn test_sanitize_is_opt_in() {
        let rows = [row(&["-5", "=1+1"])];
        let headers = row(&["a", "b"]);

        assert_eq!(serialize_csv(&headers, &rows, false).unwrap(), "a,b\n-5,=1+1\n");
        assert_eq!(serialize_csv(&headers, &rows, true).unwrap(), "a,b\n'-5,'=1+1\n");
    }

    #[test]
    fn test_rejects_wrong_width() {
        let mut writer = CsvStreamWriter::from_writer(Vec::new(), row(&["a", "b"])).unwrap();
        assert!(writer.write_row(&row(&["only"])).is_err());
        assert_eq!(writer.rows_written(), 0);
    }

    #[test]
    fn test_create_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let path = path.to_string_lossy().to_string();

        let mut writer = CsvStreamWriter::create(&path, row(&["a"])).unwrap();
        writer.write_rows(&[row(&["x"]), row(&["y"])]).unwrap();
        writer.finish().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nx\ny\n");
    }
}
