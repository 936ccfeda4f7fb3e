use crate::utils::{Result, TranslatorError};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// A contiguous `[start, end)` slice of dataset rows, identified by its
/// 0-based position among all batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRange {
    pub index: usize,
    pub start: usize,
    pub end: usize,
}

impl BatchRange {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn rows(&self) -> Range<usize> {
        self.start..self.end
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RowBatcher {
    batch_size: usize,
}

impl RowBatcher {
    pub fn new(batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(TranslatorError::ConfigError(
                "batch size must be a positive integer".to_string(),
            ));
        }
        Ok(Self { batch_size })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn total_batches(&self, total_rows: usize) -> usize {
        total_rows.div_ceil(self.batch_size)
    }

    /// Lazily yields batch descriptors covering `[0, total_rows)` in
    /// ascending order. Clone the iterator to restart it.
    pub fn batches(&self, total_rows: usize) -> BatchRanges {
        BatchRanges {
            batch_size: self.batch_size,
            total_rows,
            next_index: 0,
        }
    }

    /// Descriptor for a single batch, `None` past the end of the dataset.
    pub fn batch_at(&self, index: usize, total_rows: usize) -> Option<BatchRange> {
        let start = index.checked_mul(self.batch_size)?;
        if start >= total_rows {
            return None;
        }
        Some(BatchRange {
            index,
            start,
            end: (start + self.batch_size).min(total_rows),
        })
    }
}

#[derive(Debug, Clone)]
pub struct BatchRanges {
    batch_size: usize,
    total_rows: usize,
    next_index: usize,
}

impl Iterator for BatchRanges {
    type Item = BatchRange;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.next_index * self.batch_size;
        if start >= self.total_rows {
            return None;
        }

        let range = BatchRange {
            index: self.next_index,
            start,
            end: (start + self.batch_size).min(self.total_rows),
        };
        self.next_index += 1;
        Some(range)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self
            .total_rows
            .div_ceil(self.batch_size)
            .saturating_sub(self.next_index);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for BatchRanges {}
