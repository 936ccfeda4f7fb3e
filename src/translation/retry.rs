//! Bounded retry around a single batch translation.

use crate::csv_processor::Row;
use crate::translation::{BatchRequest, BatchTranslator};
use crate::utils::{OrchestrationConfig, Result, TranslatorError};
use std::time::Duration;
use tracing::{debug, warn};

/// Wait inserted before a retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    None,
    /// `step * attempt` before attempt `attempt`.
    Linear { step: Duration },
}

impl Backoff {
    /// Delay before `attempt` (2-indexed: the first retry is attempt 2).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Linear { step } => step.saturating_mul(attempt),
        }
    }
}

/// Emitted before every attempt after the first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryNotice {
    pub batch_index: usize,
    pub attempt: u32,
    pub delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Translated { rows: Vec<Row>, attempts: u32 },
    Failed { attempts: u32, error: String },
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, BatchOutcome::Translated { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            BatchOutcome::Translated { attempts, .. } | BatchOutcome::Failed { attempts, .. } => {
                *attempts
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchRetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
}

impl Default for BatchRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Linear {
                step: Duration::from_millis(500),
            },
        }
    }
}

impl BatchRetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Result<Self> {
        if max_attempts == 0 {
            return Err(TranslatorError::ConfigError(
                "max_retries must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            max_attempts,
            backoff,
        })
    }

    pub fn from_config(config: &OrchestrationConfig) -> Result<Self> {
        let step = config.retry_backoff();
        let backoff = if step.is_zero() {
            Backoff::None
        } else {
            Backoff::Linear { step }
        };
        Self::new(config.max_retries, backoff)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Calls `translator` until it returns a correctly shaped batch or the
    /// attempt budget runs out. Attempt errors never escape: they end up in
    /// [`BatchOutcome::Failed`].
    pub async fn execute<T, F>(
        &self,
        translator: &T,
        request: &BatchRequest<'_>,
        mut on_retry: F,
    ) -> BatchOutcome
    where
        T: BatchTranslator + ?Sized,
        F: FnMut(RetryNotice),
    {
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                let delay = self.backoff.delay_before(attempt);
                on_retry(RetryNotice {
                    batch_index: request.batch_index,
                    attempt,
                    delay,
                });
                tokio::time::sleep(delay).await;
            }

            let result = translator
                .translate_batch(request)
                .await
                .and_then(|rows| validate_shape(request, rows));

            match result {
                Ok(rows) => {
                    debug!(batch_index = request.batch_index, attempt, "Batch attempt succeeded");
                    return BatchOutcome::Translated {
                        rows,
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    warn!(
                        batch_index = request.batch_index,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Batch attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        BatchOutcome::Failed {
            attempts: self.max_attempts,
            error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempts made".to_string()),
        }
    }
}

/// A reply must have one row per input row, each as wide as the header row.
pub fn validate_shape(request: &BatchRequest<'_>, rows: Vec<Row>) -> Result<Vec<Row>> {
    if rows.len() != request.rows.len() {
        return Err(TranslatorError::RowCountMismatch {
            expected: request.rows.len(),
            got: rows.len(),
        });
    }

    let width = request.headers.len();
    if let Some((offset, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != width) {
        return Err(TranslatorError::ColumnCountMismatch {
            row: offset,
            expected: width,
            got: row.len(),
        });
    }

    Ok(rows)
}
