use crate::state::machine::{AbortReason, RunStatus};
use serde::{Deserialize, Serialize};

/// What observers see of a run: one notice per transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    StatusChanged { from: RunStatus, to: RunStatus },
    BatchStarted { batch: usize, total_batches: usize },
    BatchRetrying { batch: usize, attempt: u32 },
    BatchSucceeded { batch: usize, rows: usize },
    BatchFailed { batch: usize, consecutive_failures: u32 },
    Aborted { reason: AbortReason },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunProgress {
    pub status: RunStatus,
    pub progress: f32,
    pub current_batch: usize,
    pub total_batches: usize,
    pub batches_completed: usize,
    pub failed_batches: Vec<usize>,
    pub retry_attempt: u32,
    pub abort_reason: Option<AbortReason>,
    pub start_time: u64,
    pub estimated_time_remaining: Option<u64>,
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl RunProgress {
    pub fn new() -> Self {
        Self {
            start_time: now_secs(),
            ..Self::default()
        }
    }

    pub fn apply(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::StatusChanged { to, .. } => {
                self.status = *to;
                if *to == RunStatus::Translating {
                    self.start_time = now_secs();
                    self.batches_completed = 0;
                    self.failed_batches.clear();
                    self.abort_reason = None;
                }
            }
            ProgressEvent::BatchStarted {
                batch,
                total_batches,
            } => {
                self.current_batch = *batch;
                self.total_batches = *total_batches;
                self.retry_attempt = 0;
            }
            ProgressEvent::BatchRetrying { attempt, .. } => {
                self.retry_attempt = *attempt;
            }
            ProgressEvent::BatchSucceeded { .. } => self.batch_done(),
            ProgressEvent::BatchFailed { batch, .. } => {
                self.failed_batches.push(*batch);
                self.batch_done();
            }
            ProgressEvent::Aborted { reason } => {
                self.abort_reason = Some(reason.clone());
                self.estimated_time_remaining = None;
            }
        }
    }

    fn batch_done(&mut self) {
        self.batches_completed += 1;
        self.retry_attempt = 0;
        self.progress = if self.total_batches > 0 {
            self.batches_completed as f32 / self.total_batches as f32
        } else {
            0.0
        };

        let elapsed = now_secs().saturating_sub(self.start_time);
        let rate = self.batches_completed as f64 / elapsed.max(1) as f64;
        let remaining = self.total_batches.saturating_sub(self.batches_completed);
        self.estimated_time_remaining = Some((remaining as f64 / rate.max(0.001)) as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folds_batch_events() {
        let mut progress = RunProgress::new();
        progress.apply(&ProgressEvent::StatusChanged {
            from: RunStatus::Configured,
            to: RunStatus::Translating,
        });
        progress.apply(&ProgressEvent::BatchStarted {
            batch: 0,
            total_batches: 4,
        });
        progress.apply(&ProgressEvent::BatchSucceeded { batch: 0, rows: 10 });
        progress.apply(&ProgressEvent::BatchStarted {
            batch: 1,
            total_batches: 4,
        });
        progress.apply(&ProgressEvent::BatchRetrying { batch: 1, attempt: 2 });
        assert_eq!(progress.retry_attempt, 2);
        progress.apply(&ProgressEvent::BatchFailed {
            batch: 1,
            consecutive_failures: 1,
        });

        assert_eq!(progress.status, RunStatus::Translating);
        assert_eq!(progress.batches_completed, 2);
        assert_eq!(progress.failed_batches, vec![1]);
        assert_eq!(progress.retry_attempt, 0);
        assert!((progress.progress - 0.5).abs() < f32::EPSILON);
        assert!(progress.estimated_time_remaining.is_some());
    }

    #[test]
    fn test_abort_clears_estimate() {
        let mut progress = RunProgress::new();
        progress.apply(&ProgressEvent::Aborted {
            reason: AbortReason::Cancelled,
        });
        assert_eq!(progress.abort_reason, Some(AbortReason::Cancelled));
        assert_eq!(progress.estimated_time_remaining, None);
    }

    #[test]
    fn test_serializes_with_type_tag() {
        let json = serde_json::to_value(ProgressEvent::BatchRetrying { batch: 3, attempt: 2 }).unwrap();
        assert_eq!(json["type"], "batch_retrying");
        assert_eq!(json["attempt"], 2);
    }
}
