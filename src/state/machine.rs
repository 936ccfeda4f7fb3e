//! Run state machine.
//!
//! A run moves `idle -> uploaded -> configured -> [analyzing] -> translating
//! -> completed | aborted`. Every change goes through [`RunStateMachine::dispatch`],
//! which checks the event against the current state and then folds it into
//! a fresh [`RunState`] value. Terminal states only leave through `Reset`.

use crate::csv_processor::{BatchRange, Dataset, Row, RowBatcher};
use crate::state::progress::ProgressEvent;
use crate::translation::{AnalysisContext, JobConfig};
use crate::utils::{OrchestrationConfig, Result, TranslatorError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Uploaded,
    Configured,
    Analyzing,
    Translating,
    Completed,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Aborted)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Idle => write!(f, "idle"),
            RunStatus::Uploaded => write!(f, "uploaded"),
            RunStatus::Configured => write!(f, "configured"),
            RunStatus::Analyzing => write!(f, "analyzing"),
            RunStatus::Translating => write!(f, "translating"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    Cancelled,
    TooManyFailures { consecutive: u32 },
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::Cancelled => write!(f, "cancelled by user"),
            AbortReason::TooManyFailures { consecutive } => {
                write!(f, "{} consecutive batch failures", consecutive)
            }
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone)]
pub enum RunEvent {
    Upload(Dataset),
    Configure(JobConfig),
    StartAnalysis,
    AnalysisComplete(AnalysisContext),
    AnalysisFailed,
    StartTranslation,
    StartBatch { batch: usize },
    BatchRetry { batch: usize, attempt: u32 },
    BatchSucceeded { batch: usize, rows: Vec<Row> },
    /// The machine falls back to the batch's original rows itself.
    BatchFailed { batch: usize },
    Cancel,
    Reset,
}

impl RunEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::Upload(_) => "upload",
            RunEvent::Configure(_) => "configure",
            RunEvent::StartAnalysis => "start_analysis",
            RunEvent::AnalysisComplete(_) => "analysis_complete",
            RunEvent::AnalysisFailed => "analysis_failed",
            RunEvent::StartTranslation => "start_translation",
            RunEvent::StartBatch { .. } => "start_batch",
            RunEvent::BatchRetry { .. } => "batch_retry",
            RunEvent::BatchSucceeded { .. } => "batch_succeeded",
            RunEvent::BatchFailed { .. } => "batch_failed",
            RunEvent::Cancel => "cancel",
            RunEvent::Reset => "reset",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunLimits {
    batcher: RowBatcher,
    max_consecutive_failures: u32,
}

impl RunLimits {
    pub fn new(batch_size: usize, max_consecutive_failures: u32) -> Result<Self> {
        if max_consecutive_failures == 0 {
            return Err(TranslatorError::ConfigError(
                "max_consecutive_failures must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            batcher: RowBatcher::new(batch_size)?,
            max_consecutive_failures,
        })
    }

    pub fn from_config(config: &OrchestrationConfig) -> Result<Self> {
        Self::new(config.batch_size, config.max_consecutive_failures)
    }

    pub fn batcher(&self) -> RowBatcher {
        self.batcher
    }

    pub fn max_consecutive_failures(&self) -> u32 {
        self.max_consecutive_failures
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunState {
    status: RunStatus,
    dataset: Option<Arc<Dataset>>,
    job: Option<JobConfig>,
    context: Option<AnalysisContext>,
    total_batches: usize,
    current_batch: usize,
    batch_in_flight: bool,
    output: Vec<Row>,
    failed_batches: BTreeSet<usize>,
    consecutive_failures: u32,
    retry_attempt: u32,
    abort_reason: Option<AbortReason>,
}

impl RunState {
    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn dataset(&self) -> Option<&Arc<Dataset>> {
        self.dataset.as_ref()
    }

    pub fn job(&self) -> Option<&JobConfig> {
        self.job.as_ref()
    }

    pub fn context(&self) -> Option<&AnalysisContext> {
        self.context.as_ref()
    }

    pub fn total_batches(&self) -> usize {
        self.total_batches
    }

    /// Index of the batch in flight, or of the next one to dispatch.
    pub fn current_batch(&self) -> usize {
        self.current_batch
    }

    pub fn batch_in_flight(&self) -> bool {
        self.batch_in_flight
    }

    pub fn output(&self) -> &[Row] {
        &self.output
    }

    pub fn failed_batches(&self) -> &BTreeSet<usize> {
        &self.failed_batches
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn retry_attempt(&self) -> u32 {
        self.retry_attempt
    }

    pub fn abort_reason(&self) -> Option<&AbortReason> {
        self.abort_reason.as_ref()
    }

    pub fn has_more_batches(&self) -> bool {
        self.current_batch < self.total_batches
    }

    fn invalid(&self, event: &RunEvent) -> TranslatorError {
        TranslatorError::InvalidTransition {
            from: self.status,
            event: event.name(),
        }
    }

    fn require(&self, allowed: &[RunStatus], event: &RunEvent) -> Result<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(self.invalid(event))
        }
    }

    fn require_batch(&self, batch: usize, in_flight: bool, event: &RunEvent) -> Result<()> {
        self.require(&[RunStatus::Translating], event)?;
        if batch != self.current_batch || self.batch_in_flight != in_flight {
            return Err(self.invalid(event));
        }
        Ok(())
    }

    fn batch_range(&self, batch: usize, limits: &RunLimits) -> Option<BatchRange> {
        let dataset = self.dataset.as_ref()?;
        limits.batcher.batch_at(batch, dataset.row_count())
    }

    fn check(&self, event: &RunEvent, limits: &RunLimits) -> Result<()> {
        use RunStatus::*;

        match event {
            RunEvent::Upload(dataset) => {
                self.require(&[Idle, Uploaded, Configured], event)?;
                if dataset.is_empty() {
                    return Err(TranslatorError::EmptyDataset);
                }
            }
            RunEvent::Configure(job) => {
                self.require(&[Uploaded, Configured], event)?;
                let columns = self.dataset.as_ref().map_or(0, |d| d.column_count());
                job.validate(columns)?;
            }
            RunEvent::StartAnalysis => self.require(&[Configured], event)?,
            RunEvent::AnalysisComplete(_) | RunEvent::AnalysisFailed => {
                self.require(&[Analyzing], event)?
            }
            RunEvent::StartTranslation => self.require(&[Configured, Analyzing], event)?,
            RunEvent::StartBatch { batch } => {
                self.require_batch(*batch, false, event)?;
                if *batch >= self.total_batches {
                    return Err(self.invalid(event));
                }
            }
            RunEvent::BatchRetry { batch, attempt } => {
                self.require_batch(*batch, true, event)?;
                if *attempt <= self.retry_attempt.max(1) {
                    return Err(self.invalid(event));
                }
            }
            RunEvent::BatchSucceeded { batch, rows } => {
                self.require_batch(*batch, true, event)?;
                let range = self
                    .batch_range(*batch, limits)
                    .ok_or_else(|| self.invalid(event))?;
                if rows.len() != range.len() {
                    return Err(TranslatorError::RowCountMismatch {
                        expected: range.len(),
                        got: rows.len(),
                    });
                }
                let width = self.dataset.as_ref().map_or(0, |d| d.column_count());
                if let Some((offset, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != width)
                {
                    return Err(TranslatorError::ColumnCountMismatch {
                        row: range.start + offset,
                        expected: width,
                        got: row.len(),
                    });
                }
            }
            RunEvent::BatchFailed { batch } => {
                self.require_batch(*batch, true, event)?;
                if self.batch_range(*batch, limits).is_none() {
                    return Err(self.invalid(event));
                }
            }
            RunEvent::Cancel => {
                self.require(&[Configured, Analyzing, Translating], event)?;
                if self.batch_in_flight {
                    return Err(self.invalid(event));
                }
            }
            RunEvent::Reset => self.require(&[Idle, Completed, Aborted], event)?,
        }
        Ok(())
    }

    /// Folds an already-checked event into the next state value.
    fn reduce(mut self, event: RunEvent, limits: &RunLimits) -> Self {
        match event {
            RunEvent::Upload(dataset) => RunState {
                status: RunStatus::Uploaded,
                dataset: Some(Arc::new(dataset)),
                ..RunState::default()
            },
            RunEvent::Configure(job) => {
                self.job = Some(job);
                self.status = RunStatus::Configured;
                self
            }
            RunEvent::StartAnalysis => {
                self.context = None;
                self.status = RunStatus::Analyzing;
                self
            }
            RunEvent::AnalysisComplete(context) => {
                self.context = Some(context);
                self
            }
            RunEvent::AnalysisFailed => {
                self.context = None;
                self
            }
            RunEvent::StartTranslation => {
                let rows = self.dataset.as_ref().map_or(0, |d| d.row_count());
                self.status = RunStatus::Translating;
                self.total_batches = limits.batcher.total_batches(rows);
                self.current_batch = 0;
                self.batch_in_flight = false;
                self.output = Vec::with_capacity(rows);
                self.failed_batches = BTreeSet::new();
                self.consecutive_failures = 0;
                self.retry_attempt = 0;
                self.abort_reason = None;
                self
            }
            RunEvent::StartBatch { .. } => {
                self.batch_in_flight = true;
                self.retry_attempt = 0;
                self
            }
            RunEvent::BatchRetry { attempt, .. } => {
                self.retry_attempt = attempt;
                self
            }
            RunEvent::BatchSucceeded { rows, .. } => {
                self.output.extend(rows);
                self.consecutive_failures = 0;
                self.finish_batch()
            }
            RunEvent::BatchFailed { batch } => {
                if let (Some(dataset), Some(range)) =
                    (self.dataset.clone(), self.batch_range(batch, limits))
                {
                    self.output.extend_from_slice(&dataset.rows()[range.rows()]);
                }
                self.failed_batches.insert(batch);
                self.consecutive_failures += 1;

                if self.consecutive_failures >= limits.max_consecutive_failures {
                    self.batch_in_flight = false;
                    self.retry_attempt = 0;
                    self.current_batch += 1;
                    self.status = RunStatus::Aborted;
                    self.abort_reason = Some(AbortReason::TooManyFailures {
                        consecutive: self.consecutive_failures,
                    });
                    return self;
                }
                self.finish_batch()
            }
            RunEvent::Cancel => {
                self.status = RunStatus::Aborted;
                self.abort_reason = Some(AbortReason::Cancelled);
                self
            }
            RunEvent::Reset => RunState::default(),
        }
    }

    fn finish_batch(mut self) -> Self {
        self.batch_in_flight = false;
        self.retry_attempt = 0;
        self.current_batch += 1;
        if self.current_batch >= self.total_batches {
            self.status = RunStatus::Completed;
        }
        self
    }
}

/// Owns the [`RunState`] of one run and publishes its transitions.
pub struct RunStateMachine {
    run_id: Uuid,
    state: RunState,
    limits: RunLimits,
    progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl RunStateMachine {
    pub fn new(limits: RunLimits) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            state: RunState::default(),
            limits,
            progress: None,
        }
    }

    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn status(&self) -> RunStatus {
        self.state.status
    }

    pub fn limits(&self) -> &RunLimits {
        &self.limits
    }

    /// Range of the batch in flight or about to be dispatched.
    pub fn current_batch_range(&self) -> Option<BatchRange> {
        self.state.batch_range(self.state.current_batch, &self.limits)
    }

    pub fn dispatch(&mut self, event: RunEvent) -> Result<RunStatus> {
        if let Err(e) = self.state.check(&event, &self.limits) {
            tracing::warn!(status = %self.state.status, event = event.name(), error = %e, "Rejected run event");
            return Err(e);
        }

        let from = self.state.status;
        let notice = match &event {
            RunEvent::StartBatch { batch } => Some(ProgressEvent::BatchStarted {
                batch: *batch,
                total_batches: self.state.total_batches,
            }),
            RunEvent::BatchRetry { batch, attempt } => Some(ProgressEvent::BatchRetrying {
                batch: *batch,
                attempt: *attempt,
            }),
            RunEvent::BatchSucceeded { batch, rows } => Some(ProgressEvent::BatchSucceeded {
                batch: *batch,
                rows: rows.len(),
            }),
            RunEvent::BatchFailed { batch } => Some(ProgressEvent::BatchFailed {
                batch: *batch,
                consecutive_failures: self.state.consecutive_failures + 1,
            }),
            _ => None,
        };
        tracing::debug!(status = %from, event = event.name(), "Applying run event");

        let current = std::mem::take(&mut self.state);
        self.state = current.reduce(event, &self.limits);

        if let Some(notice) = notice {
            self.emit(notice);
        }
        let to = self.state.status;
        if to != from {
            self.emit(ProgressEvent::StatusChanged { from, to });
            if let (RunStatus::Aborted, Some(reason)) = (to, self.state.abort_reason.clone()) {
                self.emit(ProgressEvent::Aborted { reason });
            }
        }

        Ok(to)
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.progress {
            // a dropped receiver only means nobody is watching
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translation::SourceLanguage;

    fn dataset(rows: usize) -> Dataset {
        let rows = (0..rows)
            .map(|i| vec![i.to_string(), format!("text {}", i)])
            .collect();
        Dataset::new(vec!["id".to_string(), "text".to_string()], rows).unwrap()
    }

    fn job() -> JobConfig {
        JobConfig::new(SourceLanguage::Auto, "en", [1]).unwrap()
    }

    fn translated(range: BatchRange) -> Vec<Row> {
        range
            .rows()
            .map(|i| vec![i.to_string(), format!("translated {}", i)])
            .collect()
    }

    fn translating(rows: usize, max_failures: u32) -> RunStateMachine {
        let mut machine = RunStateMachine::new(RunLimits::new(10, max_failures).unwrap());
        machine.dispatch(RunEvent::Upload(dataset(rows))).unwrap();
        machine.dispatch(RunEvent::Configure(job())).unwrap();
        machine.dispatch(RunEvent::StartTranslation).unwrap();
        machine
    }

    fn succeed(machine: &mut RunStateMachine) -> RunStatus {
        let range = machine.current_batch_range().unwrap();
        machine.dispatch(RunEvent::StartBatch { batch: range.index }).unwrap();
        machine
            .dispatch(RunEvent::BatchSucceeded {
                batch: range.index,
                rows: translated(range),
            })
            .unwrap()
    }

    fn fail(machine: &mut RunStateMachine) -> RunStatus {
        let batch = machine.state().current_batch();
        machine.dispatch(RunEvent::StartBatch { batch }).unwrap();
        machine.dispatch(RunEvent::BatchFailed { batch }).unwrap()
    }

    #[test]
    fn test_happy_path_completes() {
        let mut machine = translating(25, 3);
        assert_eq!(machine.state().total_batches(), 3);

        assert_eq!(succeed(&mut machine), RunStatus::Translating);
        assert_eq!(succeed(&mut machine), RunStatus::Translating);
        assert_eq!(succeed(&mut machine), RunStatus::Completed);

        assert_eq!(machine.state().output().len(), 25);
        assert!(machine.state().failed_batches().is_empty());
        assert_eq!(machine.state().output()[24][1], "translated 24");
    }

    #[test]
    fn test_failed_batch_falls_back_to_original_rows() {
        let mut machine = translating(25, 3);
        succeed(&mut machine);
        fail(&mut machine);
        assert_eq!(succeed(&mut machine), RunStatus::Completed);

        let state = machine.state();
        assert_eq!(state.output().len(), 25);
        assert_eq!(state.failed_batches().iter().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(&state.output()[10..20], &dataset(25).rows()[10..20]);
        assert_eq!(state.consecutive_failures(), 0);
    }

    #[test]
    fn test_breaker_trips_on_exactly_the_threshold() {
        let mut machine = translating(60, 3);
        assert_eq!(fail(&mut machine), RunStatus::Translating);
        assert_eq!(fail(&mut machine), RunStatus::Translating);
        assert_eq!(machine.state().consecutive_failures(), 2);
        assert_eq!(fail(&mut machine), RunStatus::Aborted);

        let state = machine.state();
        assert_eq!(
            state.abort_reason(),
            Some(&AbortReason::TooManyFailures { consecutive: 3 })
        );
        assert_eq!(state.output().len(), 30);
        assert!(state.has_more_batches());
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let mut machine = translating(60, 3);
        fail(&mut machine);
        fail(&mut machine);
        succeed(&mut machine);
        assert_eq!(machine.state().consecutive_failures(), 0);
        fail(&mut machine);
        fail(&mut machine);
        assert_eq!(succeed(&mut machine), RunStatus::Completed);
        assert_eq!(machine.state().failed_batches().len(), 4);
    }

    #[test]
    fn test_last_batch_failure_below_threshold_completes() {
        let mut machine = translating(5, 3);
        assert_eq!(fail(&mut machine), RunStatus::Completed);
        assert_eq!(machine.state().output(), dataset(5).rows());
    }

    #[test]
    fn test_start_translation_clears_previous_progress() {
        let mut machine = RunStateMachine::new(RunLimits::new(10, 3).unwrap());
        machine.dispatch(RunEvent::Upload(dataset(25))).unwrap();
        machine.dispatch(RunEvent::Configure(job())).unwrap();
        machine.dispatch(RunEvent::StartAnalysis).unwrap();
        machine.dispatch(RunEvent::AnalysisFailed).unwrap();
        assert!(machine.state().context().is_none());
        machine.dispatch(RunEvent::StartTranslation).unwrap();

        let state = machine.state();
        assert_eq!(state.status(), RunStatus::Translating);
        assert_eq!(state.current_batch(), 0);
        assert!(state.output().is_empty());
        assert!(state.failed_batches().is_empty());
        assert_eq!(state.consecutive_failures(), 0);
    }

    #[test]
    fn test_retry_attempts_must_increase() {
        let mut machine = translating(25, 3);
        machine.dispatch(RunEvent::StartBatch { batch: 0 }).unwrap();
        machine.dispatch(RunEvent::BatchRetry { batch: 0, attempt: 2 }).unwrap();
        assert_eq!(machine.state().retry_attempt(), 2);
        assert!(machine
            .dispatch(RunEvent::BatchRetry { batch: 0, attempt: 2 })
            .is_err());
        machine.dispatch(RunEvent::BatchRetry { batch: 0, attempt: 3 }).unwrap();
        machine.dispatch(RunEvent::BatchFailed { batch: 0 }).unwrap();
        assert_eq!(machine.state().retry_attempt(), 0);
    }

    #[test]
    fn test_batches_must_be_dispatched_in_order() {
        let mut machine = translating(25, 3);
        let err = machine.dispatch(RunEvent::StartBatch { batch: 1 }).unwrap_err();
        assert!(matches!(
            err,
            TranslatorError::InvalidTransition {
                from: RunStatus::Translating,
                event: "start_batch"
            }
        ));
    }

    #[test]
    fn test_success_with_wrong_row_count_is_rejected() {
        let mut machine = translating(25, 3);
        machine.dispatch(RunEvent::StartBatch { batch: 0 }).unwrap();
        let err = machine
            .dispatch(RunEvent::BatchSucceeded {
                batch: 0,
                rows: vec![vec!["0".to_string(), "x".to_string()]],
            })
            .unwrap_err();
        assert!(matches!(
            err,
            TranslatorError::RowCountMismatch { expected: 10, got: 1 }
        ));
        assert!(machine.state().batch_in_flight());
    }

    #[test]
    fn test_cancel_keeps_accumulated_output() {
        let mut machine = translating(25, 3);
        succeed(&mut machine);
        assert_eq!(machine.dispatch(RunEvent::Cancel).unwrap(), RunStatus::Aborted);
        assert_eq!(machine.state().abort_reason(), Some(&AbortReason::Cancelled));
        assert_eq!(machine.state().output().len(), 10);
    }

    #[test]
    fn test_cancel_rejected_mid_batch() {
        let mut machine = translating(25, 3);
        machine.dispatch(RunEvent::StartBatch { batch: 0 }).unwrap();
        assert!(machine.dispatch(RunEvent::Cancel).is_err());
    }

    #[test]
    fn test_terminal_states_only_reset() {
        let mut machine = translating(5, 3);
        succeed(&mut machine);
        assert_eq!(machine.status(), RunStatus::Completed);
        assert!(machine.dispatch(RunEvent::StartTranslation).is_err());
        assert!(machine.dispatch(RunEvent::Upload(dataset(3))).is_err());
        assert_eq!(machine.dispatch(RunEvent::Reset).unwrap(), RunStatus::Idle);
        assert!(machine.state().dataset().is_none());
    }

    #[test]
    fn test_reset_rejected_while_translating() {
        let mut machine = translating(5, 3);
        assert!(machine.dispatch(RunEvent::Reset).is_err());
    }

    #[test]
    fn test_empty_upload_and_bad_columns_rejected() {
        let mut machine = RunStateMachine::new(RunLimits::new(10, 3).unwrap());
        let empty = Dataset::new(vec!["a".to_string()], vec![]).unwrap();
        assert!(matches!(
            machine.dispatch(RunEvent::Upload(empty)),
            Err(TranslatorError::EmptyDataset)
        ));

        machine.dispatch(RunEvent::Upload(dataset(3))).unwrap();
        let job = JobConfig::new(SourceLanguage::Auto, "en", [5]).unwrap();
        assert!(matches!(
            machine.dispatch(RunEvent::Configure(job)),
            Err(TranslatorError::InvalidJob(_))
        ));
        assert_eq!(machine.status(), RunStatus::Uploaded);
    }

    #[test]
    fn test_progress_events_are_published() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut machine = RunStateMachine::new(RunLimits::new(10, 1).unwrap()).with_progress(tx);
        machine.dispatch(RunEvent::Upload(dataset(25))).unwrap();
        machine.dispatch(RunEvent::Configure(job())).unwrap();
        machine.dispatch(RunEvent::StartTranslation).unwrap();
        fail(&mut machine);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }

        assert!(events.contains(&ProgressEvent::BatchStarted {
            batch: 0,
            total_batches: 3
        }));
        assert!(events.contains(&ProgressEvent::BatchFailed {
            batch: 0,
            consecutive_failures: 1
        }));
        assert_eq!(
            events.last(),
            Some(&ProgressEvent::Aborted {
                reason: AbortReason::TooManyFailures { consecutive: 1 }
            })
        );
    }
}
