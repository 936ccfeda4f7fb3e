//! Sequential batch driver.
//!
//! Batches go out one at a time in ascending order. The cancellation token
//! is only polled between batches: an attempt already talking to the model
//! always runs to completion.

use crate::csv_processor::{serialize_csv, CsvStreamWriter, Dataset, Row};
use crate::state::{AbortReason, RunEvent, RunLimits, RunStateMachine, RunStatus};
use crate::translation::retry::{BatchOutcome, BatchRetryPolicy};
use crate::translation::{BatchRequest, BatchTranslator, ContextAnalyzer, JobConfig};
use crate::utils::{ExportConfig, OrchestrationConfig, Result, TranslatorError};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Sleeps before every call so the model endpoint is never hammered.
struct Paced<T> {
    inner: T,
    delay: Duration,
}

#[async_trait]
impl<T: BatchTranslator> BatchTranslator for Paced<T> {
    async fn translate_batch(&self, request: &BatchRequest<'_>) -> Result<Vec<Row>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.translate_batch(request).await
    }
}

pub struct Orchestrator<T> {
    translator: Paced<T>,
    retry: BatchRetryPolicy,
    analysis_sample_size: usize,
}

impl<T: BatchTranslator> Orchestrator<T> {
    pub fn new(translator: T, retry: BatchRetryPolicy, pacing: Duration) -> Self {
        Self {
            translator: Paced {
                inner: translator,
                delay: pacing,
            },
            retry,
            analysis_sample_size: OrchestrationConfig::default().analysis_sample_size,
        }
    }

    pub fn from_config(translator: T, config: &OrchestrationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(
            translator,
            BatchRetryPolicy::from_config(config)?,
            config.rate_limit_delay(),
        )
        .with_analysis_sample_size(config.analysis_sample_size))
    }

    pub fn with_analysis_sample_size(mut self, rows: usize) -> Self {
        self.analysis_sample_size = rows;
        self
    }

    /// Loads `dataset`, runs the optional analysis step and drives every
    /// batch. A failed analysis only means the run goes on without context.
    pub async fn translate(
        &self,
        machine: &mut RunStateMachine,
        dataset: Dataset,
        job: JobConfig,
        analyzer: Option<&dyn ContextAnalyzer>,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let span = info_span!("translation_run", run_id = %machine.run_id());

        async move {
            machine.dispatch(RunEvent::Upload(dataset))?;
            machine.dispatch(RunEvent::Configure(job))?;

            if let Some(analyzer) = analyzer {
                self.analyze(machine, analyzer).await?;
            }

            machine.dispatch(RunEvent::StartTranslation)?;
            self.run(machine, cancel).await
        }
        .instrument(span)
        .await
    }

    async fn analyze(
        &self,
        machine: &mut RunStateMachine,
        analyzer: &dyn ContextAnalyzer,
    ) -> Result<()> {
        let dataset = machine
            .state()
            .dataset()
            .cloned()
            .ok_or(TranslatorError::EmptyDataset)?;
        machine.dispatch(RunEvent::StartAnalysis)?;

        let sample = dataset.sample(self.analysis_sample_size);
        match analyzer.analyze(dataset.headers(), sample).await {
            Ok(context) => {
                info!(domain = %context.domain, style = %context.style, "Analysis complete");
                machine.dispatch(RunEvent::AnalysisComplete(context))?;
            }
            Err(e) => {
                warn!(error = %e, "Analysis failed, continuing without context");
                machine.dispatch(RunEvent::AnalysisFailed)?;
            }
        }
        Ok(())
    }

    /// Drives a machine already in `translating` until it completes or
    /// aborts. Batch failures are absorbed into the run state; an `Err` here
    /// means the machine was not ready to run.
    pub async fn run(
        &self,
        machine: &mut RunStateMachine,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        if machine.status() != RunStatus::Translating {
            return Err(TranslatorError::InvalidTransition {
                from: machine.status(),
                event: "run",
            });
        }

        let state = machine.state();
        let dataset = state.dataset().cloned().ok_or(TranslatorError::EmptyDataset)?;
        let job = state
            .job()
            .cloned()
            .ok_or_else(|| TranslatorError::InvalidJob("run has no job configuration".to_string()))?;
        let context = state.context().cloned();

        info!(
            rows = dataset.row_count(),
            total_batches = state.total_batches(),
            with_context = context.is_some(),
            "Starting batch translation"
        );

        while machine.status() == RunStatus::Translating {
            if cancel.is_cancelled() {
                info!(next_batch = machine.state().current_batch(), "Cancellation requested");
                machine.dispatch(RunEvent::Cancel)?;
                break;
            }

            let Some(range) = machine.current_batch_range() else {
                break;
            };
            let batch = range.index;
            machine.dispatch(RunEvent::StartBatch { batch })?;

            let request = BatchRequest {
                batch_index: batch,
                rows: &dataset.rows()[range.rows()],
                headers: dataset.headers(),
                columns: &job.columns,
                context: context.as_ref(),
                source_lang: &job.source_lang,
                target_lang: &job.target_lang,
            };

            let outcome = self
                .retry
                .execute(&self.translator, &request, |notice| {
                    info!(batch_index = batch, attempt = notice.attempt, delay_ms = notice.delay.as_millis() as u64, "Retrying batch");
                    if let Err(e) = machine.dispatch(RunEvent::BatchRetry {
                        batch,
                        attempt: notice.attempt,
                    }) {
                        warn!(batch_index = batch, error = %e, "Retry notice rejected");
                    }
                })
                .await;

            match outcome {
                BatchOutcome::Translated { rows, attempts } => {
                    let count = rows.len();
                    match machine.dispatch(RunEvent::BatchSucceeded { batch, rows }) {
                        Ok(_) => info!(batch_index = batch, rows = count, attempts, "Batch translated"),
                        Err(e) => {
                            warn!(batch_index = batch, error = %e, "Translated batch rejected, keeping original rows");
                            machine.dispatch(RunEvent::BatchFailed { batch })?;
                        }
                    }
                }
                BatchOutcome::Failed { attempts, error } => {
                    warn!(batch_index = batch, attempts, error = %error, "Batch failed, keeping original rows");
                    machine.dispatch(RunEvent::BatchFailed { batch })?;
                }
            }
        }

        let report = RunReport::from_machine(machine);
        match &report.abort_reason {
            Some(reason) => warn!(
                reason = %reason,
                rows = report.rows.len(),
                failed_batches = report.failed_batches.len(),
                "Translation aborted"
            ),
            None => info!(
                rows = report.rows.len(),
                failed_batches = report.failed_batches.len(),
                "Translation completed"
            ),
        }
        Ok(report)
    }
}

/// Runs one dataset end to end with a fresh state machine.
pub async fn translate_dataset<T: BatchTranslator>(
    translator: T,
    analyzer: Option<&dyn ContextAnalyzer>,
    dataset: Dataset,
    job: JobConfig,
    config: &OrchestrationConfig,
    cancel: &CancellationToken,
) -> Result<RunReport> {
    let orchestrator = Orchestrator::from_config(translator, config)?;
    let mut machine = RunStateMachine::new(RunLimits::from_config(config)?);
    let analyzer = if config.run_analysis { analyzer } else { None };
    orchestrator
        .translate(&mut machine, dataset, job, analyzer, cancel)
        .await
}

/// Final (or partial) result of a run, ready for export.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub abort_reason: Option<AbortReason>,
    pub headers: Vec<String>,
    /// Output rows in input order; shorter than the input only when the run
    /// aborted before its last batch.
    pub rows: Vec<Row>,
    pub failed_batches: BTreeSet<usize>,
    pub total_batches: usize,
    pub processed_batches: usize,
    pub total_rows: usize,
    #[serde(skip)]
    source: Option<Arc<Dataset>>,
}

impl RunReport {
    pub fn from_machine(machine: &RunStateMachine) -> Self {
        let state = machine.state();
        let source = state.dataset().cloned();

        Self {
            run_id: machine.run_id(),
            status: state.status(),
            abort_reason: state.abort_reason().cloned(),
            headers: source
                .as_ref()
                .map(|d| d.headers().to_vec())
                .unwrap_or_default(),
            rows: state.output().to_vec(),
            failed_batches: state.failed_batches().clone(),
            total_batches: state.total_batches(),
            processed_batches: state.current_batch().min(state.total_batches()),
            total_rows: source.as_ref().map_or(0, |d| d.row_count()),
            source,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn unprocessed_rows(&self) -> usize {
        self.total_rows.saturating_sub(self.rows.len())
    }

    /// Output rows, optionally padded with the untouched input rows of
    /// batches the run never reached.
    pub fn export_rows(&self, fill_unprocessed: bool) -> Vec<Row> {
        let mut rows = self.rows.clone();
        if fill_unprocessed {
            if let Some(source) = &self.source {
                rows.extend_from_slice(&source.rows()[self.rows.len()..]);
            }
        }
        rows
    }

    pub fn to_csv(&self, export: &ExportConfig) -> Result<String> {
        serialize_csv(
            &self.headers,
            &self.export_rows(export.fill_unprocessed),
            export.sanitize_cells,
        )
    }

    pub fn write_csv(&self, path: &str, export: &ExportConfig) -> Result<usize> {
        let mut writer = CsvStreamWriter::create(path, self.headers.clone())?
            .with_sanitize(export.sanitize_cells);
        writer.write_rows(&self.export_rows(export.fill_unprocessed))?;
        let written = writer.rows_written();
        writer.finish()?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl BatchTranslator for Echo {
        async fn translate_batch(&self, request: &BatchRequest<'_>) -> Result<Vec<Row>> {
            Ok(request.rows.to_vec())
        }
    }

    #[test]
    fn test_new_uses_configured_sample_size_default() {
        let config = OrchestrationConfig::default();
        let plain = Orchestrator::new(Echo, BatchRetryPolicy::default(), Duration::ZERO);
        let configured = Orchestrator::from_config(Echo, &config).unwrap();

        assert_eq!(plain.analysis_sample_size, config.analysis_sample_size);
        assert_eq!(configured.analysis_sample_size, plain.analysis_sample_size);
        assert_eq!(plain.with_analysis_sample_size(4).analysis_sample_size, 4);
    }
}
