use crate::csv_processor::{default_columns, summarize_dataset, CsvStreamReader, Dataset, DatasetSummary};
use crate::state::{ProgressEvent, RunLimits, RunProgress, RunStateMachine};
use crate::translation::{BatchTranslator, ContextAnalyzer, JobConfig, Orchestrator, RunReport, SourceLanguage};
use crate::utils::{AppConfig, TranslatorError};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

type SharedTranslator = Arc<dyn BatchTranslator>;
type SharedAnalyzer = Arc<dyn ContextAnalyzer>;

struct RunEntry {
    cancel: CancellationToken,
    progress: RunProgress,
    report: Option<RunReport>,
    error: Option<String>,
    finished_at: Option<Instant>,
}

impl RunEntry {
    fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

#[derive(Clone)]
pub struct ServerState {
    config: Arc<AppConfig>,
    orchestrator: Arc<Orchestrator<SharedTranslator>>,
    analyzer: Option<SharedAnalyzer>,
    runs: Arc<RwLock<HashMap<Uuid, RunEntry>>>,
}

impl ServerState {
    pub fn new(
        config: AppConfig,
        translator: SharedTranslator,
        analyzer: Option<SharedAnalyzer>,
    ) -> crate::utils::Result<Self> {
        let orchestrator = Orchestrator::from_config(translator, &config.translation)?;
        let analyzer = if config.translation.run_analysis { analyzer } else { None };
        Ok(Self {
            config: Arc::new(config),
            orchestrator: Arc::new(orchestrator),
            analyzer,
            runs: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Drops finished runs older than `http.run_ttl_seconds`. Runs still in
    /// progress are never evicted.
    pub async fn evict_expired_runs(&self) -> usize {
        let ttl = self.config.http.run_ttl();
        let mut runs = self.runs.write().await;
        let before = runs.len();

        runs.retain(|run_id, entry| match entry.finished_at {
            Some(finished_at) if finished_at.elapsed() > ttl => {
                tracing::info!(run_id = %run_id, "Evicted expired run");
                false
            }
            _ => true,
        });

        before - runs.len()
    }
}

async fn cleanup_loop(state: ServerState) {
    let mut ticker = interval(state.config.http.cleanup_interval());
    loop {
        ticker.tick().await;
        let evicted = state.evict_expired_runs().await;
        if evicted > 0 {
            tracing::info!(runs_evicted = evicted, "Cleanup completed");
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(run_id: Uuid) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("Run not found: {}", run_id))
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<TranslatorError> for ApiError {
    fn from(e: TranslatorError) -> Self {
        let status = match e {
            TranslatorError::FileNotFound(_) => StatusCode::NOT_FOUND,
            TranslatorError::IoError(_)
            | TranslatorError::HttpError(_)
            | TranslatorError::ApiError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub file_path: String,
    pub sample_rows: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    pub input_file: String,
    pub target_lang: String,
    pub source_lang: Option<String>,
    /// Header names; defaults to every non-numeric column.
    pub columns: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct RunStarted {
    pub run_id: Uuid,
    pub total_rows: usize,
    pub total_batches: usize,
}

#[derive(Debug, Serialize)]
pub struct RunView {
    pub run_id: Uuid,
    pub progress: RunProgress,
    pub finished: bool,
    pub rows_available: usize,
    pub error: Option<String>,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/info", get(info))
        .route("/analyze", post(analyze))
        .route("/runs", post(start_run))
        .route("/runs/:id", get(run_progress).delete(delete_run))
        .route("/runs/:id/cancel", post(cancel_run))
        .route("/runs/:id/result", get(run_result))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "csv-batch-translator",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn info() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "csv-batch-translator",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "GET /health": "Health check",
            "GET /info": "Server info",
            "POST /analyze": "Summarize a CSV file",
            "POST /runs": "Start a translation run",
            "GET /runs/:id": "Run progress",
            "POST /runs/:id/cancel": "Cancel a run before its next batch",
            "GET /runs/:id/result": "Download the translated CSV",
            "DELETE /runs/:id": "Drop a finished run"
        }
    }))
}

pub async fn analyze(
    State(state): State<ServerState>,
    Json(payload): Json<AnalyzeRequest>,
) -> Result<Json<DatasetSummary>, ApiError> {
    let dataset = CsvStreamReader::new(payload.file_path).read_dataset()?;
    let sample_rows = payload
        .sample_rows
        .unwrap_or(state.config.translation.analysis_sample_size);
    Ok(Json(summarize_dataset(&dataset, sample_rows)))
}

fn resolve_columns(dataset: &Dataset, names: Option<&[String]>) -> Result<BTreeSet<usize>, ApiError> {
    match names {
        Some(names) => names
            .iter()
            .map(|name| {
                dataset.column_index(name).ok_or_else(|| {
                    ApiError::new(StatusCode::BAD_REQUEST, format!("Unknown column: {}", name))
                })
            })
            .collect(),
        None => Ok(default_columns(dataset)),
    }
}

pub async fn start_run(
    State(state): State<ServerState>,
    Json(payload): Json<StartRunRequest>,
) -> Result<Json<RunStarted>, ApiError> {
    let dataset = CsvStreamReader::new(&payload.input_file).read_dataset()?;
    let source_lang: SourceLanguage = payload.source_lang.as_deref().unwrap_or("auto").parse()?;
    let columns = resolve_columns(&dataset, payload.columns.as_deref())?;
    let job = JobConfig::new(source_lang, payload.target_lang, columns)?;
    job.validate(dataset.column_count())?;

    let limits = RunLimits::from_config(&state.config.translation)?;
    let total_rows = dataset.row_count();
    let total_batches = limits.batcher().total_batches(total_rows);

    let (tx, rx) = mpsc::unbounded_channel();
    let mut machine = RunStateMachine::new(limits).with_progress(tx);
    let run_id = machine.run_id();
    let cancel = CancellationToken::new();

    state.runs.write().await.insert(
        run_id,
        RunEntry {
            cancel: cancel.clone(),
            progress: RunProgress::new(),
            report: None,
            error: None,
            finished_at: None,
        },
    );

    tokio::spawn(track_progress(state.runs.clone(), run_id, rx));

    let task_state = state.clone();
    tokio::spawn(async move {
        let analyzer = task_state.analyzer.as_deref();
        let result = task_state
            .orchestrator
            .translate(&mut machine, dataset, job, analyzer, &cancel)
            .await;

        let mut runs = task_state.runs.write().await;
        if let Some(entry) = runs.get_mut(&run_id) {
            entry.finished_at = Some(Instant::now());
            match result {
                Ok(report) => {
                    entry.progress.status = report.status;
                    entry.report = Some(report);
                }
                Err(e) => {
                    tracing::error!(run_id = %run_id, error = %e, "Translation run failed to start");
                    entry.error = Some(e.to_string());
                }
            }
        }
    });

    tracing::info!(run_id = %run_id, input = %payload.input_file, total_rows, "Run started");

    Ok(Json(RunStarted {
        run_id,
        total_rows,
        total_batches,
    }))
}

async fn track_progress(
    runs: Arc<RwLock<HashMap<Uuid, RunEntry>>>,
    run_id: Uuid,
    mut rx: mpsc::UnboundedReceiver<ProgressEvent>,
) {
    while let Some(event) = rx.recv().await {
        if let Some(entry) = runs.write().await.get_mut(&run_id) {
            entry.progress.apply(&event);
        }
    }
}

pub async fn run_progress(
    State(state): State<ServerState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunView>, ApiError> {
    let runs = state.runs.read().await;
    let entry = runs.get(&run_id).ok_or_else(|| ApiError::not_found(run_id))?;

    Ok(Json(RunView {
        run_id,
        progress: entry.progress.clone(),
        finished: entry.is_finished(),
        rows_available: entry.report.as_ref().map_or(0, |r| r.rows.len()),
        error: entry.error.clone(),
    }))
}

pub async fn cancel_run(
    State(state): State<ServerState>,
    Path(run_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let runs = state.runs.read().await;
    let entry = runs.get(&run_id).ok_or_else(|| ApiError::not_found(run_id))?;
    entry.cancel.cancel();
    tracing::info!(run_id = %run_id, "Cancellation requested");

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "cancellation_requested" })),
    ))
}

/// Removes a finished run and its result. Running runs must be cancelled
/// first.
pub async fn delete_run(
    State(state): State<ServerState>,
    Path(run_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let mut runs = state.runs.write().await;
    let entry = runs.get(&run_id).ok_or_else(|| ApiError::not_found(run_id))?;
    if !entry.is_finished() {
        return Err(ApiError::new(StatusCode::CONFLICT, "Run is still in progress"));
    }
    runs.remove(&run_id);
    tracing::info!(run_id = %run_id, "Run deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn run_result(
    State(state): State<ServerState>,
    Path(run_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let runs = state.runs.read().await;
    let entry = runs.get(&run_id).ok_or_else(|| ApiError::not_found(run_id))?;
    let report = entry
        .report
        .as_ref()
        .ok_or_else(|| ApiError::new(StatusCode::CONFLICT, "Run has not finished yet"))?;

    let csv = report.to_csv(&state.config.export)?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
        csv,
    )
        .into_response())
}

pub async fn run_http_server(state: ServerState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.http.bind, state.config.http.port);
    tokio::spawn(cleanup_loop(state.clone()));
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("HTTP server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
