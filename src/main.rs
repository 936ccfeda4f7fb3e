use anyhow::Context;
use clap::{Parser, Subcommand};
use csv_batch_translator::csv_processor::{default_columns, get_file_size, summarize_dataset};
use csv_batch_translator::server::{run_http_server, ServerState};
use csv_batch_translator::{
    AppConfig, ContextAnalyzer, CsvStreamReader, Dataset, JobConfig, LlmClient, Orchestrator,
    ProgressEvent, RunLimits, RunReport, RunStateMachine, SourceLanguage,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "csv-batch-translator")]
#[command(about = "Translate selected CSV columns in batches through an LLM")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Translate a CSV file
    Translate {
        /// Input CSV file
        #[arg(short, long)]
        input: String,

        /// Output CSV file (default: translated_<input name>)
        #[arg(short, long)]
        output: Option<String>,

        /// Target language code
        #[arg(short, long)]
        target: String,

        /// Source language code, or "auto"
        #[arg(short, long, default_value = "auto")]
        source: String,

        /// Comma-separated column names or indices (default: non-numeric columns)
        #[arg(long, value_delimiter = ',')]
        columns: Vec<String>,

        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        max_retries: Option<u32>,

        #[arg(long)]
        max_consecutive_failures: Option<u32>,

        /// Skip the pre-translation analysis step
        #[arg(long)]
        no_analysis: bool,
    },

    /// Print a summary of a CSV file
    Inspect {
        #[arg(short, long)]
        input: String,

        #[arg(long, default_value_t = 5)]
        sample_rows: usize,
    },

    /// Run the HTTP API
    Serve {
        #[arg(long)]
        bind: Option<String>,

        #[arg(long)]
        port: Option<u16>,
    },
}

fn init_logging(config: &AppConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(
        format!("csv_batch_translator={}", config.logging.level).parse()?,
    );

    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

fn resolve_columns(dataset: &Dataset, requested: &[String]) -> anyhow::Result<BTreeSet<usize>> {
    if requested.is_empty() {
        return Ok(default_columns(dataset));
    }

    requested
        .iter()
        .map(|token| {
            let token = token.trim();
            dataset
                .column_index(token)
                .or_else(|| token.parse::<usize>().ok())
                .with_context(|| format!("unknown column: {}", token))
        })
        .collect()
}

fn default_output_path(input: &str) -> String {
    let path = Path::new(input);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "output.csv".to_string());
    path.with_file_name(format!("translated_{}", name))
        .to_string_lossy()
        .to_string()
}

fn spawn_progress_logger(mut rx: mpsc::UnboundedReceiver<ProgressEvent>) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                ProgressEvent::BatchStarted {
                    batch,
                    total_batches,
                } => tracing::info!("Batch {}/{}", batch + 1, total_batches),
                ProgressEvent::BatchRetrying { batch, attempt } => {
                    tracing::info!("Batch {} retry attempt {}", batch + 1, attempt)
                }
                ProgressEvent::StatusChanged { from, to } => {
                    tracing::debug!(%from, %to, "Status changed")
                }
                _ => {}
            }
        }
    });
}

#[allow(clippy::too_many_arguments)]
async fn run_translate(
    mut config: AppConfig,
    input: String,
    output: Option<String>,
    target: String,
    source: String,
    columns: Vec<String>,
    overrides: (Option<usize>, Option<u32>, Option<u32>),
    no_analysis: bool,
) -> anyhow::Result<ExitCode> {
    let (batch_size, max_retries, max_consecutive_failures) = overrides;
    if let Some(v) = batch_size {
        config.translation.batch_size = v;
    }
    if let Some(v) = max_retries {
        config.translation.max_retries = v;
    }
    if let Some(v) = max_consecutive_failures {
        config.translation.max_consecutive_failures = v;
    }
    if no_analysis {
        config.translation.run_analysis = false;
    }
    config.validate()?;

    let dataset = CsvStreamReader::new(&input).read_dataset()?;
    let columns = resolve_columns(&dataset, &columns)?;
    let job = JobConfig::new(source.parse::<SourceLanguage>()?, target, columns)?;
    let output = output.unwrap_or_else(|| default_output_path(&input));

    let client = Arc::new(LlmClient::from_config(&config.api)?);
    let orchestrator = Orchestrator::from_config(client.clone(), &config.translation)?;

    let (tx, rx) = mpsc::unbounded_channel();
    spawn_progress_logger(rx);
    let mut machine =
        RunStateMachine::new(RunLimits::from_config(&config.translation)?).with_progress(tx);

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current batch");
            ctrl_c.cancel();
        }
    });

    let analyzer: Option<&dyn ContextAnalyzer> = if config.translation.run_analysis {
        Some(&*client as &dyn ContextAnalyzer)
    } else {
        None
    };

    tracing::info!(
        input = %input,
        rows = dataset.row_count(),
        model = client.model(),
        "Starting translation"
    );
    let report = orchestrator
        .translate(&mut machine, dataset, job, analyzer, &cancel)
        .await?;

    let written = report.write_csv(&output, &config.export)?;
    tracing::info!(output = %output, rows = written, "Output written");

    if !report.failed_batches.is_empty() {
        tracing::warn!(
            "{} batch(es) failed and were left unchanged: {:?}",
            report.failed_batches.len(),
            report.failed_batches
        );
    }
    if let Some(reason) = &report.abort_reason {
        tracing::warn!(
            processed_batches = report.processed_batches,
            total_batches = report.total_batches,
            "Translation aborted ({}); partial result saved",
            reason
        );
    }

    Ok(ExitCode::from(exit_status(&report)))
}

/// 2 when the run aborted, so scripts can tell a partial file from a full one.
fn exit_status(report: &RunReport) -> u8 {
    if report.abort_reason.is_some() {
        2
    } else {
        0
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let loaded = AppConfig::load_from_file(&cli.config);
    let config = match &loaded {
        Ok(config) => config.clone(),
        Err(_) => AppConfig::default(),
    };
    init_logging(&config)?;
    if let Err(e) = loaded {
        tracing::warn!(path = %cli.config, error = %e, "Falling back to default configuration");
    }

    let code = match cli.command {
        Commands::Translate {
            input,
            output,
            target,
            source,
            columns,
            batch_size,
            max_retries,
            max_consecutive_failures,
            no_analysis,
        } => {
            run_translate(
                config,
                input,
                output,
                target,
                source,
                columns,
                (batch_size, max_retries, max_consecutive_failures),
                no_analysis,
            )
            .await?
        }
        Commands::Inspect { input, sample_rows } => {
            let dataset = CsvStreamReader::new(&input).read_dataset()?;
            let bytes = get_file_size(&input).await?;
            tracing::info!(input = %input, bytes, "Loaded CSV");
            let summary = summarize_dataset(&dataset, sample_rows);
            println!("{}", serde_json::to_string_pretty(&summary)?);
            ExitCode::SUCCESS
        }
        Commands::Serve { bind, port } => {
            let mut config = config;
            if let Some(bind) = bind {
                config.http.bind = bind;
            }
            if let Some(port) = port {
                config.http.port = port;
            }

            let client = Arc::new(LlmClient::from_config(&config.api)?);
            let analyzer: Arc<dyn ContextAnalyzer> = client.clone();
            let state = ServerState::new(config, client, Some(analyzer))?;
            run_http_server(state).await?;
            ExitCode::SUCCESS
        }
    };

    tracing::info!("Done");
    Ok(code)
}
