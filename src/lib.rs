pub mod csv_processor;
pub mod server;
pub mod state;
pub mod translation;
pub mod utils;

pub use csv_processor::{BatchRange, CsvStreamReader, CsvStreamWriter, Dataset, Row, RowBatcher};
pub use server::ServerState;
pub use state::{AbortReason, ProgressEvent, RunEvent, RunLimits, RunProgress, RunStateMachine, RunStatus};
pub use translation::{
    translate_dataset, AnalysisContext, BatchRequest, BatchRetryPolicy, BatchTranslator,
    ContextAnalyzer, JobConfig, LlmClient, Orchestrator, RunReport, SourceLanguage,
};
pub use utils::{AppConfig, OrchestrationConfig, Result, TranslatorError};
