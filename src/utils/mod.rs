pub mod config;
pub mod errors;

pub use config::{
    ApiConfig, AppConfig, ExportConfig, HttpConfig, LoggingConfig, OrchestrationConfig,
};
pub use errors::{Result, TranslatorError};

/// Neutralizes spreadsheet formula injection by quoting cells that a
/// spreadsheet application would evaluate.
pub fn sanitize_cell(value: &str) -> String {
    if value.starts_with('=')
        || value.starts_with('+')
        || value.starts_with('-')
        || value.starts_with('@')
    {
        format!("'{}", value)
    } else {
        value.to_string()
    }
}
