use crate::utils::errors::{Result, TranslatorError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub translation: OrchestrationConfig,
    pub api: ApiConfig,
    pub export: ExportConfig,
    pub http: HttpConfig,
    pub logging: LoggingConfig,
}

/// Policy knobs for the batch driver loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    pub batch_size: usize,
    pub max_retries: u32,
    pub max_consecutive_failures: u32,
    /// Pause before every call to the model, retries included.
    pub rate_limit_delay_ms: u64,
    /// Linear backoff step: attempt `k` waits `k * retry_backoff_ms` first.
    pub retry_backoff_ms: u64,
    pub analysis_sample_size: usize,
    pub run_analysis: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key_env: String,
    pub timeout_seconds: u64,
    pub temperature: f32,
    pub max_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Pad aborted runs with the untouched rows of batches never processed.
    pub fill_unprocessed: bool,
    pub sanitize_cells: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
    /// Finished runs are dropped this long after they end.
    pub run_ttl_seconds: u64,
    pub cleanup_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_retries: 3,
            max_consecutive_failures: 3,
            rate_limit_delay_ms: 200,
            retry_backoff_ms: 500,
            analysis_sample_size: 15,
            run_analysis: true,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.deepseek.com/chat/completions".to_string(),
            model: "deepseek-chat".to_string(),
            api_key_env: "DEEPSEEK_API_KEY".to_string(),
            timeout_seconds: 120,
            temperature: 0.3,
            max_tokens: 8192,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            fill_unprocessed: true,
            sanitize_cells: false,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 9527,
            run_ttl_seconds: 3600,
            cleanup_interval_seconds: 300,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl OrchestrationConfig {
    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_millis(self.rate_limit_delay_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(TranslatorError::ConfigError(
                "batch_size must be a positive integer".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(TranslatorError::ConfigError(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.max_consecutive_failures == 0 {
            return Err(TranslatorError::ConfigError(
                "max_consecutive_failures must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl HttpConfig {
    pub fn run_ttl(&self) -> Duration {
        Duration::from_secs(self.run_ttl_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds.max(1))
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn api_key(&self) -> Result<String> {
        std::env::var(&self.api_key_env).map_err(|_| {
            TranslatorError::ConfigError(format!(
                "environment variable {} is not set",
                self.api_key_env
            ))
        })
    }
}

impl AppConfig {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TranslatorError::ConfigError(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| TranslatorError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.translation.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_policy_constants() {
        let config = AppConfig::default();
        assert_eq!(config.translation.batch_size, 10);
        assert_eq!(config.translation.max_retries, 3);
        assert_eq!(config.translation.max_consecutive_failures, 3);
        assert_eq!(config.translation.rate_limit_delay(), Duration::from_millis(200));
        assert_eq!(config.translation.analysis_sample_size, 15);
        assert!(config.export.fill_unprocessed);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [translation]
            batch_size = 25

            [api]
            model = "gpt-4o-mini"
            "#,
        )
        .unwrap();

        assert_eq!(config.translation.batch_size, 25);
        assert_eq!(config.translation.max_retries, 3);
        assert_eq!(config.api.model, "gpt-4o-mini");
        assert_eq!(config.http.port, 9527);
        assert_eq!(config.http.run_ttl(), Duration::from_secs(3600));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let err = AppConfig::from_toml_str("[translation]\nbatch_size = 0\n").unwrap_err();
        assert!(matches!(err, TranslatorError::ConfigError(_)));
    }

    #[test]
    fn test_negative_batch_size_rejected() {
        assert!(AppConfig::from_toml_str("[translation]\nbatch_size = -4\n").is_err());
    }
}
