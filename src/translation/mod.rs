pub mod client;
pub mod orchestrator;
pub mod prompts;
pub mod retry;

pub use client::LlmClient;
pub use orchestrator::{translate_dataset, Orchestrator, RunReport};
pub use prompts::{build_analysis_prompt, build_translation_prompt};
pub use retry::{Backoff, BatchOutcome, BatchRetryPolicy, RetryNotice};

use crate::csv_processor::Row;
use crate::utils::{Result, TranslatorError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

const AUTO_DETECT: &str = "auto";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SourceLanguage {
    Auto,
    Tag(String),
}

impl FromStr for SourceLanguage {
    type Err = TranslatorError;

    fn from_str(s: &str) -> Result<Self> {
        let tag = s.trim();
        if tag.is_empty() {
            return Err(TranslatorError::InvalidJob(
                "source language must not be empty".to_string(),
            ));
        }
        if tag.eq_ignore_ascii_case(AUTO_DETECT) {
            Ok(SourceLanguage::Auto)
        } else {
            Ok(SourceLanguage::Tag(tag.to_string()))
        }
    }
}

impl TryFrom<String> for SourceLanguage {
    type Error = TranslatorError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SourceLanguage> for String {
    fn from(value: SourceLanguage) -> Self {
        value.to_string()
    }
}

impl std::fmt::Display for SourceLanguage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceLanguage::Auto => write!(f, "{}", AUTO_DETECT),
            SourceLanguage::Tag(tag) => write!(f, "{}", tag),
        }
    }
}

/// Languages and columns of one run. Fixed once translation starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    pub source_lang: SourceLanguage,
    pub target_lang: String,
    /// Column indices in ascending order.
    pub columns: BTreeSet<usize>,
}

impl JobConfig {
    pub fn new(
        source_lang: SourceLanguage,
        target_lang: impl Into<String>,
        columns: impl IntoIterator<Item = usize>,
    ) -> Result<Self> {
        let target_lang = target_lang.into().trim().to_string();
        if target_lang.is_empty() || target_lang.eq_ignore_ascii_case(AUTO_DETECT) {
            return Err(TranslatorError::InvalidJob(format!(
                "invalid target language: {:?}",
                target_lang
            )));
        }

        let columns: BTreeSet<usize> = columns.into_iter().collect();
        if columns.is_empty() {
            return Err(TranslatorError::InvalidJob(
                "at least one column must be selected".to_string(),
            ));
        }

        Ok(Self {
            source_lang,
            target_lang,
            columns,
        })
    }

    pub fn validate(&self, column_count: usize) -> Result<()> {
        if let Some(&out_of_range) = self.columns.iter().find(|&&c| c >= column_count) {
            return Err(TranslatorError::InvalidJob(format!(
                "column {} is out of range for {} columns",
                out_of_range, column_count
            )));
        }
        if self.columns.is_empty() {
            return Err(TranslatorError::InvalidJob(
                "at least one column must be selected".to_string(),
            ));
        }
        Ok(())
    }
}

/// Optional hints derived from a sample of the data before batching.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisContext {
    pub domain: String,
    pub style: String,
    pub preserve_terms: Vec<String>,
    pub notes: String,
}

/// Everything the model needs to translate one batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchRequest<'a> {
    pub batch_index: usize,
    pub rows: &'a [Row],
    pub headers: &'a [String],
    pub columns: &'a BTreeSet<usize>,
    pub context: Option<&'a AnalysisContext>,
    pub source_lang: &'a SourceLanguage,
    pub target_lang: &'a str,
}

/// Performs one translation call. Implementations do not retry.
#[async_trait]
pub trait BatchTranslator: Send + Sync {
    async fn translate_batch(&self, request: &BatchRequest<'_>) -> Result<Vec<Row>>;
}

/// Derives [`AnalysisContext`] from the headers and a sample of rows.
#[async_trait]
pub trait ContextAnalyzer: Send + Sync {
    async fn analyze(&self, headers: &[String], sample_rows: &[Row]) -> Result<AnalysisContext>;
}

#[async_trait]
impl<T: BatchTranslator + ?Sized> BatchTranslator for &T {
    async fn translate_batch(&self, request: &BatchRequest<'_>) -> Result<Vec<Row>> {
        (**self).translate_batch(request).await
    }
}

#[async_trait]
impl<T: ContextAnalyzer + ?Sized> ContextAnalyzer for &T {
    async fn analyze(&self, headers: &[String], sample_rows: &[Row]) -> Result<AnalysisContext> {
        (**self).analyze(headers, sample_rows).await
    }
}

#[async_trait]
impl<T: BatchTranslator + ?Sized> BatchTranslator for std::sync::Arc<T> {
    async fn translate_batch(&self, request: &BatchRequest<'_>) -> Result<Vec<Row>> {
        (**self).translate_batch(request).await
    }
}

#[async_trait]
impl<T: ContextAnalyzer + ?Sized> ContextAnalyzer for std::sync::Arc<T> {
    async fn analyze(&self, headers: &[String], sample_rows: &[Row]) -> Result<AnalysisContext> {
        (**self).analyze(headers, sample_rows).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_language_parsing() {
        assert_eq!("auto".parse::<SourceLanguage>().unwrap(), SourceLanguage::Auto);
        assert_eq!("AUTO".parse::<SourceLanguage>().unwrap(), SourceLanguage::Auto);
        assert_eq!(
            " ja ".parse::<SourceLanguage>().unwrap(),
            SourceLanguage::Tag("ja".to_string())
        );
        assert!("".parse::<SourceLanguage>().is_err());
    }

    #[test]
    fn test_job_rejects_auto_target_and_empty_columns() {
        assert!(JobConfig::new(SourceLanguage::Auto, "auto", [0]).is_err());
        assert!(JobConfig::new(SourceLanguage::Auto, "en", Vec::<usize>::new()).is_err());
    }

    #[test]
    fn test_job_validates_column_bounds() {
        let job = JobConfig::new(SourceLanguage::Auto, "en", [2, 0]).unwrap();
        assert_eq!(job.columns.iter().copied().collect::<Vec<_>>(), vec![0, 2]);
        assert!(job.validate(3).is_ok());
        assert!(job.validate(2).is_err());
    }

    #[test]
    fn test_analysis_context_wire_shape() {
        let context: AnalysisContext = serde_json::from_str(
            r#"{"domain":"retail","style":"casual","preserveTerms":["SKU"],"notes":""}"#,
        )
        .unwrap();
        assert_eq!(context.preserve_terms, vec!["SKU".to_string()]);

        let partial: AnalysisContext = serde_json::from_str(r#"{"domain":"retail"}"#).unwrap();
        assert!(partial.preserve_terms.is_empty());
    }
}
