use crate::csv_processor::{estimate_tokens, Row};
use crate::translation::prompts::{build_analysis_prompt, build_translation_prompt};
use crate::translation::{AnalysisContext, BatchRequest, BatchTranslator, ContextAnalyzer};
use crate::utils::{ApiConfig, Result, TranslatorError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Chat-completions client used both for translation and for analysis.
pub struct LlmClient {
    client: Client,
    config: ApiConfig,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
    max_tokens: usize,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl LlmClient {
    pub fn new(config: ApiConfig, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            client,
            config,
            api_key: api_key.into(),
        })
    }

    /// Reads the API key from the environment variable named in `config`.
    pub fn from_config(config: &ApiConfig) -> Result<Self> {
        let api_key = config.api_key()?;
        Self::new(config.clone(), api_key)
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    async fn call_api(&self, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TranslatorError::ApiError(format!(
                "API returned {}: {}",
                status, body
            )));
        }

        let api_response: ChatResponse = response.json().await?;

        api_response
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .ok_or_else(|| TranslatorError::ApiError("No text content in response".to_string()))
    }
}

#[async_trait]
impl BatchTranslator for LlmClient {
    async fn translate_batch(&self, request: &BatchRequest<'_>) -> Result<Vec<Row>> {
        let prompt = build_translation_prompt(request);
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                batch_index = request.batch_index,
                prompt_tokens = estimate_tokens(&prompt),
                "Sending batch"
            );
        }
        let response = self.call_api(&prompt).await?;
        parse_rows_response(&response)
    }
}

#[async_trait]
impl ContextAnalyzer for LlmClient {
    async fn analyze(&self, headers: &[String], sample_rows: &[Row]) -> Result<AnalysisContext> {
        let prompt = build_analysis_prompt(headers, sample_rows);
        let response = self.call_api(&prompt).await?;
        parse_context_response(&response)
    }
}

/// Drops a surrounding Markdown code fence (with or without a language tag).
pub fn strip_code_fences(text: &str) -> &str {
    let mut body = text.trim();

    if let Some(rest) = body.strip_prefix("```") {
        body = match rest.find('\n') {
            Some(newline) => &rest[newline + 1..],
            None => rest.trim_start_matches("json"),
        };
    }
    if let Some(rest) = body.trim_end().strip_suffix("```") {
        body = rest;
    }

    body.trim()
}

/// Parses a JSON array of arrays. Scalar cells are stringified and `null`
/// becomes an empty cell; anything else is a malformed reply.
pub fn parse_rows_response(text: &str) -> Result<Vec<Row>> {
    let value: JsonValue = serde_json::from_str(strip_code_fences(text))?;

    let JsonValue::Array(rows) = value else {
        return Err(TranslatorError::MalformedResponse(
            "expected a JSON array of rows".to_string(),
        ));
    };

    rows.into_iter()
        .enumerate()
        .map(|(row_idx, row)| match row {
            JsonValue::Array(cells) => cells
                .into_iter()
                .map(|cell| match cell {
                    JsonValue::String(s) => Ok(s),
                    JsonValue::Null => Ok(String::new()),
                    JsonValue::Number(n) => Ok(n.to_string()),
                    JsonValue::Bool(b) => Ok(b.to_string()),
                    other => Err(TranslatorError::MalformedResponse(format!(
                        "row {} has a non-scalar cell: {}",
                        row_idx, other
                    ))),
                })
                .collect::<Result<Row>>(),
            other => Err(TranslatorError::MalformedResponse(format!(
                "row {} is not an array: {}",
                row_idx, other
            ))),
        })
        .collect()
}

pub fn parse_context_response(text: &str) -> Result<AnalysisContext> {
    let value: JsonValue = serde_json::from_str(strip_code_fences(text))?;
    if !value.is_object() {
        return Err(TranslatorError::MalformedResponse(
            "expected a JSON object".to_string(),
        ));
    }
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n[[\"a\"]]\n```"), "[[\"a\"]]");
        assert_eq!(strip_code_fences("```\n{}\n```\n"), "{}");
        assert_eq!(strip_code_fences("  [[\"a\"]]  "), "[[\"a\"]]");
        assert_eq!(strip_code_fences("```json[[1]]```"), "[[1]]");
    }

    #[test]
    fn test_parse_rows_stringifies_scalars() {
        let rows = parse_rows_response("```json\n[[\"Hello\", 3, null, true]]\n```").unwrap();
        assert_eq!(
            rows,
            vec![vec![
                "Hello".to_string(),
                "3".to_string(),
                String::new(),
                "true".to_string()
            ]]
        );
    }

    #[test]
    fn test_parse_rows_rejects_non_array_rows() {
        let err = parse_rows_response(r#"[["ok"], {"row": 2}]"#).unwrap_err();
        assert!(matches!(err, TranslatorError::MalformedResponse(_)));

        let err = parse_rows_response(r#"{"rows": []}"#).unwrap_err();
        assert!(matches!(err, TranslatorError::MalformedResponse(_)));
    }

    #[test]
    fn test_parse_rows_rejects_invalid_json() {
        assert!(matches!(
            parse_rows_response("Sure! Here is the translation:"),
            Err(TranslatorError::JsonError(_))
        ));
    }

    #[test]
    fn test_parse_context() {
        let context = parse_context_response(
            "```json\n{\"domain\":\"menu\",\"style\":\"casual\",\"preserveTerms\":[\"Phở\"],\"notes\":\"\"}\n```",
        )
        .unwrap();
        assert_eq!(context.domain, "menu");
        assert_eq!(context.preserve_terms, vec!["Phở".to_string()]);

        assert!(parse_context_response("[1, 2]").is_err());
    }

    #[test]
    fn test_client_builds_without_network() {
        let client = LlmClient::new(ApiConfig::default(), "test-key").unwrap();
        assert_eq!(client.model(), "deepseek-chat");
    }
}
