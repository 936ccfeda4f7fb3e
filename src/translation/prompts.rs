use crate::csv_processor::Row;
use crate::translation::{AnalysisContext, BatchRequest, SourceLanguage};

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "[]".to_string())
}

pub fn build_analysis_prompt(headers: &[String], sample_rows: &[Row]) -> String {
    let mut prompt = String::new();

    prompt.push_str("Analyze this spreadsheet data to help with translation.\n\n");
    prompt.push_str("## Column Headers\n");
    prompt.push_str(&to_json(headers));
    prompt.push_str(&format!(
        "\n\n## Sample Rows (first {} rows)\n",
        sample_rows.len()
    ));
    prompt.push_str(&to_json(sample_rows));
    prompt.push_str("\n\n## Task\nProvide a JSON response with:\n");
    prompt.push_str(
        r#"{
  "domain": "brief description of what this data is about",
  "style": "the writing style used (formal, casual, technical, etc.)",
  "preserveTerms": ["list", "of", "terms", "to", "keep", "unchanged"],
  "notes": "any other translation considerations"
}"#,
    );
    prompt.push_str("\n\nRespond with ONLY the JSON object, no markdown formatting.");

    prompt
}

fn context_section(context: &AnalysisContext) -> String {
    format!(
        "## Context\nDomain: {}\nStyle: {}\nKeep unchanged: {}\nNotes: {}\n\n",
        context.domain,
        context.style,
        context.preserve_terms.join(", "),
        context.notes
    )
}

pub fn build_translation_prompt(request: &BatchRequest<'_>) -> String {
    let source = match request.source_lang {
        SourceLanguage::Auto => "the source language".to_string(),
        SourceLanguage::Tag(tag) => tag.clone(),
    };

    let mut prompt = format!(
        "Translate spreadsheet data from {} to {}.\n\n",
        source, request.target_lang
    );

    if let Some(context) = request.context {
        prompt.push_str(&context_section(context));
    }

    prompt.push_str("## Column Structure\n");
    for (idx, header) in request.headers.iter().enumerate() {
        let marker = if request.columns.contains(&idx) {
            "[TRANSLATE]"
        } else {
            "[KEEP AS-IS]"
        };
        prompt.push_str(&format!("  {}: \"{}\" {}\n", idx, header, marker));
    }

    prompt.push_str(&format!(
        "\n## Data to Translate ({} rows)\n",
        request.rows.len()
    ));
    prompt.push_str(&to_json(request.rows));

    prompt.push_str("\n\n## Instructions\n");
    prompt.push_str("1. Translate ONLY the values in columns with [TRANSLATE] markers\n");
    prompt.push_str("2. Keep all other columns exactly as-is (no modifications)\n");
    prompt.push_str(
        "3. Preserve numbers, dates, codes, and terms marked as \"keep unchanged\"\n",
    );
    prompt.push_str(&format!(
        "4. Maintain the exact array structure: {} rows of {} columns\n",
        request.rows.len(),
        request.headers.len()
    ));
    prompt.push_str("5. Each translated row must be a valid array with the same column count\n\n");
    prompt.push_str("Respond with ONLY a JSON array of arrays (same structure as input), no markdown formatting or explanation.");

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_translation_prompt_marks_columns() {
        let rows = vec![vec!["1".to_string(), "Xin chào".to_string()]];
        let headers = vec!["id".to_string(), "greeting".to_string()];
        let columns = BTreeSet::from([1]);
        let context = AnalysisContext {
            domain: "greetings".to_string(),
            style: "casual".to_string(),
            preserve_terms: vec!["ACME".to_string(), "SKU".to_string()],
            notes: String::new(),
        };

        let prompt = build_translation_prompt(&BatchRequest {
            batch_index: 0,
            rows: &rows,
            headers: &headers,
            columns: &columns,
            context: Some(&context),
            source_lang: &SourceLanguage::Auto,
            target_lang: "en",
        });

        assert!(prompt.starts_with("Translate spreadsheet data from the source language to en."));
        assert!(prompt.contains("  0: \"id\" [KEEP AS-IS]"));
        assert!(prompt.contains("  1: \"greeting\" [TRANSLATE]"));
        assert!(prompt.contains("Keep unchanged: ACME, SKU"));
        assert!(prompt.contains(r#"[["1","Xin chào"]]"#));
        assert!(prompt.contains("1 rows of 2 columns"));
    }

    #[test]
    fn test_translation_prompt_without_context() {
        let rows = vec![vec!["a".to_string()]];
        let headers = vec!["text".to_string()];
        let columns = BTreeSet::from([0]);

        let prompt = build_translation_prompt(&BatchRequest {
            batch_index: 0,
            rows: &rows,
            headers: &headers,
            columns: &columns,
            context: None,
            source_lang: &SourceLanguage::Tag("vi".to_string()),
            target_lang: "ja",
        });

        assert!(prompt.starts_with("Translate spreadsheet data from vi to ja."));
        assert!(!prompt.contains("## Context"));
    }

    #[test]
    fn test_analysis_prompt_lists_sample() {
        let prompt = build_analysis_prompt(
            &["name".to_string()],
            &[vec!["Bánh mì".to_string()], vec!["Phở".to_string()]],
        );
        assert!(prompt.contains(r#"["name"]"#));
        assert!(prompt.contains("first 2 rows"));
        assert!(prompt.contains("preserveTerms"));
    }
}
