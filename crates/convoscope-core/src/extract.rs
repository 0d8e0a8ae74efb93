//! **Extraction**: turn a user's combined transcript into candidate items.
//!
//! Implement `ExtractionEngine` for any inference backend. Two engines ship here: a matcher over
//! the user's uploaded custom data, and an HTTP engine that delegates to a remote service.

use crate::error::{PipelineError, PipelineResult};
use crate::store::CustomDataStore;
use crate::types::ExtractionResult;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// Backend producing candidate items from text. Calls may be slow; the cycle does not time
/// them out.
#[async_trait]
pub trait ExtractionEngine: Send + Sync {
    async fn extract(&self, user_id: &str, text: &str) -> PipelineResult<Vec<ExtractionResult>>;
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Case-insensitive whole-name pattern. `\b` only works next to a word character, so a name
/// that starts or ends with a symbol (`C++`, `.NET`) is bounded by a non-word char or the end
/// of the text instead.
fn name_pattern(name: &str) -> String {
    let start = match name.chars().next() {
        Some(c) if is_word_char(c) => r"\b",
        _ => r"(?:^|\W)",
    };
    let end = match name.chars().last() {
        Some(c) if is_word_char(c) => r"\b",
        _ => r"(?:\W|$)",
    };
    format!("(?i){}{}{}", start, regex::escape(name), end)
}

/// Emits one candidate per custom-data entry whose name occurs in the text
/// (case-insensitive, on word boundaries), in upload order.
pub struct CustomDataExtractor {
    store: Arc<dyn CustomDataStore>,
}

impl CustomDataExtractor {
    pub fn new(store: Arc<dyn CustomDataStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ExtractionEngine for CustomDataExtractor {
    async fn extract(&self, user_id: &str, text: &str) -> PipelineResult<Vec<ExtractionResult>> {
        let entries = self.store.custom_data(user_id)?;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for entry in entries {
            let name = entry.name.trim();
            if name.is_empty() || !seen.insert(name.to_lowercase()) {
                continue;
            }
            let re = regex::Regex::new(&name_pattern(name))
                .map_err(|e| PipelineError::upstream("extraction", user_id, e))?;
            if !re.is_match(text) {
                continue;
            }
            let mut result = ExtractionResult::new(name)
                .with_field("description", entry.description.clone());
            if let Some(url) = entry.url.as_ref().filter(|u| !u.trim().is_empty()) {
                result = result.with_field("url", url.clone());
            }
            out.push(result);
        }
        Ok(out)
    }
}

/// Remote extraction: POST `{"userId", "text"}` to `url`, expect a JSON array of
/// `{"name": ..., ...}` objects. No request timeout is set.
#[derive(Debug, Clone)]
pub struct HttpExtractionEngine {
    url: String,
    client: reqwest::Client,
}

impl HttpExtractionEngine {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ExtractionEngine for HttpExtractionEngine {
    async fn extract(&self, user_id: &str, text: &str) -> PipelineResult<Vec<ExtractionResult>> {
        let res = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "userId": user_id, "text": text }))
            .send()
            .await
            .map_err(|e| PipelineError::upstream("extraction", user_id, e))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(PipelineError::upstream(
                "extraction",
                user_id,
                format!("extractor returned {}: {}", status, body),
            ));
        }
        // A `null` body means "nothing found".
        let results: Option<Vec<ExtractionResult>> = res
            .json()
            .await
            .map_err(|e| PipelineError::upstream("extraction", user_id, e))?;
        Ok(results.unwrap_or_default())
    }
}
