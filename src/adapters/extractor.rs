//! Recommendation extraction: turning an investigation report into
//! categorized, actionable items with a local LLM.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{RecommendationCategory, RecommendationResult};
use crate::util::{extract_json_object, truncate_chars};

#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub text: String,
    pub max_length: usize,
    /// Where the text came from (`summary` or `events`).
    pub source: String,
}

#[async_trait]
pub trait RecommendationExtractor: Send + Sync {
    async fn is_available(&self) -> bool;

    /// An `Err` is an infrastructure failure (retryable). A model answer
    /// that cannot be parsed comes back as `success = false`.
    async fn extract(&self, request: &ExtractionRequest) -> Result<RecommendationResult>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

pub struct OllamaExtractor {
    client: reqwest::Client,
    config: OllamaConfig,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    format: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

impl OllamaExtractor {
    pub fn new(config: OllamaConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl RecommendationExtractor for OllamaExtractor {
    async fn is_available(&self) -> bool {
        match self
            .client
            .get(self.url("/api/tags"))
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "Extractor not reachable");
                false
            }
        }
    }

    async fn extract(&self, request: &ExtractionRequest) -> Result<RecommendationResult> {
        let text = truncate_chars(&request.text, request.max_length);
        let body = GenerateRequest {
            model: &self.config.model,
            prompt: build_prompt(text),
            stream: false,
            format: "json",
        };
        let resp: GenerateResponse = self
            .client
            .post(self.url("/api/generate"))
            .json(&body)
            .send()
            .await
            .context("Failed to send extraction request")?
            .error_for_status()
            .context("Extractor returned error status")?
            .json()
            .await
            .context("Failed to parse extractor response")?;

        Ok(parse_recommendations(&resp.response, &request.source))
    }
}

pub fn build_prompt(text: &str) -> String {
    format!(
        "Extract the actionable recommendations from the investigation report below.\n\
         Respond with JSON only, shaped as \
         {{\"categories\": [{{\"name\": \"<category>\", \"recommendations\": [\"<item>\", ...]}}]}}.\n\
         Use short category names such as \"prompt\", \"tooling\", \"configuration\" or \"code\".\n\
         If there are no recommendations, return {{\"categories\": []}}.\n\n\
         REPORT:\n{}",
        text
    )
}

/// Parse a model answer into categories.
///
/// Accepts `{"categories": [{"name", "recommendations"|"items"}]}` or a plain
/// object mapping category names to lists.
pub fn parse_recommendations(raw: &str, source: &str) -> RecommendationResult {
    let failed = |error: String| RecommendationResult {
        success: false,
        categories: Vec::new(),
        raw_text: raw.to_string(),
        extracted_from: source.to_string(),
        error: Some(error),
    };

    let Some(json) = extract_json_object(raw) else {
        return failed("no JSON object in extractor output".to_string());
    };
    let value: Value = match serde_json::from_str(&json) {
        Ok(v) => v,
        Err(e) => return failed(format!("invalid JSON from extractor: {}", e)),
    };

    let categories: Vec<RecommendationCategory> = match value.get("categories") {
        Some(Value::Array(items)) => items.iter().filter_map(category_from_entry).collect(),
        Some(_) => return failed("`categories` is not a list".to_string()),
        None => match value.as_object() {
            Some(map) => map
                .iter()
                .filter_map(|(name, items)| {
                    string_list(items).map(|items| RecommendationCategory {
                        name: name.clone(),
                        items,
                    })
                })
                .collect(),
            None => Vec::new(),
        },
    };

    RecommendationResult {
        success: true,
        categories: categories
            .into_iter()
            .filter(|c| !c.items.is_empty())
            .collect(),
        raw_text: raw.to_string(),
        extracted_from: source.to_string(),
        error: None,
    }
}

fn category_from_entry(entry: &Value) -> Option<RecommendationCategory> {
    let name = entry.get("name").and_then(Value::as_str)?.trim();
    if name.is_empty() {
        return None;
    }
    let items = entry
        .get("recommendations")
        .or_else(|| entry.get("items"))
        .and_then(string_list)
        .unwrap_or_default();
    Some(RecommendationCategory {
        name: name.to_string(),
        items,
    })
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    let items = value.as_array()?;
    Some(
        items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Object(o) => o
                    .get("text")
                    .or_else(|| o.get("description"))
                    .and_then(Value::as_str)
                    .map(|s| s.trim().to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect(),
    )
}
