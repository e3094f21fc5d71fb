use std::time::Duration;

use serde_json::Value as JsonValue;

use crate::Result;

const DEFAULT_MAX_RESULTS: usize = 5;
const RESULT_CAP: usize = 10;

/// Thin adapter over the DuckDuckGo instant-answer JSON API. Only runs when
/// the user enabled internet access in settings; the handler enforces that.
pub struct SearchClient {
    http: reqwest::Client,
    base_url: String,
}

impl Default for SearchClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchClient {
    pub fn new() -> Self {
        Self::with_base_url("https://api.duckduckgo.com")
    }

    /// Tests point this at a mock server.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    /// Fetches at most `max_results` (clamped to [1, 10], default 5) results
    /// and renders them as the text block the prompt builder embeds.
    pub async fn search_web(&self, query: &str, max_results: Option<usize>) -> Result<String> {
        let limit = max_results.unwrap_or(DEFAULT_MAX_RESULTS).clamp(1, RESULT_CAP);
        let url = format!("{}/", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .get(url)
            .query(&[("q", query), ("format", "json"), ("no_html", "1")])
            .send()
            .await?
            .error_for_status()?;
        let body: JsonValue = response.json().await?;

        let mut results: Vec<(String, String, String)> = Vec::new();
        if let Some(heading) = body.get("Heading").and_then(JsonValue::as_str)
            && let Some(abstract_text) = body.get("AbstractText").and_then(JsonValue::as_str)
            && !abstract_text.is_empty()
        {
            let link = body
                .get("AbstractURL")
                .and_then(JsonValue::as_str)
                .unwrap_or("");
            results.push((heading.to_string(), link.to_string(), abstract_text.to_string()));
        }
        if let Some(topics) = body.get("RelatedTopics").and_then(JsonValue::as_array) {
            for topic in topics {
                if results.len() >= limit {
                    break;
                }
                let Some(text) = topic.get("Text").and_then(JsonValue::as_str) else {
                    continue;
                };
                let link = topic
                    .get("FirstURL")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("");
                let title = text.split(" - ").next().unwrap_or(text);
                results.push((title.to_string(), link.to_string(), text.to_string()));
            }
        }
        results.truncate(limit);

        if results.is_empty() {
            return Ok("No web results found.".to_string());
        }
        let mut out = String::from("--- WEB RESULTS ---\n");
        for (title, link, snippet) in results {
            out.push_str(&format!("Title: {title}\nLink: {link}\nSnippet: {snippet}\n\n"));
        }
        Ok(out)
    }
}
