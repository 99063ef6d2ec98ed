//! Web 搜索工具：封装 Brave Search API
//!
//! GET /res/v1/web/search，X-Subscription-Token 鉴权；结果条数 1-20。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::tools::{Tool, ToolError};

const DEFAULT_BASE_URL: &str = "https://api.search.brave.com/res/v1/web/search";
const DEFAULT_MAX_RESULTS: usize = 10;

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub api_key: String,
    pub base_url: String,
    pub max_results: usize,
    pub timeout: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            max_results: DEFAULT_MAX_RESULTS,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchResult {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, rename = "description")]
    pub snippet: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    web: WebResults,
}

#[derive(Debug, Default, Deserialize)]
struct WebResults {
    #[serde(default)]
    results: Vec<SearchResult>,
}

/// Brave Search HTTP 客户端
pub struct BraveSearchClient {
    config: SearchConfig,
    client: Client,
}

impl BraveSearchClient {
    pub fn new(config: SearchConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    pub async fn search(&self, query: &str, count: usize) -> Result<Vec<SearchResult>, String> {
        let count = count.clamp(1, 20);

        let resp = self
            .client
            .get(&self.config.base_url)
            .query(&[("q", query), ("count", &count.to_string())])
            .header("Accept", "application/json")
            .header("X-Subscription-Token", &self.config.api_key)
            .send()
            .await
            .map_err(|e| format!("failed to perform search: {}", e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(format!("search failed with status {}: {}", status.as_u16(), body));
        }

        let parsed: SearchResponse = resp
            .json()
            .await
            .map_err(|e| format!("failed to decode response: {}", e))?;
        Ok(parsed.web.results)
    }
}

/// web_search：面向 LLM 的搜索工具
pub struct WebSearchTool {
    client: Arc<BraveSearchClient>,
}

impl WebSearchTool {
    pub fn new(client: Arc<BraveSearchClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for information using Brave Search API"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                },
                "count": {
                    "type": "integer",
                    "description": "Number of results to return (1-20, default 10)",
                    "default": 10,
                    "minimum": 1,
                    "maximum": 20
                }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, _cancel: CancellationToken, args: &Value) -> Result<String, ToolError> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ToolError::InvalidParam("query must be a non-empty string".to_string()))?;

        let count = args
            .get("count")
            .and_then(|v| v.as_u64())
            .map(|c| c as usize)
            .unwrap_or(DEFAULT_MAX_RESULTS);

        tracing::info!(query = %query, count, "web search");

        let results = self
            .client
            .search(query, count)
            .await
            .map_err(ToolError::ExecutionFailed)?;

        if results.is_empty() {
            return Ok("No search results found".to_string());
        }

        let mut output = format!("Found {} search results for '{}':\n\n", results.len(), query);
        for (i, result) in results.iter().enumerate() {
            output.push_str(&format!(
                "{}. {}\n   URL: {}\n   {}\n\n",
                i + 1,
                result.title,
                result.url,
                result.snippet
            ));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parsing() {
        let body = r#"{"query":{"original":"rust"},"web":{"results":[
            {"title":"Rust","url":"https://rust-lang.org","description":"A language"}
        ]}}"#;
        let parsed: SearchResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.web.results.len(), 1);
        assert_eq!(parsed.web.results[0].title, "Rust");
        assert_eq!(parsed.web.results[0].snippet, "A language");
    }

    #[test]
    fn test_missing_web_section_is_empty() {
        let parsed: SearchResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.web.results.is_empty());
    }
}
