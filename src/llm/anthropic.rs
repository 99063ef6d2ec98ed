//! Anthropic Messages API 提供方
//!
//! POST /v1/messages，x-api-key 鉴权；system 消息拆出放入顶层 system 字段。

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{
    handle_http_error, ChunkStream, CompletionRequest, CompletionResponse, LlmError, LlmProvider, Role, Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub timeout: Duration,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "claude-sonnet-4-5".to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: None,
            timeout: Duration::from_secs(60),
        }
    }
}

pub struct AnthropicProvider {
    config: AnthropicConfig,
    client: Client,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ApiMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: ApiUsage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    /// system 消息合并为顶层 system 字段，其余进 messages
    fn build_request<'a>(&'a self, req: &'a CompletionRequest, stream: bool) -> ApiRequest<'a> {
        let mut system = None;
        let mut messages = Vec::with_capacity(req.messages.len());
        for msg in &req.messages {
            if msg.role == Role::System {
                system = Some(msg.content.as_str());
            } else {
                messages.push(ApiMessage {
                    role: msg.role.as_str(),
                    content: &msg.content,
                });
            }
        }

        let model = if req.model.is_empty() { &self.config.model } else { &req.model };

        ApiRequest {
            model,
            max_tokens: req.max_tokens.unwrap_or(self.config.max_tokens),
            messages,
            system,
            temperature: req.temperature.or(self.config.temperature),
            stream,
        }
    }

    async fn send(&self, req: &CompletionRequest, stream: bool) -> Result<reqwest::Response, LlmError> {
        let body = self.build_request(req, stream);

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.config.base_url))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Connection(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(handle_http_error(status.as_u16(), &body));
        }
        Ok(resp)
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn complete(&self, req: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let resp = self.send(req, false).await?;

        let parsed: ApiResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Api(format!("failed to decode response: {}", e)))?;

        let content = parsed
            .content
            .iter()
            .find(|b| b.kind == "text")
            .map(|b| b.text.clone())
            .unwrap_or_default();

        Ok(CompletionResponse {
            content,
            usage: Usage {
                prompt_tokens: parsed.usage.input_tokens,
                completion_tokens: parsed.usage.output_tokens,
                total_tokens: parsed.usage.input_tokens + parsed.usage.output_tokens,
            },
        })
    }

    async fn complete_stream(&self, req: &CompletionRequest) -> Result<ChunkStream, LlmError> {
        let resp = self.send(req, true).await?;

        // SSE 行流：仅提取 content_block_delta 的 text
        let stream = resp.bytes_stream().filter_map(|chunk| async move {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => return Some(Err(LlmError::Connection(e.to_string()))),
            };
            let text = String::from_utf8_lossy(&chunk);
            let mut out = String::new();
            for line in text.lines() {
                let Some(data) = line.strip_prefix("data: ") else { continue };
                let Ok(event) = serde_json::from_str::<serde_json::Value>(data) else { continue };
                if event.get("type").and_then(|t| t.as_str()) == Some("content_block_delta") {
                    if let Some(t) = event
                        .get("delta")
                        .and_then(|d| d.get("text"))
                        .and_then(|t| t.as_str())
                    {
                        out.push_str(t);
                    }
                }
            }
            if out.is_empty() {
                None
            } else {
                Some(Ok(out))
            }
        });

        Ok(Box::pin(stream))
    }

    fn model(&self) -> String {
        self.config.model.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatMessage;

    #[test]
    fn test_system_message_lifted() {
        let provider = AnthropicProvider::new(AnthropicConfig::default());
        let req = CompletionRequest {
            messages: vec![
                ChatMessage::system("be brief"),
                ChatMessage::user("hi"),
                ChatMessage::assistant("hello"),
            ],
            ..Default::default()
        };

        let api_req = provider.build_request(&req, false);
        assert_eq!(api_req.system, Some("be brief"));
        assert_eq!(api_req.messages.len(), 2);
        assert_eq!(api_req.messages[0].role, "user");
    }

    #[test]
    fn test_request_model_overrides_config() {
        let provider = AnthropicProvider::new(AnthropicConfig {
            model: "claude-a".to_string(),
            ..Default::default()
        });

        let req = CompletionRequest {
            model: "claude-b".to_string(),
            ..Default::default()
        };
        assert_eq!(provider.build_request(&req, false).model, "claude-b");

        let req = CompletionRequest::default();
        assert_eq!(provider.build_request(&req, false).model, "claude-a");
    }
}
