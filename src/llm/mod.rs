//! LLM 抽象层
//!
//! 所有后端（Anthropic / OpenAI / Mock）实现 LlmProvider：complete（非流式）、
//! complete_stream（流式 Token）。RetryProvider 统一叠加限流、重试与指标采集；
//! MultiModelManager 管理多个具名模型并对外提供统一的 complete 入口。

mod anthropic;
mod mock;
mod monitor;
mod multi;
mod openai;
mod ratelimit;
mod retry;

pub use anthropic::{AnthropicConfig, AnthropicProvider};
pub use mock::MockProvider;
pub use monitor::{Monitor, MonitorSnapshot, ProviderSnapshot};
pub use multi::{ModelConfig, MultiModelManager};
pub use openai::{OpenAiConfig, OpenAiProvider};
pub use ratelimit::RateLimiter;
pub use retry::RetryProvider;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 消息角色（与 LLM API 一致）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => Err(()),
        }
    }
}

/// 单条对话消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CompletionResponse {
    pub content: String,
    pub usage: Usage,
}

/// LLM 错误：code() 为稳定错误码；is_retryable() 决定重试策略
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("invalid API key")]
    AuthError,
    #[error("rate limit exceeded")]
    RateLimit,
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("model not found")]
    NotFound,
    #[error("context length exceeded")]
    ContextLength,
    #[error("internal server error")]
    ServerError,
    #[error("service unavailable")]
    ServiceUnavailable,
    #[error("request timeout")]
    Timeout,
    #[error("connection error: {0}")]
    Connection(String),
    #[error("API error: {0}")]
    Api(String),
}

impl LlmError {
    pub fn code(&self) -> &'static str {
        match self {
            LlmError::AuthError => "AUTH_ERROR",
            LlmError::RateLimit => "RATE_LIMIT",
            LlmError::BadRequest(_) => "BAD_REQUEST",
            LlmError::NotFound => "NOT_FOUND",
            LlmError::ContextLength => "CONTEXT_LENGTH",
            LlmError::ServerError => "SERVER_ERROR",
            LlmError::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            LlmError::Timeout => "TIMEOUT",
            LlmError::Connection(_) => "CONNECTION_ERROR",
            LlmError::Api(_) => "API_ERROR",
        }
    }

    /// 仅 rate-limit / timeout / server-error / service-unavailable 可重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimit | LlmError::Timeout | LlmError::ServerError | LlmError::ServiceUnavailable
        )
    }
}

/// 按 HTTP 状态码映射为 LlmError
pub fn handle_http_error(status: u16, body: &str) -> LlmError {
    match status {
        401 => LlmError::AuthError,
        429 => LlmError::RateLimit,
        400 => LlmError::BadRequest(body.to_string()),
        404 => LlmError::NotFound,
        413 => LlmError::ContextLength,
        500 => LlmError::ServerError,
        503 => LlmError::ServiceUnavailable,
        504 => LlmError::Timeout,
        _ => LlmError::Api(format!("HTTP error {}: {}", status, body)),
    }
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// LLM 提供方 trait：非流式完成与流式完成（返回 Token 流）
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, req: &CompletionRequest) -> Result<CompletionResponse, LlmError>;

    async fn complete_stream(&self, req: &CompletionRequest) -> Result<ChunkStream, LlmError>;

    fn model(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_error_mapping() {
        assert_eq!(handle_http_error(401, "").code(), "AUTH_ERROR");
        assert_eq!(handle_http_error(429, "").code(), "RATE_LIMIT");
        assert_eq!(handle_http_error(400, "bad").code(), "BAD_REQUEST");
        assert_eq!(handle_http_error(404, "").code(), "NOT_FOUND");
        assert_eq!(handle_http_error(413, "").code(), "CONTEXT_LENGTH");
        assert_eq!(handle_http_error(500, "").code(), "SERVER_ERROR");
        assert_eq!(handle_http_error(503, "").code(), "SERVICE_UNAVAILABLE");
        assert_eq!(handle_http_error(504, "").code(), "TIMEOUT");
        assert_eq!(handle_http_error(418, "teapot").code(), "API_ERROR");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(LlmError::RateLimit.is_retryable());
        assert!(LlmError::Timeout.is_retryable());
        assert!(LlmError::ServerError.is_retryable());
        assert!(LlmError::ServiceUnavailable.is_retryable());
        assert!(!LlmError::AuthError.is_retryable());
        assert!(!LlmError::ContextLength.is_retryable());
        assert!(!LlmError::NotFound.is_retryable());
        assert!(!LlmError::BadRequest("x".to_string()).is_retryable());
    }

    #[test]
    fn test_role_serde() {
        let msg = ChatMessage::user("hi");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""role":"user""#));
        let back: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.role, Role::User);
    }
}
