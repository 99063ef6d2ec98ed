//! MCP JSON-RPC 2.0 协议层
//!
//! 请求：{jsonrpc:"2.0", id, method, params}；通知省略 id。
//! HTTP 2xx 仅表示帧层成功，仍需检查 RPC 层 error 字段。
//! 请求 ID 为客户端内单调递增整数。

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ClientConfig, McpError};
use crate::tools::ToolCall;

const PROTOCOL_VERSION: &str = "2024-11-05";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// 远端工具目录条目
#[derive(Debug, Clone, Deserialize)]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

pub struct JsonRpcProtocol {
    client: Client,
    endpoint: String,
    headers: HashMap<String, String>,
    request_id: AtomicI64,
}

impl JsonRpcProtocol {
    pub fn new(config: &ClientConfig) -> Result<Self, McpError> {
        if config.endpoint.is_empty() {
            return Err(McpError::EmptyEndpoint);
        }

        let timeout = if config.timeout_secs > 0 {
            config.timeout_secs
        } else {
            DEFAULT_TIMEOUT_SECS
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .unwrap_or_default();

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            headers: config.headers.clone(),
            request_id: AtomicI64::new(0),
        })
    }

    fn next_request_id(&self) -> i64 {
        self.request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// 发送 RPC 请求并返回 result 字段
    async fn request(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": self.next_request_id(),
            "method": method,
            "params": params,
        });
        self.post(method, payload).await
    }

    async fn post(&self, method: &str, payload: Value) -> Result<Value, McpError> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json");
        for (key, value) in &self.headers {
            req = req.header(key, value);
        }

        let resp = req
            .json(&payload)
            .send()
            .await
            .map_err(|e| McpError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(McpError::HttpStatus(status.as_u16()));
        }

        let body: Value = resp.json().await.map_err(|e| McpError::Decode(e.to_string()))?;

        // 帧层成功之后检查 RPC 层 error
        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            let code = error.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string();
            return Err(McpError::Rpc { code, message });
        }

        tracing::debug!(method, "mcp request ok");
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    /// initialize 握手：协议版本 + 客户端信息
    pub async fn connect(&self) -> Result<(), McpError> {
        self.request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "clientInfo": {
                    "name": "wasp",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn list_tools(&self) -> Result<Vec<McpTool>, McpError> {
        let result = self.request("tools/list", json!({})).await?;

        let tools = result
            .get("tools")
            .cloned()
            .unwrap_or_else(|| json!([]));
        serde_json::from_value(tools).map_err(|e| McpError::Decode(e.to_string()))
    }

    /// tools/call：content 里 type=text 的块按换行拼接；isError=true 记为工具失败
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCall, McpError> {
        let mut call = ToolCall {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            input: arguments.clone(),
            ..Default::default()
        };

        let result = match self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await
        {
            Ok(r) => r,
            Err(e) => {
                call.error = e.to_string();
                return Ok(call);
            }
        };

        let texts: Vec<&str> = result
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect()
            })
            .unwrap_or_default();

        if result.get("isError").and_then(|e| e.as_bool()).unwrap_or(false) {
            call.error = texts.first().unwrap_or(&"unknown error").to_string();
        } else {
            call.result = texts.join("\n");
        }
        Ok(call)
    }

    pub async fn list_resources(&self) -> Result<Vec<Value>, McpError> {
        let result = self.request("resources/list", json!({})).await?;
        Ok(result
            .get("resources")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default())
    }

    pub async fn read_resource(&self, uri: &str) -> Result<String, McpError> {
        let result = self.request("resources/read", json!({ "uri": uri })).await?;
        result
            .get("contents")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|c| c.get("text"))
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| McpError::Decode("no content returned".to_string()))
    }

    pub async fn list_prompts(&self) -> Result<Vec<Value>, McpError> {
        let result = self.request("prompts/list", json!({})).await?;
        Ok(result
            .get("prompts")
            .and_then(|p| p.as_array())
            .cloned()
            .unwrap_or_default())
    }

    pub async fn get_prompt(&self, name: &str, arguments: Value) -> Result<String, McpError> {
        let result = self
            .request("prompts/get", json!({ "name": name, "arguments": arguments }))
            .await?;

        let text: Vec<&str> = result
            .get("messages")
            .and_then(|m| m.as_array())
            .map(|messages| {
                messages
                    .iter()
                    .filter_map(|m| m.get("content"))
                    .filter(|c| c.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .filter_map(|c| c.get("text").and_then(|t| t.as_str()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(text.join("\n"))
    }

    /// 通知：无 id、不关心 result
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), McpError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.post(method, payload).await?;
        Ok(())
    }
}
