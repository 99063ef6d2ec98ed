//! MCP 客户端：连接生命周期与远端工具目录缓存
//!
//! connect：initialize 握手成功后拉取 tools/list 填充目录；任一步失败回滚到
//! 未连接状态。disconnect 幂等，清空目录。

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{JsonRpcProtocol, McpError, McpTool};
use crate::tools::ToolCall;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ClientConfig {
    pub name: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connected,
}

#[derive(Debug, Clone)]
pub struct ClientStatus {
    pub name: String,
    pub state: ClientState,
    pub tool_count: usize,
}

struct ClientInner {
    protocol: Option<Arc<JsonRpcProtocol>>,
    tools: HashMap<String, McpTool>,
}

pub struct McpClient {
    config: ClientConfig,
    inner: RwLock<ClientInner>,
}

impl McpClient {
    pub fn new(config: ClientConfig) -> Result<Self, McpError> {
        if config.name.is_empty() {
            return Err(McpError::EmptyName);
        }
        Ok(Self {
            config,
            inner: RwLock::new(ClientInner {
                protocol: None,
                tools: HashMap::new(),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// 建立连接并缓存远端工具目录；失败回滚为未连接
    pub async fn connect(&self) -> Result<(), McpError> {
        let mut inner = self.inner.write().await;
        if inner.protocol.is_some() {
            return Err(McpError::AlreadyConnected);
        }

        let protocol = Arc::new(JsonRpcProtocol::new(&self.config)?);
        protocol.connect().await?;

        let tools = match protocol.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                // 握手成功但目录拉取失败：不保留半连接状态
                return Err(e);
            }
        };

        inner.tools = tools.into_iter().map(|t| (t.name.clone(), t)).collect();
        inner.protocol = Some(protocol);
        tracing::info!(client = %self.config.name, tools = inner.tools.len(), "mcp client connected");
        Ok(())
    }

    /// 幂等断开，清空目录
    pub async fn disconnect(&self) {
        let mut inner = self.inner.write().await;
        inner.protocol = None;
        inner.tools.clear();
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.read().await.protocol.is_some()
    }

    pub async fn status(&self) -> ClientStatus {
        let inner = self.inner.read().await;
        ClientStatus {
            name: self.config.name.clone(),
            state: if inner.protocol.is_some() {
                ClientState::Connected
            } else {
                ClientState::Disconnected
            },
            tool_count: inner.tools.len(),
        }
    }

    /// 目录快照（按名称排序）
    pub async fn tools(&self) -> Vec<McpTool> {
        let inner = self.inner.read().await;
        let mut tools: Vec<McpTool> = inner.tools.values().cloned().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub async fn get_tool(&self, name: &str) -> Option<McpTool> {
        self.inner.read().await.tools.get(name).cloned()
    }

    /// 以线上（未加前缀的）名称调用远端工具
    pub async fn execute_tool(&self, name: &str, arguments: Value) -> Result<ToolCall, McpError> {
        let protocol = {
            let inner = self.inner.read().await;
            if !inner.tools.contains_key(name) {
                return Err(McpError::ToolNotFound(name.to_string()));
            }
            inner.protocol.clone().ok_or(McpError::NotConnected)?
        };
        protocol.call_tool(name, arguments).await
    }

    async fn protocol(&self) -> Result<Arc<JsonRpcProtocol>, McpError> {
        self.inner
            .read()
            .await
            .protocol
            .clone()
            .ok_or(McpError::NotConnected)
    }

    pub async fn list_resources(&self) -> Result<Vec<Value>, McpError> {
        self.protocol().await?.list_resources().await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<String, McpError> {
        self.protocol().await?.read_resource(uri).await
    }

    pub async fn list_prompts(&self) -> Result<Vec<Value>, McpError> {
        self.protocol().await?.list_prompts().await
    }

    pub async fn get_prompt(&self, name: &str, arguments: Value) -> Result<String, McpError> {
        self.protocol().await?.get_prompt(name, arguments).await
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<(), McpError> {
        self.protocol().await?.notify(method, params).await
    }

    /// 诊断用摘要（日志 / 状态接口）
    pub async fn summary(&self) -> Value {
        let inner = self.inner.read().await;
        serde_json::json!({
            "name": self.config.name,
            "endpoint": self.config.endpoint,
            "connected": inner.protocol.is_some(),
            "tool_count": inner.tools.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_required() {
        assert!(matches!(
            McpClient::new(ClientConfig::default()),
            Err(McpError::EmptyName)
        ));
    }

    #[tokio::test]
    async fn test_disconnected_operations_fail() {
        let client = McpClient::new(ClientConfig {
            name: "c".to_string(),
            endpoint: "http://localhost:1".to_string(),
            ..Default::default()
        })
        .unwrap();

        assert!(!client.is_connected().await);
        assert!(matches!(
            client.list_resources().await,
            Err(McpError::NotConnected)
        ));
        assert!(matches!(
            client.execute_tool("ping", serde_json::json!({})).await,
            Err(McpError::ToolNotFound(_))
        ));

        // disconnect 幂等
        client.disconnect().await;
        client.disconnect().await;
    }
}
