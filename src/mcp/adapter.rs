//! MCP 适配器与管理器
//!
//! 适配器把远端目录条目注册为本地工具：本地名 = 前缀 + 远端名，
//! 参数 schema 直接沿用远端 inputSchema，执行转发给客户端。
//! 管理器持有多个具名客户端，统一 connect / disconnect 并驱动注册。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::{ClientStatus, McpClient, McpError};
use crate::tools::{Tool, ToolError, ToolRegistry};

const DEFAULT_PREFIX: &str = "mcp_";

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// 本地工具名前缀；线上调用仍用未加前缀的远端名
    pub prefix: String,
    /// 非空时前置到每个工具描述
    pub description: String,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            description: String::new(),
        }
    }
}

/// 包装单个远端工具的本地 Tool
struct McpProxyTool {
    local_name: String,
    remote_name: String,
    description: String,
    schema: Value,
    client: Arc<McpClient>,
}

#[async_trait]
impl Tool for McpProxyTool {
    fn name(&self) -> &str {
        &self.local_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, _cancel: CancellationToken, args: &Value) -> Result<String, ToolError> {
        let call = self
            .client
            .execute_tool(&self.remote_name, args.clone())
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        if !call.error.is_empty() {
            return Err(ToolError::ExecutionFailed(call.error));
        }
        Ok(call.result)
    }
}

pub struct McpAdapter {
    client: Arc<McpClient>,
    config: AdapterConfig,
    registry: Arc<ToolRegistry>,
}

impl McpAdapter {
    pub fn new(client: Arc<McpClient>, config: AdapterConfig, registry: Arc<ToolRegistry>) -> Self {
        let config = if config.prefix.is_empty() {
            AdapterConfig {
                prefix: DEFAULT_PREFIX.to_string(),
                ..config
            }
        } else {
            config
        };
        Self { client, config, registry }
    }

    /// 把客户端目录中的全部工具注册为本地工具
    pub async fn register_tools(&self) -> Result<(), McpError> {
        for tool in self.client.tools().await {
            let local_name = format!("{}{}", self.config.prefix, tool.name);
            let description = if self.config.description.is_empty() {
                tool.description.clone()
            } else {
                format!("{}: {}", self.config.description, tool.description)
            };

            let proxy = McpProxyTool {
                local_name: local_name.clone(),
                remote_name: tool.name.clone(),
                description,
                schema: tool.input_schema.clone(),
                client: Arc::clone(&self.client),
            };

            if let Err(e) = self.registry.register(Arc::new(proxy)).await {
                tracing::warn!(tool = %local_name, error = %e, "failed to register mcp tool");
            }
        }
        Ok(())
    }

    /// 注销本适配器注册过的全部本地工具
    pub async fn unregister_tools(&self) {
        for tool in self.client.tools().await {
            self.registry
                .unregister(&format!("{}{}", self.config.prefix, tool.name))
                .await;
        }
    }

    pub async fn refresh_tools(&self) -> Result<(), McpError> {
        self.unregister_tools().await;
        self.register_tools().await
    }

    pub fn client(&self) -> &Arc<McpClient> {
        &self.client
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }
}

/// 多客户端管理器
pub struct McpManager {
    clients: RwLock<HashMap<String, Arc<McpClient>>>,
    adapters: RwLock<HashMap<String, Arc<McpAdapter>>>,
    registry: Arc<ToolRegistry>,
}

impl McpManager {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            adapters: RwLock::new(HashMap::new()),
            registry,
        }
    }

    pub async fn add_client(&self, client: McpClient, config: AdapterConfig) -> Result<(), McpError> {
        let name = client.config().name.clone();
        let mut clients = self.clients.write().await;
        if clients.contains_key(&name) {
            return Err(McpError::ClientExists(name));
        }

        let client = Arc::new(client);
        let adapter = Arc::new(McpAdapter::new(
            Arc::clone(&client),
            config,
            Arc::clone(&self.registry),
        ));

        clients.insert(name.clone(), client);
        self.adapters.write().await.insert(name, adapter);
        Ok(())
    }

    pub async fn remove_client(&self, name: &str) -> Result<(), McpError> {
        let adapter = self
            .adapters
            .write()
            .await
            .remove(name)
            .ok_or_else(|| McpError::ClientNotFound(name.to_string()))?;

        adapter.unregister_tools().await;
        if let Some(client) = self.clients.write().await.remove(name) {
            client.disconnect().await;
        }
        Ok(())
    }

    /// 连接指定客户端并注册其工具
    pub async fn connect_client(&self, name: &str) -> Result<(), McpError> {
        let client = self
            .clients
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| McpError::ClientNotFound(name.to_string()))?;

        client.connect().await?;

        if let Some(adapter) = self.adapters.read().await.get(name).cloned() {
            adapter.register_tools().await?;
        }
        Ok(())
    }

    pub async fn disconnect_client(&self, name: &str) -> Result<(), McpError> {
        let adapter = self
            .adapters
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| McpError::ClientNotFound(name.to_string()))?;

        adapter.unregister_tools().await;
        if let Some(client) = self.clients.read().await.get(name).cloned() {
            client.disconnect().await;
        }
        Ok(())
    }

    /// 逐个连接全部客户端；单个失败记日志不中断其余
    pub async fn connect_all(&self) {
        let names: Vec<String> = self.clients.read().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.connect_client(&name).await {
                tracing::warn!(client = %name, error = %e, "failed to connect mcp client");
            }
        }
    }

    pub async fn disconnect_all(&self) {
        let names: Vec<String> = self.clients.read().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.disconnect_client(&name).await {
                tracing::warn!(client = %name, error = %e, "failed to disconnect mcp client");
            }
        }
    }

    pub async fn get_client(&self, name: &str) -> Option<Arc<McpClient>> {
        self.clients.read().await.get(name).cloned()
    }

    pub async fn get_adapter(&self, name: &str) -> Option<Arc<McpAdapter>> {
        self.adapters.read().await.get(name).cloned()
    }

    pub async fn list_statuses(&self) -> Vec<ClientStatus> {
        let clients = self.clients.read().await;
        let mut statuses = Vec::with_capacity(clients.len());
        for client in clients.values() {
            statuses.push(client.status().await);
        }
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub async fn close(&self) {
        self.disconnect_all().await;
    }
}
