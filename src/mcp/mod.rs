//! MCP 远程工具集成
//!
//! 外部进程经 JSON-RPC 2.0 over HTTP POST 暴露工具 / 资源 / 提示词。
//! McpClient 管理连接生命周期与远端工具目录缓存；McpAdapter 把目录条目
//! 包装成本地 Tool 注册进 ToolRegistry；McpManager 统筹多个具名客户端。

mod adapter;
mod client;
mod protocol;

pub use adapter::{AdapterConfig, McpAdapter, McpManager};
pub use client::{ClientConfig, ClientState, ClientStatus, McpClient};
pub use protocol::{JsonRpcProtocol, McpTool};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("endpoint cannot be empty")]
    EmptyEndpoint,
    #[error("client name cannot be empty")]
    EmptyName,
    #[error("client already connected")]
    AlreadyConnected,
    #[error("client not connected")]
    NotConnected,
    #[error("client {0} not found")]
    ClientNotFound(String),
    #[error("client {0} already exists")]
    ClientExists(String),
    #[error("remote tool {0} not found")]
    ToolNotFound(String),
    #[error("request failed with status {0}")]
    HttpStatus(u16),
    #[error("request failed: {0}")]
    Request(String),
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("failed to decode response: {0}")]
    Decode(String),
}
