//! 工具系统
//!
//! 所有工具实现 Tool trait（name / description / parameters / execute），
//! 由 ToolRegistry 按名注册与查找；ToolExecutor 统一执行并产出 ToolCall 记录，
//! 单个工具失败写入记录的 error 字段而不中断批次。

mod builtin;
mod file;
mod memory;
mod search;

pub use builtin::{CalculateTool, EchoTool, GetTimeTool};
pub use file::{file_tools, DeleteFileTool, FileExistsTool, ListDirTool, ReadFileTool, WriteFileTool};
pub use memory::{memory_tools, DailyNoteAddTool, DailyNoteGetTool, MemoryAddTool, MemorySearchTool};
pub use search::{BraveSearchClient, SearchConfig, WebSearchTool};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// 工具错误：code() 对应稳定的错误码，供日志与上游判断
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("directory not found: {0}")]
    DirNotFound(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("delete failed: {0}")]
    DeleteFailed(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("tool '{0}' not found")]
    ToolNotFound(String),
    #[error("tool '{0}' already registered")]
    DuplicateTool(String),
    #[error("tool name cannot be empty")]
    InvalidName,
}

impl ToolError {
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::InvalidParam(_) => "INVALID_PARAM",
            ToolError::InvalidPath(_) => "INVALID_PATH",
            ToolError::FileNotFound(_) => "FILE_NOT_FOUND",
            ToolError::DirNotFound(_) => "DIR_NOT_FOUND",
            ToolError::NotADirectory(_) => "NOT_A_DIRECTORY",
            ToolError::WriteFailed(_) => "WRITE_FAILED",
            ToolError::DeleteFailed(_) => "DELETE_FAILED",
            ToolError::ExecutionFailed(_) => "EXECUTION_FAILED",
            ToolError::ToolNotFound(_) => "TOOL_NOT_FOUND",
            ToolError::DuplicateTool(_) => "DUPLICATE_TOOL",
            ToolError::InvalidName => "INVALID_NAME",
        }
    }
}

/// 工具 trait：名称、描述、JSON Schema 参数说明、异步执行
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> Value;
    async fn execute(&self, cancel: CancellationToken, args: &Value) -> Result<String, ToolError>;
}

/// 单次工具调用记录：错误写入 error 字段而非抛出
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// 工具目录条目，供上下文构建器生成 Available Tools 段落
#[derive(Debug, Clone, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 工具注册表：名称唯一
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；空名返回 InvalidName，重名返回 DuplicateTool
    pub async fn register(&self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        if name.is_empty() {
            return Err(ToolError::InvalidName);
        }
        let mut tools = self.tools.write().await;
        if tools.contains_key(&name) {
            return Err(ToolError::DuplicateTool(name));
        }
        tools.insert(name, tool);
        Ok(())
    }

    pub async fn unregister(&self, name: &str) {
        self.tools.write().await.remove(name);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// 平铺工具目录（名称排序，保证 prompt 稳定）
    pub async fn schemas(&self) -> Vec<ToolSchema> {
        let tools = self.tools.read().await;
        let mut schemas: Vec<ToolSchema> = tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn count(&self) -> usize {
        self.tools.read().await.len()
    }
}

/// 工具执行器：查注册表并执行，产出 ToolCall 记录
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 执行指定工具；注册表未命中返回 ToolNotFound，
    /// 工具自身的失败写入返回记录的 error 字段（保留批次内后续调用的机会）
    pub async fn execute(
        &self,
        cancel: CancellationToken,
        name: &str,
        args: Value,
    ) -> Result<ToolCall, ToolError> {
        let tool = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| ToolError::ToolNotFound(name.to_string()))?;

        let mut call = ToolCall {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            input: args.clone(),
            ..Default::default()
        };

        let start = Instant::now();
        match tool.execute(cancel, &args).await {
            Ok(result) => call.result = result,
            Err(e) => {
                tracing::warn!(tool = name, code = e.code(), error = %e, "tool execution failed");
                call.error = e.to_string();
            }
        }
        call.duration_ms = Some(start.elapsed().as_millis() as u64);

        tracing::debug!(
            tool = name,
            ok = call.error.is_empty(),
            duration_ms = call.duration_ms,
            "tool executed"
        );
        Ok(call)
    }

    pub async fn schemas(&self) -> Vec<ToolSchema> {
        self.registry.schemas().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FailTool;

    #[async_trait]
    impl Tool for FailTool {
        fn name(&self) -> &str {
            "fail"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _cancel: CancellationToken, _args: &Value) -> Result<String, ToolError> {
            Err(ToolError::ExecutionFailed("nope".to_string()))
        }
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await.unwrap();
        let err = registry.register(Arc::new(EchoTool)).await.unwrap_err();
        assert!(matches!(err, ToolError::DuplicateTool(_)));
    }

    #[tokio::test]
    async fn test_executor_unknown_tool() {
        let registry = Arc::new(ToolRegistry::new());
        let executor = ToolExecutor::new(registry);
        let err = executor
            .execute(CancellationToken::new(), "ghost", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn test_failure_captured_in_record() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(FailTool)).await.unwrap();
        registry.register(Arc::new(EchoTool)).await.unwrap();
        let executor = ToolExecutor::new(registry);

        // 失败调用产出带 error 的记录，后续调用不受影响
        let call = executor
            .execute(CancellationToken::new(), "fail", json!({}))
            .await
            .unwrap();
        assert!(call.result.is_empty());
        assert!(call.error.contains("nope"));

        let call = executor
            .execute(CancellationToken::new(), "echo", json!({"message": "ok"}))
            .await
            .unwrap();
        assert_eq!(call.result, "Echo: ok");
        assert!(call.error.is_empty());
    }
}
