//! 记忆工具：长期记忆追加/检索、每日笔记读写
//!
//! 全部经 MemoryStorage 接口读写，不直接触碰文件系统。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::storage::MemoryStorage;
use crate::tools::{Tool, ToolError};

fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    match args.get(key).and_then(|v| v.as_str()) {
        Some(s) if !s.is_empty() => Ok(s),
        Some(_) => Err(ToolError::InvalidParam(format!("{} cannot be empty", key))),
        None => Err(ToolError::InvalidParam(format!("{} must be a string", key))),
    }
}

fn today() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}

/// memory_add：向长期记忆追加一条带时间戳的条目
pub struct MemoryAddTool {
    storage: Arc<dyn MemoryStorage>,
}

impl MemoryAddTool {
    pub fn new(storage: Arc<dyn MemoryStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl Tool for MemoryAddTool {
    fn name(&self) -> &str {
        "memory_add"
    }

    fn description(&self) -> &str {
        "Add an entry to long-term memory. The entry is kept across conversations."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The content to remember"
                }
            },
            "required": ["content"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, _cancel: CancellationToken, args: &Value) -> Result<String, ToolError> {
        let content = require_str(args, "content")?;

        let mut memory = self
            .storage
            .get_memory()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to read memory: {}", e)))?;

        if !memory.is_empty() && !memory.ends_with('\n') {
            memory.push('\n');
        }
        memory.push_str(&format!("- [{}] {}\n", today(), content));

        self.storage
            .set_memory(&memory)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to write memory: {}", e)))?;

        Ok(format!("Remembered: {}", content))
    }
}

/// memory_search：按关键词在长期记忆中检索行
pub struct MemorySearchTool {
    storage: Arc<dyn MemoryStorage>,
}

impl MemorySearchTool {
    pub fn new(storage: Arc<dyn MemoryStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "Search long-term memory for entries matching a query"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, _cancel: CancellationToken, args: &Value) -> Result<String, ToolError> {
        let query = require_str(args, "query")?.to_lowercase();

        let memory = self
            .storage
            .get_memory()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to read memory: {}", e)))?;

        let matches: Vec<&str> = memory
            .lines()
            .filter(|line| line.to_lowercase().contains(&query))
            .collect();

        if matches.is_empty() {
            return Ok("No matching memory entries found".to_string());
        }
        Ok(format!(
            "Found {} matching entries:\n{}",
            matches.len(),
            matches.join("\n")
        ))
    }
}

/// daily_note_add：向指定日期（默认今天）的笔记追加内容
pub struct DailyNoteAddTool {
    storage: Arc<dyn MemoryStorage>,
}

impl DailyNoteAddTool {
    pub fn new(storage: Arc<dyn MemoryStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl Tool for DailyNoteAddTool {
    fn name(&self) -> &str {
        "daily_note_add"
    }

    fn description(&self) -> &str {
        "Append content to a daily note. Defaults to today's note when no date is given."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The content to append"
                },
                "date": {
                    "type": "string",
                    "description": "The note date in YYYY-MM-DD format (optional, defaults to today)"
                }
            },
            "required": ["content"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, _cancel: CancellationToken, args: &Value) -> Result<String, ToolError> {
        let content = require_str(args, "content")?;
        let date = args
            .get("date")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .unwrap_or_else(today);

        let mut note = self
            .storage
            .get_daily_note(&date)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to read daily note: {}", e)))?;

        if !note.is_empty() && !note.ends_with('\n') {
            note.push('\n');
        }
        note.push_str(content);
        note.push('\n');

        self.storage
            .set_daily_note(&date, &note)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to write daily note: {}", e)))?;

        Ok(format!("Added note for {}", date))
    }
}

/// daily_note_get：读取指定日期（默认今天）的笔记
pub struct DailyNoteGetTool {
    storage: Arc<dyn MemoryStorage>,
}

impl DailyNoteGetTool {
    pub fn new(storage: Arc<dyn MemoryStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl Tool for DailyNoteGetTool {
    fn name(&self) -> &str {
        "daily_note_get"
    }

    fn description(&self) -> &str {
        "Read a daily note. Defaults to today's note when no date is given."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "date": {
                    "type": "string",
                    "description": "The note date in YYYY-MM-DD format (optional, defaults to today)"
                }
            },
            "additionalProperties": false
        })
    }

    async fn execute(&self, _cancel: CancellationToken, args: &Value) -> Result<String, ToolError> {
        let date = args
            .get("date")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .unwrap_or_else(today);

        let note = self
            .storage
            .get_daily_note(&date)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to read daily note: {}", e)))?;

        if note.is_empty() {
            return Ok(format!("No note for {}", date));
        }
        Ok(note)
    }
}

/// 构造全部记忆工具
pub fn memory_tools(storage: Arc<dyn MemoryStorage>) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(MemoryAddTool::new(Arc::clone(&storage))),
        Arc::new(MemorySearchTool::new(Arc::clone(&storage))),
        Arc::new(DailyNoteAddTool::new(Arc::clone(&storage))),
        Arc::new(DailyNoteGetTool::new(storage)),
    ]
}
