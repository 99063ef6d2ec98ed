//! 沙箱文件工具：read / write / list / delete / exists
//!
//! 所有路径以配置的 base 目录为根；解析后的绝对路径必须严格位于 base 之下，
//! 否则返回 INVALID_PATH（禁止 ../ 逃逸）。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::fs;
use tokio_util::sync::CancellationToken;

use crate::tools::{Tool, ToolError};

/// 解析 base 下的相对路径并校验其严格位于 base 之内；目标无需已存在（写入场景）
fn validate_path(base: &Path, rel: &str) -> Result<PathBuf, ToolError> {
    let base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());

    // 逐段归一化，消除 ".." 与 "." 而不要求路径存在
    let mut normalized = base.clone();
    for component in Path::new(rel).components() {
        match component {
            std::path::Component::ParentDir => {
                normalized.pop();
            }
            std::path::Component::CurDir | std::path::Component::RootDir => {}
            std::path::Component::Prefix(_) => {
                return Err(ToolError::InvalidPath("path is outside base directory".to_string()))
            }
            std::path::Component::Normal(c) => normalized.push(c),
        }
    }

    if normalized.starts_with(&base) && normalized != base {
        Ok(normalized)
    } else {
        Err(ToolError::InvalidPath("path is outside base directory".to_string()))
    }
}

fn param_path(args: &Value) -> Result<&str, ToolError> {
    let path = args
        .get("path")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParam("path must be a string".to_string()))?;
    if path.is_empty() {
        return Err(ToolError::InvalidParam("path cannot be empty".to_string()));
    }
    Ok(path)
}

fn path_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "path": {
                "type": "string",
                "description": description
            }
        },
        "required": ["path"],
        "additionalProperties": false
    })
}

/// read_file：读取 base 下的文件内容
pub struct ReadFileTool {
    base: PathBuf,
}

impl ReadFileTool {
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self { base: base.as_ref().to_path_buf() }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file. Returns the file content as a string."
    }

    fn parameters(&self) -> Value {
        path_schema("The path to the file to read, relative to the base directory")
    }

    async fn execute(&self, _cancel: CancellationToken, args: &Value) -> Result<String, ToolError> {
        let path = param_path(args)?;
        let full = validate_path(&self.base, path)?;

        match fs::read_to_string(&full).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ToolError::FileNotFound(path.to_string()))
            }
            Err(e) => Err(ToolError::ExecutionFailed(format!("failed to read file: {}", e))),
        }
    }
}

/// write_file：写入文件，按需创建父目录
pub struct WriteFileTool {
    base: PathBuf,
}

impl WriteFileTool {
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self { base: base.as_ref().to_path_buf() }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file. Creates the file and any necessary directories if they don't exist."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The path to the file to write, relative to the base directory"
                },
                "content": {
                    "type": "string",
                    "description": "The content to write to the file"
                }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, _cancel: CancellationToken, args: &Value) -> Result<String, ToolError> {
        let path = param_path(args)?;
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidParam("content must be a string".to_string()))?;

        let full = validate_path(&self.base, path)?;

        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::WriteFailed(format!("failed to create directory: {}", e)))?;
        }
        fs::write(&full, content)
            .await
            .map_err(|e| ToolError::WriteFailed(format!("failed to write file: {}", e)))?;

        Ok(format!("Successfully wrote {} bytes to {}", content.len(), path))
    }
}

/// list_dir：列出目录条目与类型
pub struct ListDirTool {
    base: PathBuf,
}

impl ListDirTool {
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self { base: base.as_ref().to_path_buf() }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List files and directories in a given path. Returns a list of file names and their types."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The path to list, relative to the base directory. Defaults to the base directory if not provided."
                }
            },
            "additionalProperties": false
        })
    }

    async fn execute(&self, _cancel: CancellationToken, args: &Value) -> Result<String, ToolError> {
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or("");
        let full = if path.is_empty() {
            self.base.clone()
        } else {
            validate_path(&self.base, path)?
        };

        let meta = match fs::metadata(&full).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ToolError::DirNotFound(path.to_string()))
            }
            Err(e) => return Err(ToolError::ExecutionFailed(format!("failed to access path: {}", e))),
        };
        if !meta.is_dir() {
            return Err(ToolError::NotADirectory(path.to_string()));
        }

        let mut entries = fs::read_dir(&full)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to list directory: {}", e)))?;

        let mut lines = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?
        {
            let kind = if entry.path().is_dir() { "dir" } else { "file" };
            lines.push(format!("  [{}] {}", kind, entry.file_name().to_string_lossy()));
        }

        if lines.is_empty() {
            return Ok(format!("Directory is empty: {}", path));
        }
        lines.sort();

        Ok(format!(
            "Contents of {}:\n\n{}\n\nTotal: {} items",
            path,
            lines.join("\n"),
            lines.len()
        ))
    }
}

/// delete_file：删除文件或目录
pub struct DeleteFileTool {
    base: PathBuf,
}

impl DeleteFileTool {
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self { base: base.as_ref().to_path_buf() }
    }
}

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a file or directory. Use with caution as this operation cannot be undone."
    }

    fn parameters(&self) -> Value {
        path_schema("The path to the file or directory to delete, relative to the base directory")
    }

    async fn execute(&self, _cancel: CancellationToken, args: &Value) -> Result<String, ToolError> {
        let path = param_path(args)?;
        let full = validate_path(&self.base, path)?;

        let meta = match fs::metadata(&full).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ToolError::FileNotFound(path.to_string()))
            }
            Err(e) => return Err(ToolError::DeleteFailed(format!("failed to access path: {}", e))),
        };

        let result = if meta.is_dir() {
            fs::remove_dir_all(&full).await
        } else {
            fs::remove_file(&full).await
        };
        result.map_err(|e| ToolError::DeleteFailed(format!("failed to delete: {}", e)))?;

        Ok(format!("Successfully deleted: {}", path))
    }
}

/// file_exists：检查文件或目录是否存在
pub struct FileExistsTool {
    base: PathBuf,
}

impl FileExistsTool {
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self { base: base.as_ref().to_path_buf() }
    }
}

#[async_trait]
impl Tool for FileExistsTool {
    fn name(&self) -> &str {
        "file_exists"
    }

    fn description(&self) -> &str {
        "Check if a file or directory exists"
    }

    fn parameters(&self) -> Value {
        path_schema("The path to check")
    }

    async fn execute(&self, _cancel: CancellationToken, args: &Value) -> Result<String, ToolError> {
        let path = param_path(args)?;
        let full = validate_path(&self.base, path)?;

        if full.exists() {
            Ok(format!("File '{}' exists", path))
        } else {
            Ok(format!("File '{}' does not exist", path))
        }
    }
}

/// 构造全部沙箱文件工具
pub fn file_tools(base: impl AsRef<Path>) -> Vec<std::sync::Arc<dyn Tool>> {
    let base = base.as_ref();
    vec![
        std::sync::Arc::new(ReadFileTool::new(base)),
        std::sync::Arc::new(WriteFileTool::new(base)),
        std::sync::Arc::new(ListDirTool::new(base)),
        std::sync::Arc::new(DeleteFileTool::new(base)),
        std::sync::Arc::new(FileExistsTool::new(base)),
    ]
}
