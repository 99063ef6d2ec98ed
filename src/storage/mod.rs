//! 存储抽象：通用文件存储、会话存储、记忆存储
//!
//! 目录约定（base 下）：
//! ```text
//! sessions/<chatId>/messages.jsonl   # 追加式会话日志
//! memory/MEMORY.md                   # 长期记忆
//! memory/<YYYY-MM-DD>.md             # 每日笔记
//! config/config.json                 # 键值配置
//! ```

mod file;
mod memory;
mod session;

pub use file::FileStorage;
pub use memory::FileMemoryStorage;
pub use session::FileSessionStorage;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// 持久化会话消息（JSONL 一行一条）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: String,
    pub content: String,
    pub timestamp: i64,
}

/// 通用文件存储：相对路径均以 base 目录为根
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, StorageError>;
    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), StorageError>;
    async fn delete_file(&self, path: &str) -> Result<(), StorageError>;
    async fn list_files(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
    async fn file_exists(&self, path: &str) -> Result<bool, StorageError>;
}

/// 按 chat 分区的会话存储：插入序、仅追加
#[async_trait]
pub trait SessionStorage: Send + Sync {
    async fn save_message(&self, chat_id: &str, role: &str, content: &str) -> Result<(), StorageError>;
    async fn get_messages(&self, chat_id: &str, limit: usize) -> Result<Vec<StoredMessage>, StorageError>;
    async fn clear_session(&self, chat_id: &str) -> Result<(), StorageError>;
    async fn list_sessions(&self) -> Result<Vec<String>, StorageError>;
}

/// 长期记忆与每日笔记
#[async_trait]
pub trait MemoryStorage: Send + Sync {
    async fn get_memory(&self) -> Result<String, StorageError>;
    async fn set_memory(&self, content: &str) -> Result<(), StorageError>;
    async fn get_daily_note(&self, date: &str) -> Result<String, StorageError>;
    async fn set_daily_note(&self, date: &str, content: &str) -> Result<(), StorageError>;
    async fn get_config(&self, key: &str) -> Result<String, StorageError>;
    async fn set_config(&self, key: &str, value: &str) -> Result<(), StorageError>;
}
