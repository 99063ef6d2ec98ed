//! 会话存储：sessions/<chatId>/messages.jsonl 追加式日志

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{SessionStorage, StorageError, StoredMessage};

pub struct FileSessionStorage {
    base: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSessionStorage {
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    fn session_file(&self, chat_id: &str) -> PathBuf {
        self.base.join("sessions").join(chat_id).join("messages.jsonl")
    }
}

#[async_trait]
impl SessionStorage for FileSessionStorage {
    async fn save_message(&self, chat_id: &str, role: &str, content: &str) -> Result<(), StorageError> {
        // JSONL 行写入必须串行，避免并发交错
        let _guard = self.write_lock.lock().await;

        let file = self.session_file(chat_id);
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).await?;
        }

        let msg = StoredMessage {
            role: role.to_string(),
            content: content.to_string(),
            timestamp: Utc::now().timestamp(),
        };
        let mut line = serde_json::to_vec(&msg)?;
        line.push(b'\n');

        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file)
            .await?;
        f.write_all(&line).await?;
        Ok(())
    }

    async fn get_messages(&self, chat_id: &str, limit: usize) -> Result<Vec<StoredMessage>, StorageError> {
        let file = self.session_file(chat_id);
        let data = match fs::read_to_string(&file).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut messages: Vec<StoredMessage> = data
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();

        if limit > 0 && messages.len() > limit {
            messages = messages.split_off(messages.len() - limit);
        }
        Ok(messages)
    }

    async fn clear_session(&self, chat_id: &str) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let dir = self.base.join("sessions").join(chat_id);
        if dir.exists() {
            fs::remove_dir_all(dir).await?;
        }
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<String>, StorageError> {
        let dir = self.base.join("sessions");
        let mut entries = match fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut sessions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().is_dir() {
                sessions.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        sessions.sort();
        Ok(sessions)
    }
}
