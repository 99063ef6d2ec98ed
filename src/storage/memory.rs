//! 记忆存储：memory/MEMORY.md 长期记忆 + memory/<date>.md 每日笔记

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;

use super::{MemoryStorage, StorageError};

pub struct FileMemoryStorage {
    base: PathBuf,
    write_lock: Mutex<()>,
}

impl FileMemoryStorage {
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    async fn read_or_empty(path: &Path) -> Result<String, StorageError> {
        match fs::read_to_string(path).await {
            Ok(s) => Ok(s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_creating_dir(&self, path: &Path, content: &str) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, content).await?;
        Ok(())
    }
}

#[async_trait]
impl MemoryStorage for FileMemoryStorage {
    async fn get_memory(&self) -> Result<String, StorageError> {
        Self::read_or_empty(&self.base.join("memory").join("MEMORY.md")).await
    }

    async fn set_memory(&self, content: &str) -> Result<(), StorageError> {
        self.write_creating_dir(&self.base.join("memory").join("MEMORY.md"), content)
            .await
    }

    async fn get_daily_note(&self, date: &str) -> Result<String, StorageError> {
        Self::read_or_empty(&self.base.join("memory").join(format!("{}.md", date))).await
    }

    async fn set_daily_note(&self, date: &str, content: &str) -> Result<(), StorageError> {
        self.write_creating_dir(&self.base.join("memory").join(format!("{}.md", date)), content)
            .await
    }

    async fn get_config(&self, key: &str) -> Result<String, StorageError> {
        let data = Self::read_or_empty(&self.base.join("config").join("config.json")).await?;
        if data.is_empty() {
            return Ok(String::new());
        }
        let map: HashMap<String, String> = serde_json::from_str(&data)?;
        Ok(map.get(key).cloned().unwrap_or_default())
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.base.join("config").join("config.json");
        let data = Self::read_or_empty(&path).await?;
        let mut map: HashMap<String, String> = if data.is_empty() {
            HashMap::new()
        } else {
            serde_json::from_str(&data)?
        };
        map.insert(key.to_string(), value.to_string());
        self.write_creating_dir(&path, &serde_json::to_string_pretty(&map)?)
            .await
    }
}
