//! 基于文件系统的通用存储实现

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;

use super::{Storage, StorageError};

/// 文件存储：所有路径相对 base 目录；写操作经单一互斥锁串行化
pub struct FileStorage {
    base: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.base.join(path)
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        Ok(fs::read(self.full_path(path)).await?)
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(full, data).await?;
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        fs::remove_file(self.full_path(path)).await?;
        Ok(())
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let root = self.full_path(prefix);
        if !root.exists() {
            return Ok(Vec::new());
        }

        // 递归收集相对 base 的文件路径
        let mut files = Vec::new();
        let mut stack = vec![root];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.base) {
                    files.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        files.sort();
        Ok(files)
    }

    async fn file_exists(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self.full_path(path).exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());

        storage.write_file("a/b/c.txt", b"hello").await.unwrap();
        assert!(storage.file_exists("a/b/c.txt").await.unwrap());
        assert_eq!(storage.read_file("a/b/c.txt").await.unwrap(), b"hello");

        let files = storage.list_files("a").await.unwrap();
        assert_eq!(files, vec!["a/b/c.txt".to_string()]);

        storage.delete_file("a/b/c.txt").await.unwrap();
        assert!(!storage.file_exists("a/b/c.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_missing_prefix_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        assert!(storage.list_files("nope").await.unwrap().is_empty());
    }
}
