//! 技能目录监视器：热加载
//!
//! 以 500ms 间隔轮询目录中 *.md 文件的修改时间，折算出 Created / Modified /
//! Removed 事件；同一路径 500ms 内的重复事件被去抖合并。
//! 新增/修改 -> 重新解析并注册（同路径 ID 稳定，注册即替换）；
//! 删除/改名 -> 按文件名前缀找到对应技能并注销。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{SkillError, SkillRegistry};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileEvent {
    Created,
    Modified,
    Removed,
}

pub struct SkillWatcher {
    registry: Arc<SkillRegistry>,
    dir: PathBuf,
    cancel: CancellationToken,
    /// path -> 上次处理时刻（去抖）
    debounce: Arc<Mutex<HashMap<PathBuf, std::time::Instant>>>,
}

impl SkillWatcher {
    pub fn new(registry: Arc<SkillRegistry>, dir: impl AsRef<Path>) -> Self {
        Self {
            registry,
            dir: dir.as_ref().to_path_buf(),
            cancel: CancellationToken::new(),
            debounce: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 启动监视循环；目录不存在返回错误
    pub async fn start(&self) -> Result<(), SkillError> {
        if !self.dir.exists() {
            return Err(SkillError::InvalidFormat(format!(
                "directory does not exist: {}",
                self.dir.display()
            )));
        }

        let registry = Arc::clone(&self.registry);
        let dir = self.dir.clone();
        let cancel = self.cancel.clone();
        let debounce = Arc::clone(&self.debounce);

        tokio::spawn(async move {
            let mut snapshot = scan(&dir).await;
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let current = scan(&dir).await;
                        for (path, event) in diff(&snapshot, &current) {
                            // 同一路径 500ms 内的重复事件丢弃
                            {
                                let mut seen = debounce.lock().await;
                                let now = std::time::Instant::now();
                                if let Some(last) = seen.get(&path) {
                                    if now.duration_since(*last) < DEBOUNCE {
                                        continue;
                                    }
                                }
                                seen.insert(path.clone(), now);
                            }
                            handle_event(&registry, &path, event).await;
                        }
                        snapshot = current;
                    }
                }
            }
        });

        tracing::info!(dir = %self.dir.display(), "skill watcher started");
        Ok(())
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        tracing::info!("skill watcher stopped");
    }

    /// 清空注册表并整目录重载
    pub async fn reload_directory(&self) -> Result<usize, SkillError> {
        self.registry.clear();
        let count = self.registry.load_from_directory(&self.dir).await?;
        tracing::info!(count, dir = %self.dir.display(), "skills reloaded");
        Ok(count)
    }
}

/// 目录快照：*.md 文件 -> 修改时间
async fn scan(dir: &Path) -> HashMap<PathBuf, SystemTime> {
    let mut snapshot = HashMap::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return snapshot;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_md = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("md"))
            .unwrap_or(false);
        if !is_md {
            continue;
        }
        if let Ok(meta) = entry.metadata().await {
            if let Ok(mtime) = meta.modified() {
                snapshot.insert(path, mtime);
            }
        }
    }
    snapshot
}

fn diff(
    old: &HashMap<PathBuf, SystemTime>,
    new: &HashMap<PathBuf, SystemTime>,
) -> Vec<(PathBuf, FileEvent)> {
    let mut events = Vec::new();
    for (path, mtime) in new {
        match old.get(path) {
            None => events.push((path.clone(), FileEvent::Created)),
            Some(prev) if prev != mtime => events.push((path.clone(), FileEvent::Modified)),
            Some(_) => {}
        }
    }
    for path in old.keys() {
        if !new.contains_key(path) {
            events.push((path.clone(), FileEvent::Removed));
        }
    }
    events
}

async fn handle_event(registry: &SkillRegistry, path: &Path, event: FileEvent) {
    match event {
        FileEvent::Created | FileEvent::Modified => match registry.load_from_file(path).await {
            Ok(skill) => {
                tracing::info!(id = %skill.id, name = %skill.name, path = %path.display(), "skill updated from file");
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to reload skill file");
            }
        },
        FileEvent::Removed => {
            // ID 以文件名（去扩展名）为前缀，改名产生的 remove+create 各自按路径处理
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                return;
            };
            let prefix = format!("{}-", stem);
            let doomed: Vec<String> = registry
                .list()
                .into_iter()
                .filter(|s| s.id.starts_with(&prefix))
                .map(|s| s.id)
                .collect();
            for id in doomed {
                if registry.unregister(&id).is_ok() {
                    tracing::info!(id = %id, path = %path.display(), "skill removed due to file deletion");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SKILL_A: &str = "---\nname: alpha\ndescription: first skill\n---\nalpha body";
    const SKILL_B: &str = "---\nname: beta\ndescription: second skill\n---\nbeta body";

    #[tokio::test]
    async fn test_create_modify_remove_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SkillRegistry::new());
        let watcher = SkillWatcher::new(Arc::clone(&registry), dir.path());
        watcher.start().await.unwrap();

        // 创建
        std::fs::write(dir.path().join("alpha.md"), SKILL_A).unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.list()[0].name, "alpha");

        // 修改（等待去抖窗口过去后写入，mtime 变化）
        std::fs::write(dir.path().join("alpha.md"), SKILL_B).unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.list()[0].name, "beta");

        // 删除
        std::fs::remove_file(dir.path().join("alpha.md")).unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(registry.count(), 0);

        watcher.stop();
    }

    #[tokio::test]
    async fn test_rename_treated_as_remove_and_create() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SkillRegistry::new());
        let watcher = SkillWatcher::new(Arc::clone(&registry), dir.path());
        watcher.start().await.unwrap();

        std::fs::write(dir.path().join("alpha.md"), SKILL_A).unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(registry.count(), 1);
        let old_id = registry.list()[0].id.clone();

        // 改名：旧路径 remove + 新路径 create，ID 随路径变化
        std::fs::rename(dir.path().join("alpha.md"), dir.path().join("renamed.md")).unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;

        assert_eq!(registry.count(), 1);
        let new_id = registry.list()[0].id.clone();
        assert_ne!(old_id, new_id);
        assert!(new_id.starts_with("renamed-"));

        watcher.stop();
    }

    #[tokio::test]
    async fn test_reload_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), SKILL_A).unwrap();

        let registry = Arc::new(SkillRegistry::new());
        // 预置一个孤儿技能，reload 应把它清掉
        registry
            .register(crate::skills::Skill::new("orphan-1", "orphan", "stale"))
            .unwrap();

        let watcher = SkillWatcher::new(Arc::clone(&registry), dir.path());
        let count = watcher.reload_directory().await.unwrap();
        assert_eq!(count, 1);
        assert!(registry.get("orphan-1").is_none());
        assert_eq!(registry.list()[0].name, "alpha");
    }

    #[tokio::test]
    async fn test_start_missing_directory() {
        let registry = Arc::new(SkillRegistry::new());
        let watcher = SkillWatcher::new(registry, "/definitely/not/here");
        assert!(watcher.start().await.is_err());
    }

    #[test]
    fn test_diff_events() {
        let mut old = HashMap::new();
        let mut new = HashMap::new();
        let t0 = SystemTime::UNIX_EPOCH;
        let t1 = t0 + Duration::from_secs(1);

        old.insert(PathBuf::from("kept.md"), t0);
        old.insert(PathBuf::from("gone.md"), t0);
        new.insert(PathBuf::from("kept.md"), t1);
        new.insert(PathBuf::from("fresh.md"), t1);

        let events = diff(&old, &new);
        assert!(events.contains(&(PathBuf::from("kept.md"), FileEvent::Modified)));
        assert!(events.contains(&(PathBuf::from("fresh.md"), FileEvent::Created)));
        assert!(events.contains(&(PathBuf::from("gone.md"), FileEvent::Removed)));
    }
}
