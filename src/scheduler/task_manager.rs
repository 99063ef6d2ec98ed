//! 任务管理层
//!
//! 把声明式任务配置（id / name / description / cron / enabled）持久化到 JSON
//! 文件，启动时经 handler 工厂重建进调度器，并消费结果通道：记录结果日志、
//! 重新落盘。除持久化外的操作全部委托给调度器。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::scheduler::{Scheduler, SchedulerError, TaskHandler, TaskResult};

/// 声明式任务配置（tasks 文件中的一项）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub cron: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// 由任务配置构造处理器（典型实现：发布合成总线消息）
pub type TaskHandlerFactory = Arc<dyn Fn(&TaskConfig) -> TaskHandler + Send + Sync>;

pub struct TaskManager {
    scheduler: Arc<Scheduler>,
    tasks_file: PathBuf,
    handler_factory: TaskHandlerFactory,
    cancel: CancellationToken,
}

impl TaskManager {
    pub fn new(
        scheduler: Arc<Scheduler>,
        tasks_file: impl AsRef<Path>,
        handler_factory: TaskHandlerFactory,
    ) -> Self {
        Self {
            scheduler,
            tasks_file: tasks_file.as_ref().to_path_buf(),
            handler_factory,
            cancel: CancellationToken::new(),
        }
    }

    /// 加载任务文件并开始消费结果通道
    pub async fn start(&self) -> anyhow::Result<()> {
        if let Err(e) = self.load_tasks().await {
            tracing::warn!(error = %e, "failed to load tasks file");
        }

        if let Some(mut results) = self.scheduler.take_results().await {
            let cancel = self.cancel.clone();
            let scheduler = Arc::clone(&self.scheduler);
            let tasks_file = self.tasks_file.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        result = results.recv() => {
                            let Some(result) = result else { return };
                            handle_result(&scheduler, &tasks_file, result).await;
                        }
                    }
                }
            });
        }
        Ok(())
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Err(e) = self.save_tasks().await {
            tracing::warn!(error = %e, "failed to save tasks on shutdown");
        }
    }

    pub async fn add_task(&self, config: TaskConfig) -> Result<(), SchedulerError> {
        let handler = (self.handler_factory)(&config);
        self.scheduler
            .add_task(
                &config.id,
                &config.name,
                &config.description,
                &config.cron,
                config.enabled,
                handler,
            )
            .await?;
        self.persist().await;
        Ok(())
    }

    pub async fn remove_task(&self, task_id: &str) -> Result<(), SchedulerError> {
        self.scheduler.remove_task(task_id).await?;
        self.persist().await;
        Ok(())
    }

    pub async fn enable_task(&self, task_id: &str) -> Result<(), SchedulerError> {
        self.scheduler.enable_task(task_id).await?;
        self.persist().await;
        Ok(())
    }

    pub async fn disable_task(&self, task_id: &str) -> Result<(), SchedulerError> {
        self.scheduler.disable_task(task_id).await?;
        self.persist().await;
        Ok(())
    }

    pub async fn trigger_task(&self, task_id: &str) -> Result<(), SchedulerError> {
        self.scheduler.trigger_task(task_id).await
    }

    pub async fn list_tasks(&self) -> Vec<TaskConfig> {
        self.scheduler
            .list_tasks()
            .await
            .into_iter()
            .map(|t| TaskConfig {
                id: t.id,
                name: t.name,
                description: t.description,
                cron: t.cron_expr,
                enabled: t.enabled,
            })
            .collect()
    }

    pub async fn stats(&self) -> serde_json::Value {
        self.scheduler.stats().await
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// 导出全部任务配置（pretty JSON）
    pub async fn export_tasks(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(&self.list_tasks().await)?)
    }

    /// 导入任务配置：已存在的任务先移除再按新配置重建
    pub async fn import_tasks(&self, data: &str) -> anyhow::Result<usize> {
        let configs: Vec<TaskConfig> = serde_json::from_str(data)?;
        let mut imported = 0;

        for config in configs {
            if self.scheduler.get_task(&config.id).await.is_some() {
                if let Err(e) = self.scheduler.remove_task(&config.id).await {
                    tracing::warn!(id = %config.id, error = %e, "failed to replace task");
                    continue;
                }
            }
            let handler = (self.handler_factory)(&config);
            match self
                .scheduler
                .add_task(
                    &config.id,
                    &config.name,
                    &config.description,
                    &config.cron,
                    config.enabled,
                    handler,
                )
                .await
            {
                Ok(()) => imported += 1,
                Err(e) => {
                    tracing::warn!(id = %config.id, error = %e, "failed to import task");
                }
            }
        }

        self.persist().await;
        Ok(imported)
    }

    /// 单个任务的下次触发时刻
    pub async fn next_run_time(&self, task_id: &str) -> Result<chrono::DateTime<chrono::Local>, SchedulerError> {
        self.scheduler
            .get_task(task_id)
            .await
            .map(|t| t.next_run)
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))
    }

    /// 全部任务的下次触发时刻
    pub async fn all_next_run_times(&self) -> std::collections::HashMap<String, chrono::DateTime<chrono::Local>> {
        self.scheduler
            .list_tasks()
            .await
            .into_iter()
            .map(|t| (t.id, t.next_run))
            .collect()
    }

    async fn load_tasks(&self) -> anyhow::Result<()> {
        if !self.tasks_file.exists() {
            tracing::info!(file = %self.tasks_file.display(), "tasks file does not exist");
            return Ok(());
        }

        let data = tokio::fs::read_to_string(&self.tasks_file).await?;
        let configs: Vec<TaskConfig> = serde_json::from_str(&data)?;
        let count = configs.len();

        for config in configs {
            let handler = (self.handler_factory)(&config);
            if let Err(e) = self
                .scheduler
                .add_task(
                    &config.id,
                    &config.name,
                    &config.description,
                    &config.cron,
                    config.enabled,
                    handler,
                )
                .await
            {
                tracing::warn!(id = %config.id, error = %e, "failed to add task from file");
            }
        }

        tracing::info!(count, "tasks loaded from file");
        Ok(())
    }

    async fn save_tasks(&self) -> anyhow::Result<()> {
        let configs = self.list_tasks().await;
        let data = serde_json::to_string_pretty(&configs)?;

        if let Some(parent) = self.tasks_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.tasks_file, data).await?;
        Ok(())
    }

    async fn persist(&self) {
        if let Err(e) = self.save_tasks().await {
            tracing::warn!(error = %e, "failed to save tasks");
        }
    }
}

async fn handle_result(scheduler: &Scheduler, tasks_file: &Path, result: TaskResult) {
    match &result.error {
        None => {
            tracing::info!(
                id = %result.task_id,
                status = ?result.status,
                duration = ?result.duration,
                "task result"
            );
        }
        Some(e) => {
            tracing::warn!(id = %result.task_id, error = %e, "task result");
        }
    }

    // 落盘最新 last-run 状态
    let configs: Vec<TaskConfig> = scheduler
        .list_tasks()
        .await
        .into_iter()
        .map(|t| TaskConfig {
            id: t.id,
            name: t.name,
            description: t.description,
            cron: t.cron_expr,
            enabled: t.enabled,
        })
        .collect();

    if let Ok(data) = serde_json::to_string_pretty(&configs) {
        if let Some(parent) = tasks_file.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(e) = tokio::fs::write(tasks_file, data).await {
            tracing::warn!(error = %e, "failed to persist tasks after result");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    fn counting_factory(counter: Arc<AtomicU64>) -> TaskHandlerFactory {
        Arc::new(move |_config| {
            let counter = Arc::clone(&counter);
            Arc::new(move |_cancel| {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
        })
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let tasks_file = dir.path().join("tasks.json");
        let counter = Arc::new(AtomicU64::new(0));

        {
            let scheduler = Arc::new(Scheduler::default());
            let manager = TaskManager::new(
                Arc::clone(&scheduler),
                &tasks_file,
                counting_factory(Arc::clone(&counter)),
            );
            manager.start().await.unwrap();
            manager
                .add_task(TaskConfig {
                    id: "daily".to_string(),
                    name: "daily report".to_string(),
                    description: "send the daily report".to_string(),
                    cron: "0 0 9 * * *".to_string(),
                    enabled: true,
                })
                .await
                .unwrap();
            manager.stop().await;
        }

        assert!(tasks_file.exists());

        // 重新加载
        let scheduler = Arc::new(Scheduler::default());
        let manager = TaskManager::new(
            Arc::clone(&scheduler),
            &tasks_file,
            counting_factory(counter),
        );
        manager.start().await.unwrap();

        let tasks = manager.list_tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "daily");
        assert_eq!(tasks[0].cron, "0 0 9 * * *");
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let counter = Arc::new(AtomicU64::new(0));

        let scheduler = Arc::new(Scheduler::default());
        let manager = TaskManager::new(
            Arc::clone(&scheduler),
            dir.path().join("tasks.json"),
            counting_factory(Arc::clone(&counter)),
        );
        manager
            .add_task(TaskConfig {
                id: "t1".to_string(),
                name: "one".to_string(),
                description: String::new(),
                cron: "0 30 8 * * *".to_string(),
                enabled: true,
            })
            .await
            .unwrap();

        let exported = manager.export_tasks().await.unwrap();
        assert!(exported.contains("\"t1\""));

        // 导入到另一个管理器
        let scheduler2 = Arc::new(Scheduler::default());
        let manager2 = TaskManager::new(
            Arc::clone(&scheduler2),
            dir.path().join("tasks2.json"),
            counting_factory(counter),
        );
        let imported = manager2.import_tasks(&exported).await.unwrap();
        assert_eq!(imported, 1);
        assert!(manager2.next_run_time("t1").await.is_ok());
        assert_eq!(manager2.all_next_run_times().await.len(), 1);

        // 非法 JSON 被拒绝
        assert!(manager2.import_tasks("not json").await.is_err());
    }

    #[tokio::test]
    async fn test_result_watcher_logs_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let tasks_file = dir.path().join("tasks.json");
        let counter = Arc::new(AtomicU64::new(0));

        let scheduler = Arc::new(Scheduler::default());
        let manager = TaskManager::new(
            Arc::clone(&scheduler),
            &tasks_file,
            counting_factory(Arc::clone(&counter)),
        );
        manager.start().await.unwrap();
        scheduler.start().await.unwrap();

        manager
            .add_task(TaskConfig {
                id: "once".to_string(),
                name: "manual".to_string(),
                description: String::new(),
                cron: "0 0 0 1 1 *".to_string(),
                enabled: true,
            })
            .await
            .unwrap();

        manager.trigger_task("once").await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(tasks_file.exists());

        scheduler.stop().await;
        manager.stop().await;
    }
}
