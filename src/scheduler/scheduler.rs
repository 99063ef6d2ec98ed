//! 任务调度器
//!
//! 两个协作循环：tick 循环按节拍扫描到期任务并非阻塞投递到工作队列
//! （队满记日志跳过，下个节拍重试）；worker 循环从队列取任务、逐个 spawn 执行，
//! 更新状态计数并向结果通道非阻塞发送 TaskResult。

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::cron::{CronError, CronSchedule};

/// 工作 / 结果通道容量
const CHANNEL_CAPACITY: usize = 100;
/// 默认 tick 间隔
const DEFAULT_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task {0} cannot be empty")]
    EmptyField(&'static str),
    #[error("invalid cron expression: {0}")]
    InvalidCron(#[from] CronError),
    #[error("task with ID {0} already exists")]
    DuplicateTask(String),
    #[error("task with ID {0} not found")]
    TaskNotFound(String),
    #[error("task {0} is disabled")]
    TaskDisabled(String),
    #[error("task queue is full")]
    QueueFull,
    #[error("scheduler already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// 任务处理器：接收调度器的取消令牌
pub type TaskHandler = Arc<dyn Fn(CancellationToken) -> TaskFuture + Send + Sync>;

/// 调度任务；handler 不参与序列化与调试输出
#[derive(Clone)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub description: String,
    pub cron_expr: String,
    pub handler: TaskHandler,
    pub status: TaskStatus,
    pub enabled: bool,
    pub last_run: Option<DateTime<Local>>,
    pub next_run: DateTime<Local>,
    pub run_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Local>,
    pub updated_at: DateTime<Local>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("cron_expr", &self.cron_expr)
            .field("status", &self.status)
            .field("enabled", &self.enabled)
            .field("next_run", &self.next_run)
            .field("run_count", &self.run_count)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

pub struct SchedulerConfig {
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_interval: DEFAULT_TICK }
    }
}

pub struct Scheduler {
    tasks: Arc<RwLock<HashMap<String, Task>>>,
    tick_interval: Duration,
    work_tx: mpsc::Sender<String>,
    work_rx: Mutex<Option<mpsc::Receiver<String>>>,
    result_tx: mpsc::Sender<TaskResult>,
    result_rx: Mutex<Option<mpsc::Receiver<TaskResult>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    running: std::sync::atomic::AtomicBool,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let (work_tx, work_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (result_tx, result_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            tick_interval: config.tick_interval,
            work_tx,
            work_rx: Mutex::new(Some(work_rx)),
            result_tx,
            result_rx: Mutex::new(Some(result_rx)),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            running: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// 启动 tick 循环与 worker 循环
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.running.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        // tick 循环
        {
            let tasks = Arc::clone(&self.tasks);
            let work_tx = self.work_tx.clone();
            let cancel = self.cancel.clone();
            let tick = self.tick_interval;
            self.tracker.spawn(async move {
                let mut ticker = tokio::time::interval(tick);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => check_due_tasks(&tasks, &work_tx).await,
                    }
                }
            });
        }

        // worker 循环
        {
            let Some(mut work_rx) = self.work_rx.lock().await.take() else {
                return Ok(());
            };
            let tasks = Arc::clone(&self.tasks);
            let result_tx = self.result_tx.clone();
            let cancel = self.cancel.clone();
            let tracker = self.tracker.clone();
            self.tracker.spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        task_id = work_rx.recv() => {
                            let Some(task_id) = task_id else { return };
                            let tasks = Arc::clone(&tasks);
                            let result_tx = result_tx.clone();
                            let cancel = cancel.clone();
                            tracker.spawn(async move {
                                execute_task(&tasks, &result_tx, cancel, task_id).await;
                            });
                        }
                    }
                }
            });
        }

        tracing::info!("scheduler started");
        Ok(())
    }

    /// 停止两个循环并等待在途执行排空
    pub async fn stop(&self) {
        if !self.running.swap(false, std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("scheduler stopped");
    }

    /// 添加任务；拒绝空字段、非法表达式与重复 ID
    pub async fn add_task(
        &self,
        id: &str,
        name: &str,
        description: &str,
        cron_expr: &str,
        enabled: bool,
        handler: TaskHandler,
    ) -> Result<(), SchedulerError> {
        if id.is_empty() {
            return Err(SchedulerError::EmptyField("ID"));
        }
        if name.is_empty() {
            return Err(SchedulerError::EmptyField("name"));
        }
        if cron_expr.is_empty() {
            return Err(SchedulerError::EmptyField("cron expression"));
        }

        let schedule = CronSchedule::parse(cron_expr)?;

        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(id) {
            return Err(SchedulerError::DuplicateTask(id.to_string()));
        }

        let now = Local::now();
        let task = Task {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            cron_expr: cron_expr.to_string(),
            handler,
            status: TaskStatus::Pending,
            enabled,
            last_run: None,
            next_run: schedule.next(now),
            run_count: 0,
            error_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        tracing::info!(id, name, next_run = %task.next_run, "task added");
        tasks.insert(id.to_string(), task);
        Ok(())
    }

    pub async fn remove_task(&self, task_id: &str) -> Result<(), SchedulerError> {
        let mut tasks = self.tasks.write().await;
        if tasks.remove(task_id).is_none() {
            return Err(SchedulerError::TaskNotFound(task_id.to_string()));
        }
        tracing::info!(id = task_id, "task removed");
        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> Option<Task> {
        self.tasks.read().await.get(task_id).cloned()
    }

    pub async fn list_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    pub async fn enable_task(&self, task_id: &str) -> Result<(), SchedulerError> {
        self.set_enabled(task_id, true).await
    }

    pub async fn disable_task(&self, task_id: &str) -> Result<(), SchedulerError> {
        self.set_enabled(task_id, false).await
    }

    async fn set_enabled(&self, task_id: &str, enabled: bool) -> Result<(), SchedulerError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
        task.enabled = enabled;
        task.updated_at = Local::now();
        tracing::info!(id = task_id, enabled, "task toggled");
        Ok(())
    }

    /// 显式单次触发：直接入队，不影响 next_run
    pub async fn trigger_task(&self, task_id: &str) -> Result<(), SchedulerError> {
        {
            let tasks = self.tasks.read().await;
            let task = tasks
                .get(task_id)
                .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
            if !task.enabled {
                return Err(SchedulerError::TaskDisabled(task_id.to_string()));
            }
        }
        self.work_tx
            .try_send(task_id.to_string())
            .map_err(|_| SchedulerError::QueueFull)
    }

    /// 取走结果通道接收端（只能取一次，交给 TaskManager 消费）
    pub async fn take_results(&self) -> Option<mpsc::Receiver<TaskResult>> {
        self.result_rx.lock().await.take()
    }

    pub async fn stats(&self) -> serde_json::Value {
        let tasks = self.tasks.read().await;
        let enabled = tasks.values().filter(|t| t.enabled).count();
        let running = tasks.values().filter(|t| t.status == TaskStatus::Running).count();
        let total_runs: u64 = tasks.values().map(|t| t.run_count).sum();
        let total_errors: u64 = tasks.values().map(|t| t.error_count).sum();

        serde_json::json!({
            "total_tasks": tasks.len(),
            "enabled_tasks": enabled,
            "running_tasks": running,
            "total_runs": total_runs,
            "total_errors": total_errors,
            "is_running": self.is_running(),
        })
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

/// 扫描到期任务并投递；队满跳过，next_run 不前进，下个 tick 重试
async fn check_due_tasks(tasks: &RwLock<HashMap<String, Task>>, work_tx: &mpsc::Sender<String>) {
    let now = Local::now();
    let mut tasks = tasks.write().await;

    for task in tasks.values_mut() {
        if !task.enabled || now < task.next_run {
            continue;
        }

        match work_tx.try_send(task.id.clone()) {
            Ok(()) => {
                task.last_run = Some(now);
                if let Ok(schedule) = CronSchedule::parse(&task.cron_expr) {
                    task.next_run = schedule.next(now);
                }
            }
            Err(_) => {
                tracing::warn!(id = %task.id, "task queue is full, skipping task");
            }
        }
    }
}

async fn execute_task(
    tasks: &RwLock<HashMap<String, Task>>,
    result_tx: &mpsc::Sender<TaskResult>,
    cancel: CancellationToken,
    task_id: String,
) {
    let handler = {
        let mut tasks = tasks.write().await;
        let Some(task) = tasks.get_mut(&task_id) else {
            tracing::warn!(id = %task_id, "task disappeared before execution");
            return;
        };
        task.status = TaskStatus::Running;
        task.updated_at = Local::now();
        Arc::clone(&task.handler)
    };

    tracing::info!(id = %task_id, "task started");
    let start = std::time::Instant::now();
    let result = handler(cancel).await;
    let duration = start.elapsed();

    let status = {
        let mut tasks = tasks.write().await;
        let Some(task) = tasks.get_mut(&task_id) else { return };
        match &result {
            Ok(()) => {
                task.status = TaskStatus::Completed;
                task.run_count += 1;
                tracing::info!(id = %task_id, ?duration, "task completed");
            }
            Err(e) => {
                task.status = TaskStatus::Failed;
                task.error_count += 1;
                task.last_error = Some(e.clone());
                tracing::warn!(id = %task_id, error = %e, "task failed");
            }
        }
        task.updated_at = Local::now();
        task.status
    };

    let task_result = TaskResult {
        task_id: task_id.clone(),
        status,
        error: result.err(),
        duration,
        timestamp: Utc::now(),
    };
    if result_tx.try_send(task_result).is_err() {
        tracing::warn!(id = %task_id, "result queue is full, dropping result");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn counting_handler(counter: Arc<AtomicU64>) -> TaskHandler {
        Arc::new(move |_cancel| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    fn noop_handler() -> TaskHandler {
        Arc::new(|_| Box::pin(async { Ok(()) }))
    }

    #[tokio::test]
    async fn test_add_task_validation() {
        let scheduler = Scheduler::default();

        assert!(matches!(
            scheduler.add_task("", "n", "", "* * * * *", true, noop_handler()).await,
            Err(SchedulerError::EmptyField("ID"))
        ));
        assert!(matches!(
            scheduler.add_task("t", "", "", "* * * * *", true, noop_handler()).await,
            Err(SchedulerError::EmptyField("name"))
        ));
        assert!(matches!(
            scheduler.add_task("t", "n", "", "bogus", true, noop_handler()).await,
            Err(SchedulerError::InvalidCron(_))
        ));

        scheduler
            .add_task("t", "n", "", "* * * * *", true, noop_handler())
            .await
            .unwrap();
        assert!(matches!(
            scheduler.add_task("t", "n", "", "* * * * *", true, noop_handler()).await,
            Err(SchedulerError::DuplicateTask(_))
        ));
    }

    #[tokio::test]
    async fn test_cron_fires_every_second() {
        let scheduler = Scheduler::default();
        let counter = Arc::new(AtomicU64::new(0));

        scheduler
            .add_task(
                "tick",
                "every second",
                "",
                "* * * * * *",
                true,
                counting_handler(Arc::clone(&counter)),
            )
            .await
            .unwrap();
        scheduler.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        scheduler.stop().await;

        let task = scheduler.get_task("tick").await.unwrap();
        assert!(task.run_count >= 2, "run_count = {}", task.run_count);
        assert!(counter.load(Ordering::SeqCst) >= 2);
        assert!(task.last_run.is_some());
        // next_run 严格前进
        assert!(task.next_run > task.last_run.unwrap());
    }

    #[tokio::test]
    async fn test_disabled_task_not_scheduled() {
        let scheduler = Scheduler::default();
        let counter = Arc::new(AtomicU64::new(0));

        scheduler
            .add_task(
                "idle",
                "disabled",
                "",
                "* * * * * *",
                false,
                counting_handler(Arc::clone(&counter)),
            )
            .await
            .unwrap();
        scheduler.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        scheduler.stop().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        assert!(matches!(
            scheduler.trigger_task("idle").await,
            Err(SchedulerError::TaskDisabled(_))
        ));
    }

    #[tokio::test]
    async fn test_trigger_task_runs_once() {
        let scheduler = Scheduler::default();
        let counter = Arc::new(AtomicU64::new(0));

        // 每年元旦才到期，只有显式触发会执行
        scheduler
            .add_task(
                "manual",
                "manual",
                "",
                "0 0 0 1 1 *",
                true,
                counting_handler(Arc::clone(&counter)),
            )
            .await
            .unwrap();
        scheduler.start().await.unwrap();

        scheduler.trigger_task("manual").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        scheduler.stop().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_task_counts_error() {
        let scheduler = Scheduler::default();
        let failing: TaskHandler = Arc::new(|_| Box::pin(async { Err("boom".to_string()) }));

        scheduler
            .add_task("bad", "failing", "", "0 0 0 1 1 *", true, failing)
            .await
            .unwrap();
        let mut results = scheduler.take_results().await.unwrap();
        scheduler.start().await.unwrap();

        scheduler.trigger_task("bad").await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), results.recv())
            .await
            .unwrap()
            .unwrap();
        scheduler.stop().await;

        assert_eq!(result.task_id, "bad");
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("boom"));

        let task = scheduler.get_task("bad").await.unwrap();
        assert_eq!(task.error_count, 1);
        assert_eq!(task.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_stats() {
        let scheduler = Scheduler::default();
        scheduler
            .add_task("a", "a", "", "* * * * *", true, noop_handler())
            .await
            .unwrap();
        scheduler
            .add_task("b", "b", "", "* * * * *", false, noop_handler())
            .await
            .unwrap();

        let stats = scheduler.stats().await;
        assert_eq!(stats["total_tasks"], 2);
        assert_eq!(stats["enabled_tasks"], 1);
        assert_eq!(stats["is_running"], false);
    }
}
