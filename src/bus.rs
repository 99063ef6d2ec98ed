//! 消息总线：进程内 publish / subscribe 分发器
//!
//! 单条内部队列（容量 100）串行接收发布；后台分发循环按 topic 查找订阅者，
//! 为每个订阅者 spawn 一个异步任务并发执行 handler。
//! 关闭采用「只取消不关队列」策略：CancellationToken 终止分发循环，
//! TaskTracker 等待在途 handler 任务排空。

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Telegram 长轮询通道
pub const CHANNEL_TELEGRAM: &str = "telegram";
/// WebSocket 双向通道
pub const CHANNEL_WEBSOCKET: &str = "websocket";
/// 本地交互通道
pub const CHANNEL_CLI: &str = "cli";
/// 调度器注入合成消息的保留通道
pub const CHANNEL_SCHEDULE: &str = "schedule";

/// 内部队列容量
const QUEUE_CAPACITY: usize = 100;
/// 队列饱和时 publish 的最长等待
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// 总线消息：发布后不可变
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Message {
    pub fn new(channel: impl Into<String>, chat_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    /// 队列饱和超过 5 秒
    #[error("publish timed out: queue is full")]
    Timeout,
    /// 调用方取消
    #[error("publish cancelled by caller")]
    Cancelled,
    #[error("bus is closed")]
    Closed,
    #[error("handler not found: {0}")]
    HandlerNotFound(String),
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// 订阅者回调：(取消令牌, 消息) -> 异步结果
pub type MessageHandler = Arc<dyn Fn(CancellationToken, Message) -> HandlerFuture + Send + Sync>;

type SubscriberMap = HashMap<String, HashMap<String, MessageHandler>>;

/// 进程内消息总线
pub struct MessageBus {
    subscribers: Arc<RwLock<SubscriberMap>>,
    tx: mpsc::Sender<Message>,
    rx: Mutex<Option<mpsc::Receiver<Message>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl MessageBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            tx,
            rx: Mutex::new(Some(rx)),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// 启动后台分发循环；重复调用无效果
    pub async fn start(&self) {
        let Some(mut rx) = self.rx.lock().await.take() else {
            return;
        };

        let subscribers = Arc::clone(&self.subscribers);
        let cancel = self.cancel.clone();
        let tracker = self.tracker.clone();

        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    msg = rx.recv() => {
                        let Some(msg) = msg else { return };
                        let handlers: Vec<(String, MessageHandler)> = {
                            let subs = subscribers.read().await;
                            subs.get(&msg.channel)
                                .map(|m| m.iter().map(|(id, h)| (id.clone(), Arc::clone(h))).collect())
                                .unwrap_or_default()
                        };
                        for (handler_id, handler) in handlers {
                            let msg = msg.clone();
                            let token = cancel.child_token();
                            tracker.spawn(async move {
                                if let Err(e) = handler(token, msg).await {
                                    tracing::error!(handler = %handler_id, error = %e, "bus handler failed");
                                }
                            });
                        }
                    }
                }
            }
        });
    }

    /// 发布消息：写入 channel 与 timestamp 后入队
    ///
    /// 队列饱和超过 5 秒返回 Timeout；调用方令牌先触发返回 Cancelled；
    /// 总线已关闭返回 Closed。
    pub async fn publish(
        &self,
        cancel: &CancellationToken,
        channel: &str,
        mut msg: Message,
    ) -> Result<(), BusError> {
        if self.cancel.is_cancelled() {
            return Err(BusError::Closed);
        }

        msg.channel = channel.to_string();
        msg.timestamp = Utc::now();

        tokio::select! {
            permit = self.tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(msg);
                    Ok(())
                }
                Err(_) => Err(BusError::Closed),
            },
            _ = cancel.cancelled() => Err(BusError::Cancelled),
            _ = self.cancel.cancelled() => Err(BusError::Closed),
            _ = tokio::time::sleep(PUBLISH_TIMEOUT) => Err(BusError::Timeout),
        }
    }

    /// 订阅 topic，返回唯一 handler ID
    pub async fn subscribe(&self, channel: &str, handler: MessageHandler) -> String {
        let handler_id = format!("{}-{}", channel, uuid::Uuid::new_v4());
        let mut subs = self.subscribers.write().await;
        subs.entry(channel.to_string())
            .or_default()
            .insert(handler_id.clone(), handler);
        handler_id
    }

    /// 取消订阅；handler 不存在返回 HandlerNotFound
    pub async fn unsubscribe(&self, channel: &str, handler_id: &str) -> Result<(), BusError> {
        let mut subs = self.subscribers.write().await;
        if let Some(handlers) = subs.get_mut(channel) {
            if handlers.remove(handler_id).is_some() {
                return Ok(());
            }
        }
        Err(BusError::HandlerNotFound(handler_id.to_string()))
    }

    /// 关闭：取消分发循环，等待在途 handler 任务排空，此后 publish 失败
    pub async fn close(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("message bus closed");
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// 将异步闭包包装为 MessageHandler
pub fn handler_fn<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(CancellationToken, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    Arc::new(move |token, msg| Box::pin(f(token, msg)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn test_publish_fans_out_to_all_subscribers() {
        let bus = MessageBus::new();
        bus.start().await;

        let (tx, mut rx) = unbounded_channel();
        for _ in 0..3 {
            let tx = tx.clone();
            bus.subscribe(
                "t",
                handler_fn(move |_, msg: Message| {
                    let tx = tx.clone();
                    async move {
                        tx.send(msg).map_err(|e| e.to_string())?;
                        Ok(())
                    }
                }),
            )
            .await;
        }

        let cancel = CancellationToken::new();
        bus.publish(&cancel, "t", Message::new("", "c1", "hello"))
            .await
            .unwrap();

        for _ in 0..3 {
            let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(msg.channel, "t");
            assert_eq!(msg.chat_id, "c1");
            assert!(msg.timestamp.timestamp() > 0);
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = MessageBus::new();
        bus.start().await;

        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let id = bus
            .subscribe(
                "t",
                handler_fn(move |_, _| {
                    let c = Arc::clone(&c);
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .await;

        let cancel = CancellationToken::new();
        bus.publish(&cancel, "t", Message::new("", "c", "one"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        bus.unsubscribe("t", &id).await.unwrap();
        bus.publish(&cancel, "t", Message::new("", "c", "two"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // 二次退订报 HandlerNotFound
        assert!(matches!(
            bus.unsubscribe("t", &id).await,
            Err(BusError::HandlerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_after_close_fails() {
        let bus = MessageBus::new();
        bus.start().await;
        bus.close().await;

        let cancel = CancellationToken::new();
        assert!(matches!(
            bus.publish(&cancel, "t", Message::new("", "c", "x")).await,
            Err(BusError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_publish_cancelled_by_caller() {
        let bus = MessageBus::new();
        // 不启动分发循环，让队列灌满后 publish 悬挂
        let cancel = CancellationToken::new();
        for i in 0..QUEUE_CAPACITY {
            bus.publish(&cancel, "t", Message::new("", "c", format!("{}", i)))
                .await
                .unwrap();
        }

        cancel.cancel();
        assert!(matches!(
            bus.publish(&cancel, "t", Message::new("", "c", "overflow")).await,
            Err(BusError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_metadata_preserved_through_dispatch() {
        let bus = MessageBus::new();
        bus.start().await;

        let (tx, mut rx) = unbounded_channel();
        bus.subscribe(
            "t",
            handler_fn(move |_, msg: Message| {
                let tx = tx.clone();
                async move {
                    tx.send(msg).map_err(|e| e.to_string())?;
                    Ok(())
                }
            }),
        )
        .await;

        let mut msg = Message::new("", "c", "payload");
        msg.metadata.insert("source".to_string(), serde_json::json!("unit-test"));

        let cancel = CancellationToken::new();
        bus.publish(&cancel, "t", msg).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.metadata["source"], "unit-test");
    }

    #[tokio::test]
    async fn test_subscribe_while_running() {
        let bus = MessageBus::new();
        bus.start().await;

        let cancel = CancellationToken::new();
        // 无订阅者时发布不报错
        bus.publish(&cancel, "t", Message::new("", "c", "lost"))
            .await
            .unwrap();

        let (tx, mut rx) = unbounded_channel();
        bus.subscribe(
            "t",
            handler_fn(move |_, msg: Message| {
                let tx = tx.clone();
                async move {
                    tx.send(msg.content).map_err(|e| e.to_string())?;
                    Ok(())
                }
            }),
        )
        .await;

        bus.publish(&cancel, "t", Message::new("", "c", "delivered"))
            .await
            .unwrap();
        let content = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(content, "delivered");
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_peers() {
        let bus = MessageBus::new();
        bus.start().await;

        bus.subscribe("t", handler_fn(|_, _| async { Err("boom".to_string()) }))
            .await;

        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        bus.subscribe(
            "t",
            handler_fn(move |_, _| {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await;

        let cancel = CancellationToken::new();
        for _ in 0..2 {
            bus.publish(&cancel, "t", Message::new("", "c", "x"))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
