//! WebSocket 双向通道
//!
//! 接受升级连接，期望 JSON 帧 {type:"message", content, chat_id?}，
//! 发布到 websocket 主题；出站响应按 chat_id 匹配回原连接。
//! 服务端每 ~54s 发 ping，60s 无流量的空闲连接被关闭。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::bus::{handler_fn, Message, MessageBus, CHANNEL_WEBSOCKET};

/// 空闲判定：60s 无任何入站流量（含 pong）
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// ping 周期 = 空闲上限的 9/10
const PING_PERIOD: Duration = Duration::from_secs(54);

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub host: String,
    pub port: u16,
}

/// 入站帧
#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    chat_id: Option<String>,
}

/// 出站帧
#[derive(Debug, Serialize)]
struct OutboundFrame<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    content: &'a str,
    chat_id: &'a str,
}

type ConnectionMap = Arc<RwLock<HashMap<String, mpsc::UnboundedSender<String>>>>;

pub struct WebSocketServer {
    config: WebSocketConfig,
    bus: Arc<MessageBus>,
    connections: ConnectionMap,
    cancel: CancellationToken,
}

impl WebSocketServer {
    pub fn new(config: WebSocketConfig, bus: Arc<MessageBus>) -> Self {
        Self {
            config,
            bus,
            connections: Arc::new(RwLock::new(HashMap::new())),
            cancel: CancellationToken::new(),
        }
    }

    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "websocket server listening");

        // 出站：按 chat_id 路由回源连接
        {
            let connections = Arc::clone(&self.connections);
            self.bus
                .subscribe(
                    CHANNEL_WEBSOCKET,
                    handler_fn(move |_, msg: Message| {
                        let connections = Arc::clone(&connections);
                        async move {
                            if !msg.id.starts_with("agent-") {
                                return Ok(());
                            }
                            let frame = serde_json::to_string(&OutboundFrame {
                                kind: "message",
                                content: &msg.content,
                                chat_id: &msg.chat_id,
                            })
                            .map_err(|e| e.to_string())?;

                            let connections = connections.read().await;
                            if let Some(tx) = connections.get(&msg.chat_id) {
                                let _ = tx.send(frame);
                            } else {
                                tracing::warn!(chat_id = %msg.chat_id, "no websocket connection for response");
                            }
                            Ok(())
                        }
                    }),
                )
                .await;
        }

        // accept 循环
        let server = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = server.cancel.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let server = Arc::clone(&server);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    tracing::warn!(peer = %peer, error = %e, "websocket connection error");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "websocket accept failed");
                        }
                    }
                }
            }
        });

        Ok(())
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        self.connections.write().await.clear();
        tracing::info!("websocket server stopped");
    }

    async fn handle_connection(&self, stream: TcpStream) -> anyhow::Result<()> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        // 未声明 chat_id 的连接使用生成的会话号
        let mut chat_id = format!("ws-{}", uuid::Uuid::new_v4());
        self.connections.write().await.insert(chat_id.clone(), tx.clone());
        tracing::info!(chat_id = %chat_id, "websocket connection established");

        // 写半边 + 周期 ping
        let writer = tokio::spawn(async move {
            let mut ping = tokio::time::interval(PING_PERIOD);
            ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    frame = rx.recv() => {
                        let Some(frame) = frame else { return };
                        if ws_tx.send(WsMessage::Text(frame)).await.is_err() {
                            return;
                        }
                    }
                    _ = ping.tick() => {
                        if ws_tx.send(WsMessage::Ping(Vec::new())).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        // 读半边：空闲超时即断开
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(IDLE_TIMEOUT) => {
                    tracing::info!(chat_id = %chat_id, "closing idle websocket connection");
                    break;
                }
                frame = ws_rx.next() => frame,
            };

            let Some(frame) = frame else { break };
            let frame = match frame {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(error = %e, "websocket receive error");
                    break;
                }
            };

            match frame {
                WsMessage::Text(text) => {
                    let inbound: InboundFrame = match serde_json::from_str(&text) {
                        Ok(f) => f,
                        Err(e) => {
                            tracing::warn!(error = %e, "invalid websocket frame");
                            continue;
                        }
                    };
                    if inbound.kind != "message" || inbound.content.is_empty() {
                        continue;
                    }

                    // 帧可自带 chat_id；变化时迁移连接注册
                    if let Some(declared) = inbound.chat_id {
                        if declared != chat_id {
                            let mut connections = self.connections.write().await;
                            connections.remove(&chat_id);
                            connections.insert(declared.clone(), tx.clone());
                            chat_id = declared;
                        }
                    }

                    let msg = Message::new("", &chat_id, inbound.content);
                    let cancel = self.cancel.child_token();
                    if let Err(e) = self.bus.publish(&cancel, CHANNEL_WEBSOCKET, msg).await {
                        tracing::warn!(error = %e, "failed to publish websocket message");
                    }
                }
                WsMessage::Close(_) => break,
                // Ping 由 tungstenite 自动回 Pong；Pong 仅刷新空闲计时
                _ => {}
            }
        }

        self.connections.write().await.remove(&chat_id);
        writer.abort();
        tracing::info!(chat_id = %chat_id, "websocket connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_frame_parsing() {
        let frame: InboundFrame =
            serde_json::from_str(r#"{"type":"message","content":"hi","chat_id":"c1"}"#).unwrap();
        assert_eq!(frame.kind, "message");
        assert_eq!(frame.content, "hi");
        assert_eq!(frame.chat_id.as_deref(), Some("c1"));

        let frame: InboundFrame = serde_json::from_str(r#"{"type":"message","content":"hi"}"#).unwrap();
        assert!(frame.chat_id.is_none());
    }

    #[test]
    fn test_outbound_frame_shape() {
        let frame = serde_json::to_string(&OutboundFrame {
            kind: "message",
            content: "reply",
            chat_id: "c1",
        })
        .unwrap();
        assert!(frame.contains(r#""type":"message""#));
        assert!(frame.contains(r#""chat_id":"c1""#));
    }
}
