//! Telegram 长轮询通道
//!
//! 后台循环调用 getUpdates（30s 长轮询），把每条文本更新发布到 telegram 主题
//! （chat_id 为数字会话号转字符串）；出站订阅者经 sendMessage 回发，
//! 超过 4096 字符的响应切成连续片段。

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::bus::{handler_fn, Message, MessageBus, CHANNEL_TELEGRAM};

const API_BASE: &str = "https://api.telegram.org";
/// Telegram 单条消息上限
const MAX_MESSAGE_LEN: usize = 4096;
/// 长轮询超时（秒）
const POLL_TIMEOUT_SECS: u64 = 30;
/// 轮询出错后的退避
const POLL_RETRY_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub token: String,
    pub api_base: String,
}

impl TelegramConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_base: API_BASE.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<TgMessage>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    chat: TgChat,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
}

pub struct TelegramBot {
    config: TelegramConfig,
    client: Client,
    bus: Arc<MessageBus>,
    cancel: CancellationToken,
}

/// 按字符数把长文本切成 <= MAX_MESSAGE_LEN 的连续片段
pub fn split_message(text: &str) -> Vec<String> {
    if text.chars().count() <= MAX_MESSAGE_LEN {
        return vec![text.to_string()];
    }
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(MAX_MESSAGE_LEN)
        .map(|c| c.iter().collect())
        .collect()
}

impl TelegramBot {
    pub fn new(config: TelegramConfig, bus: Arc<MessageBus>) -> Self {
        let client = Client::builder()
            // 长轮询 30s，再留网络余量
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .build()
            .unwrap_or_default();
        Self {
            config,
            client,
            bus,
            cancel: CancellationToken::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.config.api_base, self.config.token, method)
    }

    /// 启动轮询循环并订阅出站消息
    pub async fn start(self: &Arc<Self>) {
        // 出站：telegram 主题上 agent 发布的响应回发给用户
        {
            let bot = Arc::clone(self);
            self.bus
                .subscribe(
                    CHANNEL_TELEGRAM,
                    handler_fn(move |_, msg: Message| {
                        let bot = Arc::clone(&bot);
                        async move {
                            if !msg.id.starts_with("agent-") {
                                return Ok(());
                            }
                            bot.send_message(&msg.chat_id, &msg.content).await
                        }
                    }),
                )
                .await;
        }

        // 入站：长轮询循环
        let bot = Arc::clone(self);
        tokio::spawn(async move {
            let mut offset: i64 = 0;
            loop {
                tokio::select! {
                    _ = bot.cancel.cancelled() => return,
                    result = bot.poll_updates(offset) => match result {
                        Ok(updates) => {
                            for update in updates {
                                offset = offset.max(update.update_id + 1);
                                bot.dispatch_update(update).await;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "telegram poll failed");
                            tokio::time::sleep(POLL_RETRY_DELAY).await;
                        }
                    }
                }
            }
        });

        tracing::info!("telegram bot started");
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        tracing::info!("telegram bot stopped");
    }

    async fn poll_updates(&self, offset: i64) -> Result<Vec<Update>, String> {
        let resp = self
            .client
            .get(self.api_url("getUpdates"))
            .query(&[("timeout", POLL_TIMEOUT_SECS.to_string()), ("offset", offset.to_string())])
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = resp.status();
        if !status.is_success() {
            return Err(format!("getUpdates failed with status {}", status.as_u16()));
        }

        let parsed: UpdatesResponse = resp.json().await.map_err(|e| e.to_string())?;
        if !parsed.ok {
            return Err("getUpdates returned ok=false".to_string());
        }
        Ok(parsed.result)
    }

    async fn dispatch_update(&self, update: Update) {
        let Some(message) = update.message else { return };
        let Some(text) = message.text else { return };

        let msg = Message::new("", message.chat.id.to_string(), text);
        let cancel = self.cancel.child_token();
        if let Err(e) = self.bus.publish(&cancel, CHANNEL_TELEGRAM, msg).await {
            tracing::warn!(error = %e, "failed to publish telegram update");
        }
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), String> {
        for segment in split_message(text) {
            let resp = self
                .client
                .post(self.api_url("sendMessage"))
                .json(&json!({ "chat_id": chat_id, "text": segment }))
                .send()
                .await
                .map_err(|e| e.to_string())?;

            if !resp.status().is_success() {
                return Err(format!("sendMessage failed with status {}", resp.status().as_u16()));
            }
        }
        Ok(())
    }
}
