//! 本地交互通道
//!
//! 逐行读取标准输入：`send <text>` 作为用户消息发布到 cli 主题，
//! 同主题上送达的响应直接打印；`exit` / `quit` 正常结束读取循环。

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::bus::{handler_fn, Message, MessageBus, CHANNEL_CLI};

const PROMPT: &str = "wasp> ";
const CHAT_ID: &str = "cli";

pub struct CliChannel {
    bus: Arc<MessageBus>,
    cancel: CancellationToken,
}

impl CliChannel {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            bus,
            cancel: CancellationToken::new(),
        }
    }

    /// 订阅响应打印并启动读取循环
    pub async fn start(self: &Arc<Self>) {
        self.bus
            .subscribe(
                CHANNEL_CLI,
                handler_fn(move |_, msg: Message| async move {
                    if msg.id.starts_with("agent-") {
                        println!("\n{}\n{}", msg.content, PROMPT);
                    }
                    Ok(())
                }),
            )
            .await;

        let channel = Arc::clone(self);
        tokio::spawn(async move {
            channel.read_loop().await;
        });

        tracing::info!("cli channel started");
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn read_loop(&self) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        println!("Type `send <message>` to talk, `exit` to quit.");
        print!("{}", PROMPT);

        loop {
            let line = tokio::select! {
                _ = self.cancel.cancelled() => return,
                line = lines.next_line() => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => return, // EOF
                Err(e) => {
                    tracing::warn!(error = %e, "stdin read failed");
                    return;
                }
            };

            match self.handle_line(line.trim()).await {
                LoopAction::Continue => print!("{}", PROMPT),
                LoopAction::Exit => return,
            }
        }
    }

    async fn handle_line(&self, line: &str) -> LoopAction {
        if line.is_empty() {
            return LoopAction::Continue;
        }

        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((cmd, rest)) => (cmd, rest.trim()),
            None => (line, ""),
        };

        match command {
            // exit 是正常的循环终止，不是错误
            "exit" | "quit" => {
                println!("bye");
                LoopAction::Exit
            }
            "send" => {
                if rest.is_empty() {
                    println!("usage: send <message>");
                    return LoopAction::Continue;
                }
                let msg = Message::new("", CHAT_ID, rest);
                if let Err(e) = self.bus.publish(&self.cancel, CHANNEL_CLI, msg).await {
                    println!("failed to send: {}", e);
                }
                LoopAction::Continue
            }
            "help" => {
                println!("commands:\n  send <message>  talk to the agent\n  exit            quit");
                LoopAction::Continue
            }
            other => {
                println!("unknown command: {} (try `help`)", other);
                LoopAction::Continue
            }
        }
    }
}

enum LoopAction {
    Continue,
    Exit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_publishes_to_cli_topic() {
        let bus = Arc::new(MessageBus::new());
        bus.start().await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(
            CHANNEL_CLI,
            handler_fn(move |_, msg: Message| {
                let tx = tx.clone();
                async move {
                    tx.send(msg).map_err(|e| e.to_string())?;
                    Ok(())
                }
            }),
        )
        .await;

        let channel = CliChannel::new(Arc::clone(&bus));
        assert!(matches!(channel.handle_line("send hello world").await, LoopAction::Continue));

        let msg = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.chat_id, "cli");
        assert_eq!(msg.content, "hello world");
        assert_eq!(msg.channel, CHANNEL_CLI);
    }

    #[tokio::test]
    async fn test_exit_terminates_loop() {
        let bus = Arc::new(MessageBus::new());
        let channel = CliChannel::new(bus);
        assert!(matches!(channel.handle_line("exit").await, LoopAction::Exit));
        assert!(matches!(channel.handle_line("quit").await, LoopAction::Exit));
        assert!(matches!(channel.handle_line("help").await, LoopAction::Continue));
        assert!(matches!(channel.handle_line("bogus").await, LoopAction::Continue));
    }
}
