//! 传输通道：外部消息格式与总线规范消息之间的薄转换层
//!
//! - telegram：Bot API 长轮询
//! - websocket：双向 socket 服务
//! - cli：本地交互式行读取

mod cli;
mod telegram;
mod websocket;

pub use cli::CliChannel;
pub use telegram::{split_message, TelegramBot, TelegramConfig};
pub use websocket::{WebSocketConfig, WebSocketServer};
