//! 上下文构建器
//!
//! 每轮对话构建一次系统前导：SOUL.md 人格 + USER.md 用户约定 +（非空时）
//! AGENTS.md，然后依次拼装 Memory、最近七天的每日笔记、工具目录与
//! JSON 回复契约。Agent 的解析器（thought / tool_calls / final_answer）
//! 依赖这里给出的输出格式说明。

use std::sync::Arc;

use crate::storage::{MemoryStorage, Storage};
use crate::tools::ToolSchema;

const SOUL_PATH: &str = "config/SOUL.md";
const USER_PATH: &str = "config/USER.md";
const AGENTS_PATH: &str = "config/AGENTS.md";
/// 注入最近几天的每日笔记（含今天）
const DAILY_NOTE_DAYS: i64 = 7;

/// 单轮对话的上下文包
#[derive(Debug, Clone, Default)]
pub struct AgentContext {
    pub persona: String,
    pub memory: String,
    pub daily_notes: Vec<String>,
}

pub struct ContextBuilder {
    storage: Arc<dyn Storage>,
    memory: Arc<dyn MemoryStorage>,
}

impl ContextBuilder {
    pub fn new(storage: Arc<dyn Storage>, memory: Arc<dyn MemoryStorage>) -> Self {
        Self { storage, memory }
    }

    /// 加载持久化素材；SOUL.md 缺失视为错误（按约定必须存在）
    pub async fn build(&self) -> anyhow::Result<AgentContext> {
        let soul = self.read_text(SOUL_PATH).await?;
        let user = self.read_text(USER_PATH).await.unwrap_or_default();
        let agents = self.read_text(AGENTS_PATH).await.unwrap_or_default();

        let mut persona = soul;
        if !user.is_empty() {
            persona = format!("{}\n\n{}", persona, user);
        }
        if !agents.is_empty() {
            persona = format!("{}\n\n{}", persona, agents);
        }

        let memory = self.memory.get_memory().await.unwrap_or_default();

        // 今天与之前六天，空笔记跳过
        let mut daily_notes = Vec::new();
        for i in 0..DAILY_NOTE_DAYS {
            let date = (chrono::Local::now() - chrono::Duration::days(i))
                .format("%Y-%m-%d")
                .to_string();
            match self.memory.get_daily_note(&date).await {
                Ok(note) if !note.is_empty() => {
                    daily_notes.push(format!("## {}\n{}", date, note));
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(date = %date, error = %e, "failed to read daily note");
                }
            }
        }

        Ok(AgentContext { persona, memory, daily_notes })
    }

    async fn read_text(&self, path: &str) -> anyhow::Result<String> {
        let bytes = self.storage.read_file(path).await?;
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }
}

impl AgentContext {
    /// 粗略 token 估算（字符数 / 4），用于日志与上下文预算判断
    pub fn token_estimate(&self, tools: &[ToolSchema]) -> usize {
        let mut chars = self.persona.len() + self.memory.len();
        chars += self.daily_notes.iter().map(|n| n.len()).sum::<usize>();
        chars += tools
            .iter()
            .map(|t| t.name.len() + t.description.len() + t.parameters.to_string().len())
            .sum::<usize>();
        chars / 4
    }

    /// 组装最终系统提示词：人格、Memory、Recent Notes、Available Tools 与回复契约
    pub fn build_system_prompt(&self, tools: &[ToolSchema]) -> String {
        let mut prompt = String::new();
        prompt.push_str(&self.persona);
        prompt.push_str("\n\n");

        if !self.memory.is_empty() {
            prompt.push_str("## Memory\n");
            prompt.push_str(&self.memory);
            prompt.push_str("\n\n");
        }

        if !self.daily_notes.is_empty() {
            prompt.push_str("## Recent Notes\n");
            for note in &self.daily_notes {
                prompt.push_str(note);
                prompt.push_str("\n\n");
            }
        }

        if !tools.is_empty() {
            prompt.push_str("## Available Tools\n");
            prompt.push_str("You have access to the following tools:\n\n");
            for tool in tools {
                prompt.push_str(&format!("- **{}**: {}\n", tool.name, tool.description));
            }
            prompt.push('\n');
            prompt.push_str(
                r#"When you need to use a tool, respond in the following JSON format:
{
  "thought": "Your reasoning about what to do",
  "tool_calls": [
    {
      "name": "tool_name",
      "input": {
        "param1": "value1",
        "param2": "value2"
      }
    }
  ]
}

When you have a final answer and don't need to use any more tools, respond in the following JSON format:
{
  "thought": "Your reasoning",
  "final_answer": "Your final answer to the user"
}
"#,
            );
        }

        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileMemoryStorage, FileStorage};
    use serde_json::json;

    async fn setup(dir: &std::path::Path) -> ContextBuilder {
        let storage = FileStorage::new(dir);
        storage
            .write_file("config/SOUL.md", b"You are Wasp.")
            .await
            .unwrap();
        storage
            .write_file("config/USER.md", b"The user prefers brevity.")
            .await
            .unwrap();
        ContextBuilder::new(
            Arc::new(FileStorage::new(dir)),
            Arc::new(FileMemoryStorage::new(dir)),
        )
    }

    #[tokio::test]
    async fn test_soul_required() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ContextBuilder::new(
            Arc::new(FileStorage::new(dir.path())),
            Arc::new(FileMemoryStorage::new(dir.path())),
        );
        assert!(builder.build().await.is_err());
    }

    #[tokio::test]
    async fn test_prompt_sections() {
        let dir = tempfile::tempdir().unwrap();
        let builder = setup(dir.path()).await;

        let memory = FileMemoryStorage::new(dir.path());
        memory.set_memory("User name is Ada.").await.unwrap();
        let today = chrono::Local::now().format("%Y-%m-%d").to_string();
        memory.set_daily_note(&today, "Wrote tests.").await.unwrap();

        let ctx = builder.build().await.unwrap();
        let tools = vec![ToolSchema {
            name: "echo".to_string(),
            description: "Echo back the provided message".to_string(),
            parameters: json!({"type": "object"}),
        }];
        let prompt = ctx.build_system_prompt(&tools);

        assert!(prompt.starts_with("You are Wasp."));
        assert!(prompt.contains("The user prefers brevity."));
        assert!(prompt.contains("## Memory\nUser name is Ada."));
        assert!(prompt.contains(&format!("## {}", today)));
        assert!(prompt.contains("- **echo**: Echo back the provided message"));
        assert!(prompt.contains(r#""final_answer": "Your final answer to the user""#));
    }

    #[tokio::test]
    async fn test_token_estimate_scales_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let builder = setup(dir.path()).await;
        let ctx = builder.build().await.unwrap();

        let empty = ctx.token_estimate(&[]);
        let with_tool = ctx.token_estimate(&[ToolSchema {
            name: "echo".to_string(),
            description: "Echo back the provided message".to_string(),
            parameters: json!({"type": "object"}),
        }]);
        assert!(with_tool > empty);
    }

    #[tokio::test]
    async fn test_empty_sections_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let builder = setup(dir.path()).await;

        let ctx = builder.build().await.unwrap();
        let prompt = ctx.build_system_prompt(&[]);

        assert!(!prompt.contains("## Memory"));
        assert!(!prompt.contains("## Recent Notes"));
        assert!(!prompt.contains("## Available Tools"));
    }
}
