//! Agent 核心：ReAct 循环与通道绑定
//!
//! 订阅各传输通道，把一条入站用户消息转成一条出站助手消息：
//! 加载会话历史（带内存缓存）-> 构建系统前导（人格 + 记忆 + 技能 + 工具目录）->
//! 有界迭代（LLM 调用 -> 解析 -> 工具执行 -> 观察写回）-> 持久化 -> 原通道发布。
//! 外层 handler 把任何回合错误转成人类可读消息发回原通道，而不向总线泄漏。

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::bus::{handler_fn, Message, MessageBus, CHANNEL_CLI, CHANNEL_SCHEDULE, CHANNEL_TELEGRAM, CHANNEL_WEBSOCKET};
use crate::context::{AgentContext, ContextBuilder};
use crate::llm::{ChatMessage, LlmError, MultiModelManager, Role};
use crate::skills::{Skill, SkillSelector};
use crate::storage::SessionStorage;
use crate::tools::{ToolCall, ToolExecutor};

/// 单轮最大 ReAct 迭代数
const DEFAULT_MAX_ITERATIONS: usize = 10;
/// 首次访问会话时从存储回灌的最大条数
const HISTORY_HYDRATE_LIMIT: usize = 50;
/// 未配置 LLM 时的固定答复
const NO_LLM_NOTICE: &str = "LLM is not configured. Please set up your API key in the configuration.";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("max iterations ({0}) reached without final answer")]
    MaxIterations(usize),
    #[error("LLM request failed: {0}")]
    Llm(#[from] LlmError),
    #[error("failed to publish response: {0}")]
    Publish(#[from] crate::bus::BusError),
}

/// LLM 回复的约定形状；解析失败或无工具调用即视为最终回答
#[derive(Debug, Default, Deserialize)]
struct ParsedResponse {
    #[serde(default)]
    #[allow(dead_code)]
    thought: String,
    #[serde(default)]
    tool_calls: Vec<ToolCallRequest>,
    #[serde(default)]
    final_answer: String,
}

#[derive(Debug, Deserialize)]
struct ToolCallRequest {
    name: String,
    #[serde(default)]
    input: Value,
}

pub struct AgentConfig {
    pub max_iterations: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { max_iterations: DEFAULT_MAX_ITERATIONS }
    }
}

pub struct Agent {
    bus: Arc<MessageBus>,
    llm: Option<Arc<MultiModelManager>>,
    executor: Arc<ToolExecutor>,
    context_builder: Arc<ContextBuilder>,
    skill_selector: Option<Arc<SkillSelector>>,
    session_storage: Arc<dyn SessionStorage>,
    chat_history: RwLock<HashMap<String, Vec<ChatMessage>>>,
    max_iterations: usize,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        bus: Arc<MessageBus>,
        llm: Option<Arc<MultiModelManager>>,
        executor: Arc<ToolExecutor>,
        context_builder: Arc<ContextBuilder>,
        skill_selector: Option<Arc<SkillSelector>>,
        session_storage: Arc<dyn SessionStorage>,
    ) -> Self {
        let max_iterations = if config.max_iterations == 0 {
            DEFAULT_MAX_ITERATIONS
        } else {
            config.max_iterations
        };
        Self {
            bus,
            llm,
            executor,
            context_builder,
            skill_selector,
            session_storage,
            chat_history: RwLock::new(HashMap::new()),
            max_iterations,
        }
    }

    /// 订阅全部入站通道（含调度器保留通道）
    pub async fn start(self: &Arc<Self>) {
        match &self.llm {
            Some(llm) => {
                tracing::info!(provider = %llm.provider().await, model = %llm.model().await, "agent started");
            }
            None => tracing::info!("agent started without LLM support"),
        }

        for channel in [CHANNEL_CLI, CHANNEL_TELEGRAM, CHANNEL_WEBSOCKET, CHANNEL_SCHEDULE] {
            let agent = Arc::clone(self);
            self.bus
                .subscribe(
                    channel,
                    handler_fn(move |token, msg| {
                        let agent = Arc::clone(&agent);
                        async move { agent.handle_message(token, msg).await.map_err(|e| e.to_string()) }
                    }),
                )
                .await;
        }
    }

    pub async fn stop(&self) {
        tracing::info!("agent stopped");
    }

    /// 入站消息处理；自身发布的响应（agent- 前缀）直接忽略，避免回声循环
    pub async fn handle_message(&self, cancel: CancellationToken, msg: Message) -> Result<(), String> {
        if msg.id.starts_with("agent-") {
            return Ok(());
        }

        tracing::info!(channel = %msg.channel, chat_id = %msg.chat_id, "agent received message");

        let Some(llm) = self.llm.clone() else {
            let reply = Message::new(&msg.channel, &msg.chat_id, NO_LLM_NOTICE)
                .with_id(format!("agent-{}", msg.id));
            return self
                .bus
                .publish(&cancel, &msg.channel, reply)
                .await
                .map_err(|e| e.to_string());
        };

        match self.run_turn(&cancel, &llm, &msg).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // 错误不向总线泄漏：转成人类可读答复发回原通道
                tracing::error!(error = %e, chat_id = %msg.chat_id, "turn failed");
                let reply = Message::new(&msg.channel, &msg.chat_id, format!("Sorry, something went wrong: {}", e))
                    .with_id(format!("agent-{}", msg.id));
                self.bus
                    .publish(&cancel, &msg.channel, reply)
                    .await
                    .map_err(|e| e.to_string())
            }
        }
    }

    async fn run_turn(
        &self,
        cancel: &CancellationToken,
        llm: &MultiModelManager,
        msg: &Message,
    ) -> Result<(), AgentError> {
        let mut working = self.history_for(&msg.chat_id).await;
        let turn_start = working.len();

        working.push(ChatMessage::user(&msg.content));

        let response = self.run_react_loop(cancel, llm, &mut working, &msg.content).await?;

        tracing::info!(chat_id = %msg.chat_id, "final response ready");
        working.push(ChatMessage::assistant(&response));

        // 本轮新增条目先落盘，再发布响应：持久化历史总是覆盖已发出的内容
        for entry in &working[turn_start..] {
            if let Err(e) = self
                .session_storage
                .save_message(&msg.chat_id, entry.role.as_str(), &entry.content)
                .await
            {
                tracing::warn!(chat_id = %msg.chat_id, error = %e, "failed to save message");
            }
        }
        self.chat_history
            .write()
            .await
            .insert(msg.chat_id.clone(), working);

        let reply = Message::new(&msg.channel, &msg.chat_id, response).with_id(format!("agent-{}", msg.id));
        self.bus.publish(cancel, &msg.channel, reply).await?;
        Ok(())
    }

    async fn run_react_loop(
        &self,
        cancel: &CancellationToken,
        llm: &MultiModelManager,
        working: &mut Vec<ChatMessage>,
        user_message: &str,
    ) -> Result<String, AgentError> {
        let tools = self.executor.schemas().await;

        let context = match self.context_builder.build().await {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::warn!(error = %e, "failed to build context, using empty context");
                AgentContext::default()
            }
        };
        let mut system_prompt = context.build_system_prompt(&tools);

        if let Some(selector) = &self.skill_selector {
            match selector.select(user_message).await {
                Ok(skills) if !skills.is_empty() => {
                    tracing::info!(count = skills.len(), "skills selected");
                    system_prompt.push_str("\n\n");
                    system_prompt.push_str(&build_skill_context(&skills));
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "skill selection failed");
                }
            }
        }

        for iteration in 0..self.max_iterations {
            tracing::debug!(iteration = iteration + 1, max = self.max_iterations, "react iteration");

            let mut messages = Vec::with_capacity(working.len() + 1);
            messages.push(ChatMessage::system(&system_prompt));
            messages.extend(working.iter().cloned());

            let response = llm.complete(messages).await?;
            let content = response.content;

            let parsed: ParsedResponse = match serde_json::from_str(&content) {
                Ok(p) => p,
                Err(e) => {
                    // 非 JSON 正文：按原样作为最终回答
                    tracing::debug!(error = %e, "response is not the JSON contract, treating as final");
                    return Ok(content);
                }
            };

            if !parsed.final_answer.is_empty() {
                return Ok(parsed.final_answer);
            }
            if parsed.tool_calls.is_empty() {
                return Ok(content);
            }

            // 顺序执行全部调用；单个失败只记入该条记录，不中断批次
            let mut results: Vec<ToolCall> = Vec::with_capacity(parsed.tool_calls.len());
            for call in &parsed.tool_calls {
                tracing::info!(tool = %call.name, "executing tool");
                let record = match self
                    .executor
                    .execute(cancel.child_token(), &call.name, call.input.clone())
                    .await
                {
                    Ok(record) => record,
                    Err(e) => ToolCall {
                        name: call.name.clone(),
                        input: call.input.clone(),
                        error: e.to_string(),
                        ..Default::default()
                    },
                };
                results.push(record);
            }

            let results_json = serde_json::to_string_pretty(&results)
                .unwrap_or_else(|_| "[]".to_string());

            working.push(ChatMessage::assistant(&content));
            working.push(ChatMessage::user(format!("Tool execution results:\n{}", results_json)));
        }

        Err(AgentError::MaxIterations(self.max_iterations))
    }

    /// 会话历史：命中缓存直接用，否则从会话存储回灌最近 50 条
    async fn history_for(&self, chat_id: &str) -> Vec<ChatMessage> {
        if let Some(history) = self.chat_history.read().await.get(chat_id) {
            return history.clone();
        }

        let stored = match self
            .session_storage
            .get_messages(chat_id, HISTORY_HYDRATE_LIMIT)
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(chat_id, error = %e, "failed to load session history");
                return Vec::new();
            }
        };

        let history: Vec<ChatMessage> = stored
            .into_iter()
            .filter_map(|m| {
                m.role.parse::<Role>().ok().map(|role| ChatMessage {
                    role,
                    content: m.content,
                })
            })
            .collect();

        self.chat_history
            .write()
            .await
            .insert(chat_id.to_string(), history.clone());
        history
    }

    pub async fn chat_history(&self, chat_id: &str) -> Vec<ChatMessage> {
        self.history_for(chat_id).await
    }

    /// 显式清除：内存缓存与持久化会话一并清空
    pub async fn clear_chat_history(&self, chat_id: &str) {
        self.chat_history.write().await.remove(chat_id);
        if let Err(e) = self.session_storage.clear_session(chat_id).await {
            tracing::warn!(chat_id, error = %e, "failed to clear session");
        }
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }
}

/// 选中技能拼装为 Active Skills 段落
fn build_skill_context(skills: &[Skill]) -> String {
    let mut out = String::from("## Active Skills\n\n");
    out.push_str("The following skills have been activated for this conversation:\n\n");

    for skill in skills {
        out.push_str(&format!("### {}\n", skill.name));
        out.push_str(&format!("**Description**: {}\n", skill.description));
        if !skill.category.is_empty() {
            out.push_str(&format!("**Category**: {}\n", skill.category));
        }
        if !skill.tags.is_empty() {
            out.push_str(&format!("**Tags**: {}\n", skill.tags.join(", ")));
        }
        out.push_str(&format!("**Instructions**:\n{}\n\n", skill.content));
    }

    out.push_str(
        "Use these skills as guidelines when responding to the user. \
         Adapt your approach based on the specific requirements of each skill.\n",
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockProvider;
    use crate::storage::{FileMemoryStorage, FileSessionStorage, FileStorage, Storage};
    use crate::tools::{EchoTool, ToolRegistry};

    struct TestHarness {
        agent: Arc<Agent>,
        bus: Arc<MessageBus>,
        replies: tokio::sync::mpsc::UnboundedReceiver<Message>,
        _dir: tempfile::TempDir,
    }

    impl TestHarness {
        /// 经总线发一条用户消息，等待 agent- 前缀的响应
        async fn send(&mut self, chat_id: &str, content: &str) -> Message {
            let cancel = CancellationToken::new();
            self.bus
                .publish(&cancel, CHANNEL_CLI, Message::new("", chat_id, content))
                .await
                .unwrap();
            tokio::time::timeout(std::time::Duration::from_secs(3), self.replies.recv())
                .await
                .expect("no agent reply")
                .expect("reply channel closed")
        }
    }

    async fn harness(script: Vec<Result<String, LlmError>>) -> TestHarness {
        let dir = tempfile::tempdir().unwrap();

        let storage = FileStorage::new(dir.path());
        storage.write_file("config/SOUL.md", b"You are Wasp.").await.unwrap();
        storage.write_file("config/USER.md", b"").await.unwrap();

        let bus = Arc::new(MessageBus::new());
        bus.start().await;

        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(EchoTool)).await.unwrap();
        let executor = Arc::new(ToolExecutor::new(registry));

        let llm = Arc::new(MultiModelManager::with_provider(
            "mock",
            Arc::new(MockProvider::with_script(script)),
        ));

        let context_builder = Arc::new(ContextBuilder::new(
            Arc::new(FileStorage::new(dir.path())),
            Arc::new(FileMemoryStorage::new(dir.path())),
        ));
        let session_storage = Arc::new(FileSessionStorage::new(dir.path()));

        let agent = Arc::new(Agent::new(
            AgentConfig { max_iterations: 3 },
            Arc::clone(&bus),
            Some(llm),
            executor,
            context_builder,
            None,
            session_storage,
        ));
        agent.start().await;

        let (tx, replies) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(
            CHANNEL_CLI,
            handler_fn(move |_, msg: Message| {
                let tx = tx.clone();
                async move {
                    if msg.id.starts_with("agent-") {
                        tx.send(msg).map_err(|e| e.to_string())?;
                    }
                    Ok(())
                }
            }),
        )
        .await;

        TestHarness { agent, bus, replies, _dir: dir }
    }

    #[tokio::test]
    async fn test_final_answer_path() {
        let mut h = harness(vec![Ok(r#"{"thought":"","final_answer":"Hello!"}"#.to_string())]).await;
        let reply = h.send("c1", "Hi").await;
        assert_eq!(reply.content, "Hello!");
        assert_eq!(reply.chat_id, "c1");
        assert_eq!(reply.channel, CHANNEL_CLI);
    }

    #[tokio::test]
    async fn test_parse_failure_returns_raw() {
        let mut h = harness(vec![Ok("plain text answer".to_string())]).await;
        let reply = h.send("c1", "Hi").await;
        assert_eq!(reply.content, "plain text answer");
    }

    #[tokio::test]
    async fn test_empty_tool_calls_returns_raw() {
        let raw = r#"{"thought":"hmm","tool_calls":[]}"#;
        let mut h = harness(vec![Ok(raw.to_string())]).await;
        let reply = h.send("c1", "Hi").await;
        assert_eq!(reply.content, raw);
    }

    #[tokio::test]
    async fn test_tool_round_trip() {
        let mut h = harness(vec![
            Ok(r#"{"thought":"","tool_calls":[{"name":"echo","input":{"message":"X"}}]}"#.to_string()),
            Ok(r#"{"thought":"","final_answer":"done"}"#.to_string()),
        ])
        .await;

        let reply = h.send("c1", "run echo").await;
        assert_eq!(reply.content, "done");

        // 工具观察已写回工作列表
        let history = h.agent.chat_history("c1").await;
        assert!(history
            .iter()
            .any(|m| m.content.starts_with("Tool execution results:") && m.content.contains("Echo: X")));
    }

    #[tokio::test]
    async fn test_max_iterations_reported_to_channel() {
        let call = r#"{"thought":"","tool_calls":[{"name":"echo","input":{"message":"again"}}]}"#;
        let mut h = harness(vec![
            Ok(call.to_string()),
            Ok(call.to_string()),
            Ok(call.to_string()),
            Ok(call.to_string()),
        ])
        .await;

        let reply = h.send("c1", "loop").await;
        assert!(reply.content.contains("max iterations"));
    }

    #[tokio::test]
    async fn test_failed_tool_does_not_stop_batch() {
        let mut h = harness(vec![
            Ok(r#"{"thought":"","tool_calls":[{"name":"ghost","input":{}},{"name":"echo","input":{"message":"after failure"}}]}"#.to_string()),
            Ok(r#"{"thought":"","final_answer":"ok"}"#.to_string()),
        ])
        .await;

        let reply = h.send("c1", "mixed batch").await;
        assert_eq!(reply.content, "ok");

        let history = h.agent.chat_history("c1").await;
        let observation = history
            .iter()
            .find(|m| m.content.starts_with("Tool execution results:"))
            .unwrap();
        assert!(observation.content.contains("not found"));
        assert!(observation.content.contains("Echo: after failure"));
    }

    #[tokio::test]
    async fn test_turn_entries_persisted() {
        let mut h = harness(vec![Ok(r#"{"thought":"","final_answer":"Hello!"}"#.to_string())]).await;
        let _ = h.send("c7", "Hi").await;

        // 落盘恰好两条：user + assistant
        let stored = h
            .agent
            .session_storage
            .get_messages("c7", 50)
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].role, "user");
        assert_eq!(stored[0].content, "Hi");
        assert_eq!(stored[1].role, "assistant");
        assert_eq!(stored[1].content, "Hello!");
    }

    #[tokio::test]
    async fn test_no_llm_notice() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(MessageBus::new());
        bus.start().await;

        let registry = Arc::new(ToolRegistry::new());
        let agent = Arc::new(Agent::new(
            AgentConfig::default(),
            Arc::clone(&bus),
            None,
            Arc::new(ToolExecutor::new(registry)),
            Arc::new(ContextBuilder::new(
                Arc::new(FileStorage::new(dir.path())),
                Arc::new(FileMemoryStorage::new(dir.path())),
            )),
            None,
            Arc::new(FileSessionStorage::new(dir.path())),
        ));
        agent.start().await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(
            CHANNEL_CLI,
            handler_fn(move |_, msg: Message| {
                let tx = tx.clone();
                async move {
                    if msg.id.starts_with("agent-") {
                        tx.send(msg).map_err(|e| e.to_string())?;
                    }
                    Ok(())
                }
            }),
        )
        .await;

        let cancel = CancellationToken::new();
        bus.publish(&cancel, CHANNEL_CLI, Message::new("", "c9", "hello"))
            .await
            .unwrap();

        let reply = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(reply.content.starts_with("LLM is not configured"));
    }
}
