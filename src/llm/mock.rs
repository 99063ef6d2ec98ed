//! Mock LLM 提供方（测试与本地试跑用，无需 API）
//!
//! 按脚本顺序逐次返回预设结果；脚本耗尽后回显最后一条用户消息，
//! 便于不配置任何 API Key 也能跑通 ReAct 流程。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use super::{ChunkStream, CompletionRequest, CompletionResponse, LlmError, LlmProvider, Role, Usage};

#[derive(Default)]
pub struct MockProvider {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预设每次 complete 的返回（Ok 内容或 Err）
    pub fn with_script(script: Vec<Result<String, LlmError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
        }
    }

    fn echo_fallback(req: &CompletionRequest) -> String {
        let last_user = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        format!(r#"{{"thought": "", "final_answer": "Echo from mock: {}"}}"#, last_user)
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn complete(&self, req: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();

        let content = match scripted {
            Some(Ok(content)) => content,
            Some(Err(e)) => return Err(e),
            None => Self::echo_fallback(req),
        };

        Ok(CompletionResponse {
            usage: Usage {
                prompt_tokens: 0,
                completion_tokens: content.len() as u64 / 4,
                total_tokens: content.len() as u64 / 4,
            },
            content,
        })
    }

    async fn complete_stream(&self, req: &CompletionRequest) -> Result<ChunkStream, LlmError> {
        let resp = self.complete(req).await?;
        Ok(Box::pin(stream::iter(vec![Ok(resp.content)])))
    }

    fn model(&self) -> String {
        "mock".to_string()
    }
}
