//! 多模型管理器
//!
//! 按名称注册多个模型（提供方 + 模型 + 采样参数），维护 default / current，
//! 对外提供统一 complete；每个具名模型都包在 RetryProvider 里共享同一个 Monitor。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::RwLock;

use super::{
    AnthropicConfig, AnthropicProvider, ChatMessage, CompletionRequest, CompletionResponse, LlmError,
    LlmProvider, MockProvider, Monitor, OpenAiConfig, OpenAiProvider, RetryProvider,
};

/// 单个具名模型配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ModelConfig {
    pub name: String,
    /// anthropic / openai / mock
    pub provider: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

/// Anthropic 默认 50 次/分钟
const ANTHROPIC_RPM: usize = 50;
/// OpenAI 默认 60 次/分钟
const OPENAI_RPM: usize = 60;

struct ModelEntry {
    config: ModelConfig,
    provider: Arc<dyn LlmProvider>,
}

struct ManagerState {
    models: HashMap<String, ModelEntry>,
    current: String,
}

pub struct MultiModelManager {
    state: RwLock<ManagerState>,
    default_model: String,
    monitor: Arc<Monitor>,
}

impl MultiModelManager {
    /// 创建管理器；default_model 必须在成功注册的模型之列
    pub fn new(models: Vec<ModelConfig>, default_model: &str) -> Result<Self, LlmError> {
        let monitor = Arc::new(Monitor::new());
        let mut map = HashMap::new();

        for config in models {
            match Self::build_entry(config, &monitor) {
                Ok(entry) => {
                    map.insert(entry.config.name.clone(), entry);
                }
                Err((name, e)) => {
                    tracing::warn!(model = %name, error = %e, "failed to add model");
                }
            }
        }

        if !map.contains_key(default_model) {
            return Err(LlmError::Api(format!("default model {} not found", default_model)));
        }

        Ok(Self {
            state: RwLock::new(ManagerState {
                models: map,
                current: default_model.to_string(),
            }),
            default_model: default_model.to_string(),
            monitor,
        })
    }

    /// 以现成 provider 构造单模型管理器（自定义后端注入或测试桩）
    pub fn with_provider(name: &str, provider: Arc<dyn LlmProvider>) -> Self {
        let mut models = HashMap::new();
        models.insert(
            name.to_string(),
            ModelEntry {
                config: ModelConfig {
                    name: name.to_string(),
                    provider: "custom".to_string(),
                    ..Default::default()
                },
                provider,
            },
        );
        Self {
            state: RwLock::new(ManagerState {
                models,
                current: name.to_string(),
            }),
            default_model: name.to_string(),
            monitor: Arc::new(Monitor::new()),
        }
    }

    fn build_entry(config: ModelConfig, monitor: &Arc<Monitor>) -> Result<ModelEntry, (String, LlmError)> {
        let name = config.name.clone();
        let provider: Arc<dyn LlmProvider> = match config.provider.as_str() {
            "anthropic" => {
                if config.api_key.is_empty() {
                    return Err((name, LlmError::Api("API key is required for Anthropic provider".to_string())));
                }
                let inner = Arc::new(AnthropicProvider::new(AnthropicConfig {
                    api_key: config.api_key.clone(),
                    model: config.model.clone(),
                    base_url: config
                        .base_url
                        .clone()
                        .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
                    max_tokens: config.max_tokens.unwrap_or(4096),
                    temperature: config.temperature,
                    timeout: Duration::from_secs(60),
                }));
                Arc::new(RetryProvider::new(inner, "anthropic", ANTHROPIC_RPM, Arc::clone(monitor)))
            }
            "openai" => {
                if config.api_key.is_empty() {
                    return Err((name, LlmError::Api("API key is required for OpenAI provider".to_string())));
                }
                let inner = Arc::new(OpenAiProvider::new(OpenAiConfig {
                    api_key: config.api_key.clone(),
                    model: config.model.clone(),
                    base_url: config
                        .base_url
                        .clone()
                        .unwrap_or_else(|| "https://api.openai.com".to_string()),
                    max_tokens: config.max_tokens,
                    temperature: config.temperature,
                    timeout: Duration::from_secs(60),
                }));
                Arc::new(RetryProvider::new(inner, "openai", OPENAI_RPM, Arc::clone(monitor)))
            }
            "mock" => Arc::new(MockProvider::new()),
            other => {
                return Err((name, LlmError::Api(format!("unsupported provider: {}", other))));
            }
        };

        tracing::info!(model = %config.name, provider = %config.provider, "model registered");
        Ok(ModelEntry { config, provider })
    }

    pub async fn add_model(&self, config: ModelConfig) -> Result<(), LlmError> {
        let mut state = self.state.write().await;
        if state.models.contains_key(&config.name) {
            return Err(LlmError::Api(format!("model {} already exists", config.name)));
        }
        let entry = Self::build_entry(config, &self.monitor).map_err(|(_, e)| e)?;
        state.models.insert(entry.config.name.clone(), entry);
        Ok(())
    }

    pub async fn remove_model(&self, name: &str) -> Result<(), LlmError> {
        if name == self.default_model {
            return Err(LlmError::Api("cannot remove default model".to_string()));
        }
        let mut state = self.state.write().await;
        if state.models.remove(name).is_none() {
            return Err(LlmError::Api(format!("model {} not found", name)));
        }
        if state.current == name {
            state.current = self.default_model.clone();
            tracing::info!(model = %self.default_model, "switched back to default model");
        }
        Ok(())
    }

    pub async fn switch_model(&self, name: &str) -> Result<(), LlmError> {
        let mut state = self.state.write().await;
        if !state.models.contains_key(name) {
            return Err(LlmError::Api(format!("model {} not found", name)));
        }
        state.current = name.to_string();
        tracing::info!(model = %name, "switched model");
        Ok(())
    }

    pub async fn current_model(&self) -> String {
        self.state.read().await.current.clone()
    }

    pub async fn list_models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().await.models.keys().cloned().collect();
        names.sort();
        names
    }

    /// 当前模型的提供方名（anthropic / openai / mock）
    pub async fn provider(&self) -> String {
        let state = self.state.read().await;
        state
            .models
            .get(&state.current)
            .map(|e| e.config.provider.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// 当前模型的模型名
    pub async fn model(&self) -> String {
        let state = self.state.read().await;
        state
            .models
            .get(&state.current)
            .map(|e| e.config.model.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    /// 用当前模型完成一次非流式请求
    pub async fn complete(&self, messages: Vec<ChatMessage>) -> Result<CompletionResponse, LlmError> {
        let (provider, req) = {
            let state = self.state.read().await;
            let entry = state
                .models
                .get(&state.current)
                .ok_or_else(|| LlmError::Api(format!("current model {} not found", state.current)))?;
            let req = CompletionRequest {
                messages,
                model: entry.config.model.clone(),
                max_tokens: entry.config.max_tokens,
                temperature: entry.config.temperature,
                stream: false,
            };
            (Arc::clone(&entry.provider), req)
        };

        provider.complete(&req).await
    }
}
