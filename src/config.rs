//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `WASP__*` 覆盖
//! （双下划线表示嵌套，如 `WASP__LLM__DEFAULT_MODEL=fast`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::llm::ModelConfig;
use crate::mcp::ClientConfig;
use crate::skills::SelectionConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub telegram: TelegramSection,
    pub websocket: WebSocketSection,
    pub cli: CliSection,
    pub llm: LlmSection,
    pub skills: SkillsSection,
    pub mcp: McpSection,
    pub scheduler: SchedulerSection,
    pub search: SearchSection,
}

/// [app] 段：数据根目录与 ReAct 步数上限
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

fn default_base_path() -> PathBuf {
    PathBuf::from("./data")
}

fn default_max_iterations() -> usize {
    10
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            max_iterations: default_max_iterations(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TelegramSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ws_host")]
    pub host: String,
    #[serde(default = "default_ws_port")]
    pub port: u16,
}

fn default_ws_host() -> String {
    "127.0.0.1".to_string()
}

fn default_ws_port() -> u16 {
    18789
}

impl Default for WebSocketSection {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_ws_host(),
            port: default_ws_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CliSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for CliSection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}

/// [llm] 段：具名模型列表与默认模型
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmSection {
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default = "default_model_name")]
    pub default_model: String,
}

fn default_model_name() -> String {
    "default".to_string()
}

/// [skills] 段：技能目录、热加载与选择器参数
#[derive(Debug, Clone, Deserialize)]
pub struct SkillsSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_skills_dir")]
    pub directory: PathBuf,
    #[serde(default = "default_true")]
    pub auto_reload: bool,
    #[serde(default)]
    pub selection: SelectionConfig,
}

fn default_skills_dir() -> PathBuf {
    PathBuf::from("./skills")
}

impl Default for SkillsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: default_skills_dir(),
            auto_reload: true,
            selection: SelectionConfig::default(),
        }
    }
}

/// [mcp] 段：远程工具客户端列表
#[derive(Debug, Clone, Deserialize, Default)]
pub struct McpSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
}

/// [scheduler] 段：tick 间隔与任务文件
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_tasks_file")]
    pub tasks_file: PathBuf,
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

fn default_tick_secs() -> u64 {
    1
}

fn default_tasks_file() -> PathBuf {
    PathBuf::from("./data/tasks.json")
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            enabled: false,
            tick_secs: default_tick_secs(),
            tasks_file: default_tasks_file(),
            auto_start: true,
        }
    }
}

/// [search] 段：Brave Search API
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SearchSection {
    #[serde(default)]
    pub brave_api_key: String,
}

/// 从 config 目录加载配置，环境变量 WASP__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 WASP__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("WASP")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.max_iterations, 10);
        assert_eq!(cfg.websocket.port, 18789);
        assert!(cfg.cli.enabled);
        assert!(!cfg.telegram.enabled);
        assert_eq!(cfg.scheduler.tick_secs, 1);
    }

    #[test]
    fn test_toml_roundtrip() {
        let toml = r#"
            [app]
            base_path = "/tmp/wasp"
            max_iterations = 5

            [telegram]
            enabled = true
            token = "t0k3n"

            [[llm.models]]
            name = "fast"
            provider = "openai"
            api_key = "sk-xxx"
            model = "gpt-4o-mini"

            [llm]
            default_model = "fast"

            [[mcp.clients]]
            name = "files"
            endpoint = "http://localhost:8000/rpc"
        "#;

        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(cfg.app.max_iterations, 5);
        assert!(cfg.telegram.enabled);
        assert_eq!(cfg.llm.models.len(), 1);
        assert_eq!(cfg.llm.models[0].name, "fast");
        assert_eq!(cfg.llm.default_model, "fast");
        assert_eq!(cfg.mcp.clients[0].name, "files");
    }
}
