//! 技能系统
//!
//! 技能是带 YAML front-matter 的 Markdown 文档：正文是注入系统提示词的片段，
//! front-matter 描述名称、分类、标签与依赖工具。注册表背靠倒排索引，
//! 选择器按 keyword / llm / hybrid 三种模式挑选相关技能，
//! 文件监视器对技能目录做热加载。
//!
//! 文件格式：
//! ```text
//! ---
//! name: code_review
//! description: Review code for common issues
//! category: engineering
//! tags: [review, quality]
//! requires: [read_file]
//! ---
//! 正文（注入 prompt 的指令）
//! ```

mod index;
mod parser;
mod registry;
mod selector;
mod watcher;

pub use index::{extract_keywords, SkillIndex};
pub use parser::SkillParser;
pub use registry::SkillRegistry;
pub use selector::{SelectionConfig, SelectionMethod, SkillSelector};
pub use watcher::SkillWatcher;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SkillError {
    /// front-matter 缺失或 --- 围栏不完整
    #[error("invalid skill format: {0}")]
    InvalidFormat(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("failed to parse front matter: {0}")]
    FrontMatter(#[from] serde_yaml::Error),
    #[error("skill {0} not found")]
    NotFound(String),
    #[error("skill ID cannot be empty")]
    EmptyId,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 技能：ID 由源文件路径派生，同一文件重解析得到同一 ID
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    /// 正文：被选中时注入系统提示词
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl Skill {
    pub fn new(id: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            category: String::new(),
            tags: Vec::new(),
            requires: Vec::new(),
            content: String::new(),
            metadata: HashMap::new(),
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
