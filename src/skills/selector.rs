//! 技能选择器
//!
//! 三种模式：
//! - keyword：对每个技能按关键词出现位置加权打分（名称 0.30 / 描述 0.20 /
//!   标签 0.15 / 分类 0.10 / 正文 0.05，每个消息中出现的标签再加 0.25），
//!   截断到 1.0，过阈值者按分排序取前 MaxActive。
//! - llm：把技能目录连同用户消息交给 LLM，解析 selected_skills JSON。
//! - hybrid（默认）：先 keyword；命中 1..=MaxActive 直接采用，否则回退 llm，
//!   llm 失败再退回 keyword 结果。

use std::sync::Arc;

use serde::Deserialize;

use super::{extract_keywords, Skill, SkillRegistry};
use crate::llm::{ChatMessage, CompletionRequest, LlmError, LlmProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMethod {
    Keyword,
    Llm,
    #[default]
    Hybrid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectionConfig {
    #[serde(default)]
    pub method: SelectionMethod,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_max_active")]
    pub max_active: usize,
}

fn default_threshold() -> f64 {
    0.5
}

fn default_max_active() -> usize {
    5
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            method: SelectionMethod::default(),
            threshold: default_threshold(),
            max_active: default_max_active(),
        }
    }
}

pub struct SkillSelector {
    registry: Arc<SkillRegistry>,
    llm: Option<Arc<dyn LlmProvider>>,
    config: SelectionConfig,
}

impl SkillSelector {
    pub fn new(
        registry: Arc<SkillRegistry>,
        llm: Option<Arc<dyn LlmProvider>>,
        config: SelectionConfig,
    ) -> Self {
        Self { registry, llm, config }
    }

    pub fn config(&self) -> &SelectionConfig {
        &self.config
    }

    pub async fn select(&self, user_message: &str) -> Result<Vec<Skill>, LlmError> {
        match self.config.method {
            SelectionMethod::Keyword => Ok(self.select_by_keyword(user_message)),
            SelectionMethod::Llm => self.select_by_llm(user_message).await,
            SelectionMethod::Hybrid => self.select_hybrid(user_message).await,
        }
    }

    fn select_by_keyword(&self, user_message: &str) -> Vec<Skill> {
        let keywords = extract_keywords(user_message);

        let mut candidates: Vec<(Skill, f64)> = self
            .registry
            .list()
            .into_iter()
            .filter_map(|skill| {
                let score = keyword_score(&skill, &keywords, user_message);
                if score >= self.config.threshold {
                    Some((skill, score))
                } else {
                    None
                }
            })
            .collect();

        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(self.config.max_active.max(1));
        candidates.into_iter().map(|(s, _)| s).collect()
    }

    async fn select_by_llm(&self, user_message: &str) -> Result<Vec<Skill>, LlmError> {
        let Some(llm) = &self.llm else {
            // 未配置 LLM 时退回 keyword
            return Ok(self.select_by_keyword(user_message));
        };

        let skills = self.registry.list();
        if skills.is_empty() {
            return Ok(Vec::new());
        }

        let catalog: String = skills
            .iter()
            .enumerate()
            .map(|(i, s)| {
                format!(
                    "{}. ID: {}, Name: {}, Description: {}, Tags: {:?}\n",
                    i + 1,
                    s.id,
                    s.name,
                    s.description,
                    s.tags
                )
            })
            .collect();

        let prompt = format!(
            "You are a skill selector. Given the user's message, select the most relevant skills from the list below.\n\n\
             Available Skills:\n{}\n\
             User Message: {}\n\n\
             Respond with a JSON object in the following format:\n\
             {{\n  \"selected_skills\": [\n    {{\n      \"skill_id\": \"skill_id_here\",\n      \"reasoning\": \"brief explanation of why this skill is relevant\"\n    }}\n  ]\n}}\n\n\
             Select at most {} skills. Only select skills that are directly relevant to the user's request.",
            catalog, user_message, self.config.max_active
        );

        let req = CompletionRequest {
            messages: vec![
                ChatMessage::system(
                    "You are a helpful assistant that selects relevant skills based on user messages.",
                ),
                ChatMessage::user(prompt),
            ],
            max_tokens: Some(1000),
            ..Default::default()
        };

        let resp = llm.complete(&req).await?;
        Ok(self.parse_llm_selection(&resp.content))
    }

    async fn select_hybrid(&self, user_message: &str) -> Result<Vec<Skill>, LlmError> {
        let keyword_hits = self.select_by_keyword(user_message);
        if !keyword_hits.is_empty() && keyword_hits.len() <= self.config.max_active {
            return Ok(keyword_hits);
        }

        if self.llm.is_some() {
            match self.select_by_llm(user_message).await {
                Ok(llm_hits) if !llm_hits.is_empty() => return Ok(llm_hits),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "LLM skill selection failed, falling back to keyword");
                }
            }
        }

        Ok(keyword_hits)
    }

    fn parse_llm_selection(&self, content: &str) -> Vec<Skill> {
        #[derive(Deserialize)]
        struct Selection {
            skill_id: String,
        }
        #[derive(Deserialize)]
        struct LlmSelection {
            #[serde(default)]
            selected_skills: Vec<Selection>,
        }

        let Some(parsed) = extract_json::<LlmSelection>(content) else {
            tracing::warn!("failed to parse LLM skill selection response");
            return Vec::new();
        };

        parsed
            .selected_skills
            .iter()
            .filter_map(|s| self.registry.get(&s.skill_id))
            .collect()
    }
}

/// 技能关键词打分；结果截断到 1.0
fn keyword_score(skill: &Skill, keywords: &[String], message: &str) -> f64 {
    let mut score: f64 = 0.0;
    let message_lower = message.to_lowercase();
    let name = skill.name.to_lowercase();
    let description = skill.description.to_lowercase();
    let category = skill.category.to_lowercase();
    let content = skill.content.to_lowercase();

    for keyword in keywords {
        if name.contains(keyword.as_str()) {
            score += 0.30;
        }
        if description.contains(keyword.as_str()) {
            score += 0.20;
        }
        for tag in &skill.tags {
            if tag.to_lowercase().contains(keyword.as_str()) {
                score += 0.15;
            }
        }
        if !category.is_empty() && category.contains(keyword.as_str()) {
            score += 0.10;
        }
        if content.contains(keyword.as_str()) {
            score += 0.05;
        }
    }

    for tag in &skill.tags {
        if message_lower.contains(&tag.to_lowercase()) {
            score += 0.25;
        }
    }

    score.min(1.0)
}

/// 从自由文本中截取首尾花括号之间的 JSON 并反序列化
fn extract_json<T: serde::de::DeserializeOwned>(content: &str) -> Option<T> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&content[start..=end]).ok()
}
