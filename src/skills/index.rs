//! 技能倒排索引
//!
//! by_name（ID -> 技能）之外维护 by_tag / by_category / by_keyword 三张
//! 词项 -> 技能 ID 集合的映射；关键词来自名称 + 描述，经小写、去标点、
//! 停用词过滤与去重。

use std::collections::{HashMap, HashSet};

use super::Skill;

const STOP_WORDS: [&str; 38] = [
    "a", "an", "the", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had", "do",
    "does", "did", "will", "would", "should", "could", "may", "might", "must", "can", "this",
    "that",
];

/// 提取关键词：小写、按空白切分、去首尾标点、过滤停用词与单字符、去重保序
pub fn extract_keywords(text: &str) -> Vec<String> {
    let text = text.to_lowercase();
    let mut seen = HashSet::new();
    let mut keywords = Vec::new();

    for word in text.split_whitespace() {
        let word = word.trim_matches(|c: char| c.is_ascii_punctuation());
        if word.chars().count() < 2 {
            continue;
        }
        if STOP_WORDS.contains(&word) {
            continue;
        }
        if seen.insert(word.to_string()) {
            keywords.push(word.to_string());
        }
    }
    keywords
}

/// 倒排索引（无内部锁：由持有者的锁保护）
#[derive(Default)]
pub struct SkillIndex {
    by_name: HashMap<String, Skill>,
    by_tag: HashMap<String, HashSet<String>>,
    by_category: HashMap<String, HashSet<String>>,
    by_keyword: HashMap<String, HashSet<String>>,
}

impl SkillIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, skill: Skill) {
        for tag in &skill.tags {
            self.by_tag.entry(tag.clone()).or_default().insert(skill.id.clone());
        }
        if !skill.category.is_empty() {
            self.by_category
                .entry(skill.category.clone())
                .or_default()
                .insert(skill.id.clone());
        }
        for keyword in extract_keywords(&format!("{} {}", skill.name, skill.description)) {
            self.by_keyword.entry(keyword).or_default().insert(skill.id.clone());
        }
        self.by_name.insert(skill.id.clone(), skill);
    }

    /// 移除技能并清理其全部词项条目（词项空集整体删除）
    pub fn remove(&mut self, skill_id: &str) {
        let Some(skill) = self.by_name.remove(skill_id) else {
            return;
        };

        for tag in &skill.tags {
            if let Some(ids) = self.by_tag.get_mut(tag) {
                ids.remove(skill_id);
                if ids.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
        if !skill.category.is_empty() {
            if let Some(ids) = self.by_category.get_mut(&skill.category) {
                ids.remove(skill_id);
                if ids.is_empty() {
                    self.by_category.remove(&skill.category);
                }
            }
        }
        for keyword in extract_keywords(&format!("{} {}", skill.name, skill.description)) {
            if let Some(ids) = self.by_keyword.get_mut(&keyword) {
                ids.remove(skill_id);
                if ids.is_empty() {
                    self.by_keyword.remove(&keyword);
                }
            }
        }
    }

    pub fn get(&self, skill_id: &str) -> Option<&Skill> {
        self.by_name.get(skill_id)
    }

    /// 按查询打分检索（keyword +1.0 / tag 全匹配 +2.0 / category 全匹配 +1.5），
    /// 仅返回启用的技能
    pub fn search(&self, query: &str) -> Vec<&Skill> {
        let query_lower = query.to_lowercase();
        let keywords = extract_keywords(&query_lower);

        let mut scores: HashMap<&str, f64> = HashMap::new();
        for keyword in &keywords {
            if let Some(ids) = self.by_keyword.get(keyword) {
                for id in ids {
                    *scores.entry(id.as_str()).or_default() += 1.0;
                }
            }
        }
        if let Some(ids) = self.by_tag.get(&query_lower) {
            for id in ids {
                *scores.entry(id.as_str()).or_default() += 2.0;
            }
        }
        if let Some(ids) = self.by_category.get(&query_lower) {
            for id in ids {
                *scores.entry(id.as_str()).or_default() += 1.5;
            }
        }

        let mut hits: Vec<(&Skill, f64)> = scores
            .into_iter()
            .filter_map(|(id, score)| self.by_name.get(id).map(|s| (s, score)))
            .filter(|(s, _)| s.enabled)
            .collect();
        hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.into_iter().map(|(s, _)| s).collect()
    }

    pub fn get_by_tag(&self, tag: &str) -> Vec<&Skill> {
        self.by_tag
            .get(tag)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.by_name.get(id))
                    .filter(|s| s.enabled)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_by_category(&self, category: &str) -> Vec<&Skill> {
        self.by_category
            .get(category)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.by_name.get(id))
                    .filter(|s| s.enabled)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn all_enabled(&self) -> Vec<&Skill> {
        self.by_name.values().filter(|s| s.enabled).collect()
    }

    pub fn clear(&mut self) {
        self.by_name.clear();
        self.by_tag.clear();
        self.by_category.clear();
        self.by_keyword.clear();
    }

    #[cfg(test)]
    pub(crate) fn has_tag_entry(&self, tag: &str, skill_id: &str) -> bool {
        self.by_tag.get(tag).map(|ids| ids.contains(skill_id)).unwrap_or(false)
    }

    #[cfg(test)]
    pub(crate) fn has_keyword_entry(&self, keyword: &str, skill_id: &str) -> bool {
        self.by_keyword
            .get(keyword)
            .map(|ids| ids.contains(skill_id))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_skill(id: &str, name: &str, description: &str, tags: &[&str], category: &str) -> Skill {
        let mut skill = Skill::new(id, name, description);
        skill.tags = tags.iter().map(|s| s.to_string()).collect();
        skill.category = category.to_string();
        skill
    }

    #[test]
    fn test_extract_keywords() {
        let kw = extract_keywords("Review the Code, and fix bugs!");
        assert_eq!(kw, vec!["review", "code", "fix", "bugs"]);
    }

    #[test]
    fn test_add_and_search() {
        let mut index = SkillIndex::new();
        index.add(sample_skill("s1", "code review", "review code quality", &["review"], "eng"));
        index.add(sample_skill("s2", "cooking", "make pasta", &["food"], "life"));

        let hits = index.search("please review my code");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "s1");
    }

    #[test]
    fn test_disabled_excluded_from_search() {
        let mut index = SkillIndex::new();
        let mut skill = sample_skill("s1", "code review", "review code", &["review"], "");
        skill.enabled = false;
        index.add(skill);
        assert!(index.search("review code").is_empty());
        assert!(index.get_by_tag("review").is_empty());
    }

    #[test]
    fn test_remove_purges_all_entries() {
        let mut index = SkillIndex::new();
        index.add(sample_skill("s1", "code review", "review code quality", &["review"], "eng"));
        index.remove("s1");

        assert!(index.get("s1").is_none());
        assert!(!index.has_tag_entry("review", "s1"));
        assert!(!index.has_keyword_entry("code", "s1"));
        assert!(index.search("review").is_empty());
    }

    #[test]
    fn test_get_by_tag_and_category() {
        let mut index = SkillIndex::new();
        index.add(sample_skill("s1", "a", "b", &["x"], "cat"));
        assert_eq!(index.get_by_tag("x").len(), 1);
        assert_eq!(index.get_by_category("cat").len(), 1);
        assert!(index.get_by_tag("missing").is_empty());
    }
}
