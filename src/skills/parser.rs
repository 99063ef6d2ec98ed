//! 技能文件解析器
//!
//! 按 --- 围栏切分 front-matter 与正文；front-matter 为 YAML，
//! 必填 name / description，其余标量键归入 metadata（统一转字符串）。
//! 技能 ID = 文件名（去扩展名）+ "-" + 路径 SHA-256 的前 8 位十六进制，
//! 同一路径重解析 ID 稳定，不同路径互不冲突。

use std::collections::HashMap;
use std::path::Path;

use sha2::{Digest, Sha256};

use super::{Skill, SkillError};

pub struct SkillParser;

impl SkillParser {
    pub fn new() -> Self {
        Self
    }

    /// 解析单个技能文件
    pub async fn parse_file(&self, path: &Path) -> Result<Skill, SkillError> {
        let content = tokio::fs::read_to_string(path).await?;
        self.parse_content(&content, &path.to_string_lossy())
    }

    /// 解析文件内容；path 仅用于派生 ID
    pub fn parse_content(&self, content: &str, path: &str) -> Result<Skill, SkillError> {
        let mut parts = content.splitn(3, "---");
        let prefix = parts.next().unwrap_or("");
        let front_matter = parts
            .next()
            .ok_or_else(|| SkillError::InvalidFormat("expected front matter between --- markers".to_string()))?;
        let body = parts
            .next()
            .ok_or_else(|| SkillError::InvalidFormat("expected front matter between --- markers".to_string()))?;

        // 第一个围栏前不允许出现正文
        if !prefix.trim().is_empty() {
            return Err(SkillError::InvalidFormat(
                "content before opening front matter marker".to_string(),
            ));
        }

        let meta: serde_yaml::Value = serde_yaml::from_str(front_matter)?;

        let name = get_string(&meta, "name");
        if name.is_empty() {
            return Err(SkillError::MissingField("name"));
        }
        let description = get_string(&meta, "description");
        if description.is_empty() {
            return Err(SkillError::MissingField("description"));
        }

        let now = chrono::Utc::now();
        Ok(Skill {
            id: skill_id(path),
            name,
            description,
            category: get_string(&meta, "category"),
            tags: get_string_list(&meta, "tags"),
            requires: get_string_list(&meta, "requires"),
            content: body.trim().to_string(),
            metadata: extract_metadata(&meta),
            enabled: get_bool(&meta, "enabled", true),
            created_at: now,
            updated_at: now,
        })
    }

    /// 解析目录下全部 .md 文件；单个文件解析失败记日志并跳过
    pub async fn parse_directory(&self, dir: &Path) -> Result<Vec<Skill>, SkillError> {
        let mut skills = Vec::new();
        if !dir.exists() {
            return Ok(skills);
        }

        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e.eq_ignore_ascii_case("md")).unwrap_or(false) {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            match self.parse_file(&path).await {
                Ok(skill) => skills.push(skill),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping invalid skill file");
                }
            }
        }
        Ok(skills)
    }
}

impl Default for SkillParser {
    fn default() -> Self {
        Self::new()
    }
}

/// 路径派生的稳定技能 ID
pub fn skill_id(path: &str) -> String {
    let hash = Sha256::digest(path.as_bytes());
    let hash8 = hash.iter().take(4).map(|b| format!("{:02x}", b)).collect::<String>();
    let stem = Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    format!("{}-{}", stem, hash8)
}

fn get_string(meta: &serde_yaml::Value, key: &str) -> String {
    meta.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn get_string_list(meta: &serde_yaml::Value, key: &str) -> Vec<String> {
    meta.get(key)
        .and_then(|v| v.as_sequence())
        .map(|seq| {
            seq.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn get_bool(meta: &serde_yaml::Value, key: &str, default: bool) -> bool {
    meta.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

/// 已知键之外的标量统一转字符串进 metadata
fn extract_metadata(meta: &serde_yaml::Value) -> HashMap<String, String> {
    const KNOWN: [&str; 6] = ["name", "description", "category", "tags", "requires", "enabled"];

    let mut out = HashMap::new();
    let Some(mapping) = meta.as_mapping() else {
        return out;
    };
    for (key, value) in mapping {
        let Some(key) = key.as_str() else { continue };
        if KNOWN.contains(&key) {
            continue;
        }
        let rendered = match value {
            serde_yaml::Value::String(s) => s.clone(),
            serde_yaml::Value::Bool(b) => b.to_string(),
            serde_yaml::Value::Number(n) => n.to_string(),
            _ => continue,
        };
        out.insert(key.to_string(), rendered);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"---
name: code_review
description: Review code for common issues
category: engineering
tags:
  - review
  - quality
requires:
  - read_file
version: 2
experimental: true
---
Look for bugs, style issues and missing tests.
"#;

    #[test]
    fn test_parse_full_skill() {
        let parser = SkillParser::new();
        let skill = parser.parse_content(SAMPLE, "skills/code_review.md").unwrap();

        assert!(skill.id.starts_with("code_review-"));
        assert_eq!(skill.name, "code_review");
        assert_eq!(skill.description, "Review code for common issues");
        assert_eq!(skill.category, "engineering");
        assert_eq!(skill.tags, vec!["review", "quality"]);
        assert_eq!(skill.requires, vec!["read_file"]);
        assert!(skill.content.starts_with("Look for bugs"));
        assert_eq!(skill.metadata["version"], "2");
        assert_eq!(skill.metadata["experimental"], "true");
        assert!(skill.enabled);
    }

    #[test]
    fn test_id_stable_per_path() {
        assert_eq!(skill_id("a/b/x.md"), skill_id("a/b/x.md"));
        assert_ne!(skill_id("a/x.md"), skill_id("b/x.md"));
        assert!(skill_id("a/b/x.md").starts_with("x-"));
    }

    #[test]
    fn test_missing_required_fields() {
        let parser = SkillParser::new();

        let err = parser
            .parse_content("---\ndescription: d\n---\nbody", "x.md")
            .unwrap_err();
        assert!(matches!(err, SkillError::MissingField("name")));

        let err = parser
            .parse_content("---\nname: n\n---\nbody", "x.md")
            .unwrap_err();
        assert!(matches!(err, SkillError::MissingField("description")));
    }

    #[test]
    fn test_invalid_format() {
        let parser = SkillParser::new();

        // 无围栏
        assert!(matches!(
            parser.parse_content("just text", "x.md"),
            Err(SkillError::InvalidFormat(_))
        ));

        // 围栏前有正文
        assert!(matches!(
            parser.parse_content("oops\n---\nname: n\ndescription: d\n---\nbody", "x.md"),
            Err(SkillError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_disabled_skill() {
        let parser = SkillParser::new();
        let skill = parser
            .parse_content("---\nname: n\ndescription: d\nenabled: false\n---\nbody", "x.md")
            .unwrap();
        assert!(!skill.enabled);
    }

    #[tokio::test]
    async fn test_parse_directory_skips_invalid() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good.md"), SAMPLE).unwrap();
        std::fs::write(dir.path().join("bad.md"), "no front matter").unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "not markdown").unwrap();

        let parser = SkillParser::new();
        let skills = parser.parse_directory(dir.path()).await.unwrap();
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].name, "code_review");
    }
}
