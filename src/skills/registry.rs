//! 技能注册表
//!
//! 并发安全的 ID -> 技能映射，背靠倒排索引。重复 ID 注册为静默替换
//! （旧索引条目先清除）；禁用只影响 list() 与索引检索结果，不删除存储。

use std::path::Path;
use std::sync::RwLock;

use super::{Skill, SkillError, SkillIndex, SkillParser};

pub struct SkillRegistry {
    index: RwLock<SkillIndex>,
    parser: SkillParser,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self {
            index: RwLock::new(SkillIndex::new()),
            parser: SkillParser::new(),
        }
    }

    /// 注册技能；同 ID 已存在时替换并重建其索引条目
    pub fn register(&self, skill: Skill) -> Result<(), SkillError> {
        if skill.id.is_empty() {
            return Err(SkillError::EmptyId);
        }
        if skill.name.is_empty() {
            return Err(SkillError::MissingField("name"));
        }

        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
        index.remove(&skill.id);
        index.add(skill);
        Ok(())
    }

    pub fn unregister(&self, skill_id: &str) -> Result<(), SkillError> {
        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
        if index.get(skill_id).is_none() {
            return Err(SkillError::NotFound(skill_id.to_string()));
        }
        index.remove(skill_id);
        Ok(())
    }

    pub fn get(&self, skill_id: &str) -> Option<Skill> {
        self.index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(skill_id)
            .cloned()
    }

    /// 按显示名查找（线性扫描，仅管理接口使用）
    pub fn get_by_name(&self, name: &str) -> Option<Skill> {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        index
            .all_enabled()
            .into_iter()
            .find(|s| s.name == name)
            .cloned()
    }

    /// 启用中的技能
    pub fn list(&self) -> Vec<Skill> {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        let mut skills: Vec<Skill> = index.all_enabled().into_iter().cloned().collect();
        skills.sort_by(|a, b| a.id.cmp(&b.id));
        skills
    }

    pub fn search(&self, query: &str) -> Vec<Skill> {
        self.index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .search(query)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn get_by_tag(&self, tag: &str) -> Vec<Skill> {
        self.index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get_by_tag(tag)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn get_by_category(&self, category: &str) -> Vec<Skill> {
        self.index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get_by_category(category)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn enable(&self, skill_id: &str) -> Result<(), SkillError> {
        self.set_enabled(skill_id, true)
    }

    pub fn disable(&self, skill_id: &str) -> Result<(), SkillError> {
        self.set_enabled(skill_id, false)
    }

    fn set_enabled(&self, skill_id: &str, enabled: bool) -> Result<(), SkillError> {
        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
        let mut skill = index
            .get(skill_id)
            .cloned()
            .ok_or_else(|| SkillError::NotFound(skill_id.to_string()))?;
        skill.enabled = enabled;
        skill.touch();
        index.remove(skill_id);
        index.add(skill);
        Ok(())
    }

    /// 启用中的技能数
    pub fn count(&self) -> usize {
        self.index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .all_enabled()
            .len()
    }

    pub fn clear(&self) {
        self.index.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// 批量加载目录下全部 .md 技能文件
    pub async fn load_from_directory(&self, dir: &Path) -> Result<usize, SkillError> {
        let skills = self.parser.parse_directory(dir).await?;
        let count = skills.len();
        for skill in skills {
            self.register(skill)?;
        }
        tracing::info!(count, dir = %dir.display(), "skills loaded");
        Ok(count)
    }

    pub async fn load_from_file(&self, path: &Path) -> Result<Skill, SkillError> {
        let skill = self.parser.parse_file(path).await?;
        self.register(skill.clone())?;
        Ok(skill)
    }

    pub fn parser(&self) -> &SkillParser {
        &self.parser
    }
}

impl Default for SkillRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skill_with_tags(id: &str, name: &str, tags: &[&str]) -> Skill {
        let mut skill = Skill::new(id, name, format!("{} description", name));
        skill.tags = tags.iter().map(|s| s.to_string()).collect();
        skill
    }

    #[test]
    fn test_register_replaces_silently() {
        let registry = SkillRegistry::new();
        registry
            .register(skill_with_tags("s1", "alpha tooling", &["old"]))
            .unwrap();
        registry
            .register(skill_with_tags("s1", "beta tooling", &["new"]))
            .unwrap();

        // 恰好一个条目，且旧 tag / keyword 不再命中
        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.get("s1").unwrap().name, "beta tooling");
        assert!(registry.get_by_tag("old").is_empty());
        assert_eq!(registry.get_by_tag("new").len(), 1);
        assert!(registry.search("alpha").is_empty());
        assert_eq!(registry.search("beta").len(), 1);
    }

    #[test]
    fn test_disable_hides_but_keeps() {
        let registry = SkillRegistry::new();
        registry
            .register(skill_with_tags("s1", "review helper", &["review"]))
            .unwrap();

        registry.disable("s1").unwrap();
        assert!(registry.list().is_empty());
        assert!(registry.get_by_tag("review").is_empty());
        // 仍可按 ID 取到
        assert!(registry.get("s1").is_some());

        registry.enable("s1").unwrap();
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_get_by_name() {
        let registry = SkillRegistry::new();
        registry
            .register(skill_with_tags("s1", "review helper", &[]))
            .unwrap();
        assert!(registry.get_by_name("review helper").is_some());
        assert!(registry.get_by_name("missing").is_none());
    }

    #[test]
    fn test_unregister_missing() {
        let registry = SkillRegistry::new();
        assert!(matches!(
            registry.unregister("ghost"),
            Err(SkillError::NotFound(_))
        ));
    }

    #[test]
    fn test_clear() {
        let registry = SkillRegistry::new();
        registry.register(skill_with_tags("s1", "one", &[])).unwrap();
        registry.register(skill_with_tags("s2", "two", &[])).unwrap();
        registry.clear();
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.md"),
            "---\nname: a\ndescription: first skill\n---\nbody a",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("b.md"),
            "---\nname: b\ndescription: second skill\n---\nbody b",
        )
        .unwrap();

        let registry = SkillRegistry::new();
        let count = registry.load_from_directory(dir.path()).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(registry.count(), 2);
    }
}
