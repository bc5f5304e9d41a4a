//! 技能注册表
//!
//! 所有技能实现 Skill trait（name / description / execute），由 SkillRegistry 按名注册与查找；
//! 作用域白名单由派发描述中的 skills 列表决定，注册表只负责找到处理函数。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// 技能执行上下文：调用者身份
#[derive(Debug, Clone, Default, Serialize)]
pub struct SkillContext {
    pub user_id: String,
    pub conversation_id: String,
    pub agent_id: String,
}

/// 技能 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Skill: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认不限参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, args: Value, ctx: &SkillContext) -> Result<String, String>;
}

/// 技能注册表：按名称存储 Arc<dyn Skill>
#[derive(Default, Clone)]
pub struct SkillRegistry {
    skills: HashMap<String, Arc<dyn Skill>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, skill: impl Skill + 'static) {
        let name = skill.name().to_string();
        self.skills.insert(name, Arc::new(skill));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Skill>> {
        self.skills.get(name).cloned()
    }

    pub fn skill_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.skills.keys().cloned().collect();
        names.sort();
        names
    }

    /// 生成给 LLM 的技能 schema，只包含 scope 内的技能；未注册的技能以存根描述出现
    pub fn schema_for(&self, scope: &[String]) -> Vec<Value> {
        scope
            .iter()
            .map(|name| match self.skills.get(name) {
                Some(skill) => serde_json::json!({
                    "name": name,
                    "description": skill.description(),
                    "parameters": skill.parameters_schema(),
                }),
                None => serde_json::json!({
                    "name": name,
                    "description": "(stub)",
                    "parameters": {"type": "object", "properties": {}},
                }),
            })
            .collect()
    }
}
