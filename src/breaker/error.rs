//! 熔断器拒绝类型
//!
//! 拒绝是普通的 Err 值而非异常：调用方可据此等待冷却、换技能或结束任务。

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// 被拒绝的是哪一个计数器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    /// 第二级：单个 Agent 的技能调用数
    AgentSkillCalls,
    /// 第三级：单轮派发的 Agent 数
    TurnAgents,
    /// 第三级：单轮所有 Agent 的技能调用总数
    TurnSkillCalls,
    /// 第四级：会话滑动窗口内的调用数
    ConversationCalls,
}

impl LimitScope {
    pub fn level(&self) -> u8 {
        match self {
            LimitScope::AgentSkillCalls => 2,
            LimitScope::TurnAgents | LimitScope::TurnSkillCalls => 3,
            LimitScope::ConversationCalls => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LimitScope::AgentSkillCalls => "agent_skill_calls",
            LimitScope::TurnAgents => "turn_agents",
            LimitScope::TurnSkillCalls => "turn_skill_calls",
            LimitScope::ConversationCalls => "conversation_calls",
        }
    }
}

impl fmt::Display for LimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 超限明细：used 为检查前已用量
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitDetails {
    pub level: u8,
    pub scope: LimitScope,
    pub used: usize,
    pub requested: usize,
    pub max: usize,
    /// 仅第四级有值
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_ms: Option<u64>,
}

impl LimitDetails {
    pub fn new(scope: LimitScope, used: usize, requested: usize, max: usize) -> Self {
        Self {
            level: scope.level(),
            scope,
            used,
            requested,
            max,
            window_ms: None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BreakerError {
    /// 第一级：技能保险丝已熔断
    #[error("circuit open for skill '{skill}'")]
    CircuitOpen { skill: String },

    #[error("level {} limit exceeded ({}): {} used + {} requested > {} max", .0.level, .0.scope, .0.used, .0.requested, .0.max)]
    LimitExceeded(LimitDetails),
}

impl BreakerError {
    pub fn level(&self) -> u8 {
        match self {
            BreakerError::CircuitOpen { .. } => 1,
            BreakerError::LimitExceeded(d) => d.level,
        }
    }

    pub fn scope(&self) -> &'static str {
        match self {
            BreakerError::CircuitOpen { .. } => "skill",
            BreakerError::LimitExceeded(d) => d.scope.as_str(),
        }
    }
}
