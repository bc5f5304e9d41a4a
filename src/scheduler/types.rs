//! 调度类型定义
//!
//! 派发描述、Agent 执行结果、调度错误、调度事件

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type AgentId = String;

/// 一批派发中的单个 Agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSpec {
    /// 批内唯一
    pub agent_id: AgentId,
    /// 交给 Agent 的自然语言任务
    pub mission: String,
    /// 可调用的技能白名单
    #[serde(default)]
    pub skills: Vec<String>,
    /// 开始前需要其结果的 Agent；缺省即无依赖
    #[serde(default)]
    pub depends_on: Vec<AgentId>,
}

impl DispatchSpec {
    pub fn new(agent_id: impl Into<String>, mission: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            mission: mission.into(),
            skills: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }
}

/// 按 agent_id 建索引
pub fn index_dispatches(specs: Vec<DispatchSpec>) -> HashMap<AgentId, DispatchSpec> {
    specs
        .into_iter()
        .map(|spec| (spec.agent_id.clone(), spec))
        .collect()
}

/// Agent 终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Completed,
    Failed,
    /// 有上游未完成，从未执行
    Skipped,
    Timeout,
}

/// 单个 Agent 的执行结果；产生后只读，下游按引用读取
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentExecutionResult {
    pub status: AgentStatus,
    /// 结果文本；失败时为可读的错误摘要
    pub result: String,
    /// 消耗的技能调用次数
    pub tool_calls_used: usize,
}

impl AgentExecutionResult {
    pub fn completed(result: impl Into<String>, tool_calls_used: usize) -> Self {
        Self {
            status: AgentStatus::Completed,
            result: result.into(),
            tool_calls_used,
        }
    }

    pub fn failed(result: impl Into<String>, tool_calls_used: usize) -> Self {
        Self {
            status: AgentStatus::Failed,
            result: result.into(),
            tool_calls_used,
        }
    }

    pub fn skipped(result: impl Into<String>) -> Self {
        Self {
            status: AgentStatus::Skipped,
            result: result.into(),
            tool_calls_used: 0,
        }
    }

    pub fn timeout(result: impl Into<String>, tool_calls_used: usize) -> Self {
        Self {
            status: AgentStatus::Timeout,
            result: result.into(),
            tool_calls_used,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == AgentStatus::Completed
    }
}

/// 调度错误：在任何执行之前返回，整批作废
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Cyclic dependency detected")]
    CycleDetected,
    #[error("Unknown dependency: {0}")]
    UnknownDependency(AgentId),
}

/// 调度过程事件（可选上报）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    WaveStarted { index: usize, agents: Vec<AgentId> },
    AgentFinished { agent_id: AgentId, status: AgentStatus },
    WaveCompleted { index: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depends_on_defaults_to_empty() {
        let spec: DispatchSpec =
            serde_json::from_str(r#"{"agent_id": "a", "mission": "look up flights"}"#).unwrap();
        assert!(spec.depends_on.is_empty());
        assert!(spec.skills.is_empty());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let r = AgentExecutionResult::skipped("upstream failed");
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["tool_calls_used"], 0);
    }
}
