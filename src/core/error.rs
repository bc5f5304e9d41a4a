//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定是把纠正提示交回 LLM 继续（RetryWithPrompt），还是结束任务（Abort）。

use thiserror::Error;

use crate::breaker::BreakerError;
use crate::llm::LlmError;
use crate::skills::SkillError;

/// Agent 任务执行过程中可能出现的错误
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    #[error(transparent)]
    Breaker(#[from] BreakerError),

    #[error(transparent)]
    Skill(#[from] SkillError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("Skill not in scope: {0}")]
    SkillOutOfScope(String),

    #[error("Gave up after {0} iterations without a final answer")]
    MaxIterations(usize),

    #[error("No answer from orchestrator within {0}s")]
    AwaitTimeout(u64),

    #[error("Mission cancelled")]
    Cancelled,
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 将提示作为技能结果交回 LLM，让它自行纠正
    RetryWithPrompt(String),
    /// 终止当前任务
    Abort,
}
