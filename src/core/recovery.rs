//! 错误恢复引擎
//!
//! 根据 AgentError 返回 RecoveryAction：策略性拒绝（先检索后写入、保险丝熔断、越权技能、技能失败）
//! 转为纠正提示交回 LLM，预算耗尽、LLM 故障、超时与取消则终止任务。

use crate::breaker::BreakerError;
use crate::core::{AgentError, RecoveryAction};
use crate::skills::SkillError;

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default, Clone)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// available 为当前 Agent 可用的技能，用于越权时提示
    pub fn handle(&self, err: &AgentError, available: &[String]) -> RecoveryAction {
        match err {
            AgentError::Skill(SkillError::MemoryWriteWithoutSearch { skill }) => {
                RecoveryAction::RetryWithPrompt(format!(
                    "The write '{skill}' was rejected: you must search memory before writing to it. \
                     Call a search skill (for example memory_search) to check for existing entries, \
                     then retry '{skill}' with the results in mind."
                ))
            }
            AgentError::Skill(SkillError::Failed { skill, reason }) => {
                RecoveryAction::RetryWithPrompt(format!(
                    "Skill '{skill}' failed: {reason}. Try different arguments or another skill."
                ))
            }
            AgentError::Skill(SkillError::Timeout { skill }) => RecoveryAction::RetryWithPrompt(
                format!("Skill '{skill}' timed out. Try a narrower request or another skill."),
            ),
            AgentError::Breaker(BreakerError::CircuitOpen { skill }) => {
                RecoveryAction::RetryWithPrompt(format!(
                    "Skill '{skill}' is temporarily disabled after repeated failures. \
                     Do not call it again in this mission; use another skill or answer with what you have."
                ))
            }
            AgentError::SkillOutOfScope(skill) => RecoveryAction::RetryWithPrompt(format!(
                "Skill '{skill}' is not available to you. Available skills: {}.",
                if available.is_empty() {
                    "none".to_string()
                } else {
                    available.join(", ")
                }
            )),
            AgentError::Breaker(BreakerError::LimitExceeded(_))
            | AgentError::Llm(_)
            | AgentError::MaxIterations(_)
            | AgentError::AwaitTimeout(_)
            | AgentError::Cancelled => RecoveryAction::Abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{LimitDetails, LimitScope};
    use crate::llm::LlmError;

    #[test]
    fn test_write_without_search_gets_guidance() {
        let engine = RecoveryEngine::new();
        let err = AgentError::Skill(SkillError::MemoryWriteWithoutSearch {
            skill: "memory_store".to_string(),
        });
        match engine.handle(&err, &[]) {
            RecoveryAction::RetryWithPrompt(msg) => {
                assert!(msg.contains("memory_store"));
                assert!(msg.contains("search"));
            }
            other => panic!("Expected RetryWithPrompt, got {:?}", other),
        }
    }

    #[test]
    fn test_circuit_open_is_retryable() {
        let engine = RecoveryEngine::new();
        let err = AgentError::Breaker(BreakerError::CircuitOpen {
            skill: "gmail_send".to_string(),
        });
        assert!(matches!(
            engine.handle(&err, &[]),
            RecoveryAction::RetryWithPrompt(msg) if msg.contains("gmail_send")
        ));
    }

    #[test]
    fn test_out_of_scope_lists_available() {
        let engine = RecoveryEngine::new();
        let err = AgentError::SkillOutOfScope("drive_delete".to_string());
        match engine.handle(&err, &["drive_list".to_string()]) {
            RecoveryAction::RetryWithPrompt(msg) => assert!(msg.contains("drive_list")),
            other => panic!("Expected RetryWithPrompt, got {:?}", other),
        }
    }

    #[test]
    fn test_budget_and_llm_errors_abort() {
        let engine = RecoveryEngine::new();
        let limit = AgentError::Breaker(BreakerError::LimitExceeded(LimitDetails::new(
            LimitScope::AgentSkillCalls,
            5,
            1,
            5,
        )));
        assert_eq!(engine.handle(&limit, &[]), RecoveryAction::Abort);
        let llm = AgentError::Llm(LlmError::RateLimited { retry_after_ms: 1000 });
        assert_eq!(engine.handle(&llm, &[]), RecoveryAction::Abort);
        assert_eq!(engine.handle(&AgentError::Cancelled, &[]), RecoveryAction::Abort);
    }
}
