//! 第二至四级预算：Agent / 轮次 / 会话
//!
//! 全部是值类型：check 返回更新后的副本，拒绝时原值不变。同一批调用要么全部放行，要么全部拒绝。

use std::time::Instant;

use crate::breaker::error::{BreakerError, LimitDetails, LimitScope};
use crate::breaker::rate_limiter::RateLimiter;

/// 所有计数器共用的「已用 + 本次 <= 上限」检查
fn admit(scope: LimitScope, used: usize, n: usize, max: usize) -> Result<usize, BreakerError> {
    match used.checked_add(n) {
        Some(total) if total <= max => Ok(total),
        _ => Err(BreakerError::LimitExceeded(LimitDetails::new(scope, used, n, max))),
    }
}

/// 第二级：单个 Agent 一次任务内的技能调用预算，任务结束即丢弃
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentBudget {
    pub skill_calls: usize,
    pub max_skill_calls: usize,
}

impl AgentBudget {
    pub fn new(max_skill_calls: usize) -> Self {
        Self {
            skill_calls: 0,
            max_skill_calls,
        }
    }

    pub fn check(&self, call_count: usize) -> Result<Self, BreakerError> {
        let skill_calls = admit(
            LimitScope::AgentSkillCalls,
            self.skill_calls,
            call_count,
            self.max_skill_calls,
        )?;
        Ok(Self {
            skill_calls,
            ..*self
        })
    }

    pub fn remaining(&self) -> usize {
        self.max_skill_calls.saturating_sub(self.skill_calls)
    }
}

impl Default for AgentBudget {
    fn default() -> Self {
        Self::new(5)
    }
}

/// 第三级：单个用户轮次内的派发数与技能调用总数，两个计数器独立检查
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnBudget {
    pub agents_dispatched: usize,
    pub max_agents: usize,
    pub skill_calls: usize,
    pub max_skill_calls: usize,
}

impl TurnBudget {
    pub fn new(max_agents: usize, max_skill_calls: usize) -> Self {
        Self {
            agents_dispatched: 0,
            max_agents,
            skill_calls: 0,
            max_skill_calls,
        }
    }

    pub fn check_agents(&self, n: usize) -> Result<Self, BreakerError> {
        let agents_dispatched = admit(
            LimitScope::TurnAgents,
            self.agents_dispatched,
            n,
            self.max_agents,
        )?;
        Ok(Self {
            agents_dispatched,
            ..*self
        })
    }

    pub fn check_skill_calls(&self, n: usize) -> Result<Self, BreakerError> {
        let skill_calls = admit(
            LimitScope::TurnSkillCalls,
            self.skill_calls,
            n,
            self.max_skill_calls,
        )?;
        Ok(Self {
            skill_calls,
            ..*self
        })
    }
}

impl Default for TurnBudget {
    fn default() -> Self {
        Self::new(8, 30)
    }
}

/// 第四级：会话级滑动窗口，随会话存活
#[derive(Debug, Clone)]
pub struct ConversationBudget {
    limiter: RateLimiter,
}

impl ConversationBudget {
    pub fn new(max_calls: usize, window_ms: u64) -> Self {
        Self {
            limiter: RateLimiter::new(max_calls, window_ms),
        }
    }

    pub fn check(&self, n: usize) -> Result<Self, BreakerError> {
        self.check_at(n, Instant::now())
    }

    pub fn check_at(&self, n: usize, now: Instant) -> Result<Self, BreakerError> {
        match self.limiter.check_at(n, now) {
            Ok(limiter) => Ok(Self { limiter }),
            Err(e) => {
                let mut details =
                    LimitDetails::new(LimitScope::ConversationCalls, e.current_count, n, e.max_calls);
                details.window_ms = Some(e.window_ms);
                Err(BreakerError::LimitExceeded(details))
            }
        }
    }

    pub fn calls_in_window_at(&self, now: Instant) -> usize {
        self.limiter.count_at(now)
    }

    pub fn max_calls(&self) -> usize {
        self.limiter.max_calls()
    }
}

impl Default for ConversationBudget {
    fn default() -> Self {
        Self::new(50, 300_000)
    }
}

/// check_all 放行后返回的三份新状态（保险丝不在其中，它是进程级共享的）
#[derive(Debug, Clone)]
pub struct Budgets {
    pub agent: AgentBudget,
    pub turn: TurnBudget,
    pub conversation: ConversationBudget,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_budget_is_additive() {
        let b = AgentBudget::new(5);
        let b = b.check(2).unwrap().check(3).unwrap();
        assert_eq!(b.skill_calls, 5);
        assert_eq!(b.remaining(), 0);

        match b.check(1) {
            Err(BreakerError::LimitExceeded(d)) => {
                assert_eq!(d.level, 2);
                assert_eq!(d.scope, LimitScope::AgentSkillCalls);
                assert_eq!(d.used, 5);
                assert_eq!(d.max, 5);
            }
            other => panic!("Expected LimitExceeded, got {:?}", other),
        }
    }

    #[test]
    fn test_agent_rejection_never_partially_admits() {
        let b = AgentBudget::new(5).check(3).unwrap();
        assert!(b.check(3).is_err());
        // 原值不变，剩余额度仍可用
        assert_eq!(b.skill_calls, 3);
        assert_eq!(b.check(2).unwrap().skill_calls, 5);
    }

    #[test]
    fn test_huge_batch_is_rejected_not_wrapped() {
        let b = AgentBudget::new(5).check(1).unwrap();
        let err = b.check(usize::MAX).unwrap_err();
        assert_eq!(err.level(), 2);
        assert_eq!(b.skill_calls, 1);

        let t = TurnBudget::new(usize::MAX, usize::MAX).check_agents(1).unwrap();
        assert!(t.check_agents(usize::MAX).is_err());
        assert!(t.check_skill_calls(usize::MAX).is_ok());
        let t = t.check_skill_calls(1).unwrap();
        assert!(t.check_skill_calls(usize::MAX).is_err());
    }

    #[test]
    fn test_turn_counters_are_independent() {
        let t = TurnBudget::new(2, 3);
        let t = t.check_agents(2).unwrap();
        assert!(t.check_agents(1).is_err());
        let t = t.check_skill_calls(3).unwrap();
        assert_eq!(t.agents_dispatched, 2);
        assert_eq!(t.skill_calls, 3);

        match t.check_skill_calls(1) {
            Err(BreakerError::LimitExceeded(d)) => {
                assert_eq!(d.level, 3);
                assert_eq!(d.scope, LimitScope::TurnSkillCalls);
            }
            other => panic!("Expected LimitExceeded, got {:?}", other),
        }
    }

    #[test]
    fn test_conversation_budget_reports_window() {
        let now = Instant::now();
        let c = ConversationBudget::new(2, 1_000).check_at(2, now).unwrap();
        match c.check_at(1, now) {
            Err(BreakerError::LimitExceeded(d)) => {
                assert_eq!(d.level, 4);
                assert_eq!(d.used, 2);
                assert_eq!(d.max, 2);
                assert_eq!(d.window_ms, Some(1_000));
            }
            other => panic!("Expected LimitExceeded, got {:?}", other),
        }
        assert_eq!(c.calls_in_window_at(now), 2);
    }

    #[test]
    fn test_defaults() {
        assert_eq!(AgentBudget::default().max_skill_calls, 5);
        let t = TurnBudget::default();
        assert_eq!((t.max_agents, t.max_skill_calls), (8, 30));
        assert_eq!(ConversationBudget::default().max_calls(), 50);
    }
}
