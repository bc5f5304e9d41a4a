//! 四级熔断器：技能保险丝 → Agent 预算 → 轮次预算 → 会话滑动窗口
//!
//! 每次技能调用前执行 check_all，按固定顺序逐级检查，首个失败的级别直接返回，后续级别不再评估。
//! 第二至四级是值状态，由调用方显式传递；只有第一级保险丝是进程级共享的可变状态。

pub mod error;
pub mod fuse;
pub mod limits;
pub mod rate_limiter;

use std::sync::Arc;
use std::time::Instant;

pub use error::{BreakerError, LimitDetails, LimitScope};
pub use fuse::{FusePolicy, FuseRegistry, FuseStatus};
pub use limits::{AgentBudget, Budgets, ConversationBudget, TurnBudget};
pub use rate_limiter::{RateLimitExceeded, RateLimiter};

/// 各级上限（对应配置 [breaker] 段）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerLimits {
    pub fuse: FusePolicy,
    pub agent_max_skill_calls: usize,
    pub turn_max_agents: usize,
    pub turn_max_skill_calls: usize,
    pub conversation_max_calls: usize,
    pub conversation_window_ms: u64,
}

impl Default for BreakerLimits {
    fn default() -> Self {
        Self {
            fuse: FusePolicy::default(),
            agent_max_skill_calls: 5,
            turn_max_agents: 8,
            turn_max_skill_calls: 30,
            conversation_max_calls: 50,
            conversation_window_ms: 300_000,
        }
    }
}

/// 熔断器：持有保险丝注册表与各级默认上限
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    fuses: Arc<FuseRegistry>,
    limits: BreakerLimits,
}

impl CircuitBreaker {
    pub fn new(fuses: Arc<FuseRegistry>, limits: BreakerLimits) -> Self {
        Self { fuses, limits }
    }

    /// 使用进程级保险丝注册表
    pub fn global(limits: BreakerLimits) -> Self {
        Self::new(FuseRegistry::global(limits.fuse), limits)
    }

    /// 独立的保险丝注册表（测试或隔离的子系统使用）
    pub fn isolated(limits: BreakerLimits) -> Self {
        Self::new(Arc::new(FuseRegistry::new(limits.fuse)), limits)
    }

    pub fn limits(&self) -> &BreakerLimits {
        &self.limits
    }

    pub fn fuses(&self) -> &Arc<FuseRegistry> {
        &self.fuses
    }

    // ---- Level 1 ----

    pub fn install_skill_fuse(&self, skill_name: &str) {
        self.fuses.install(skill_name);
    }

    pub fn check_skill(&self, skill_name: &str) -> FuseStatus {
        self.fuses.check(skill_name)
    }

    pub fn record_skill_failure(&self, skill_name: &str) {
        self.fuses.record_failure(skill_name);
    }

    pub fn record_skill_success(&self, skill_name: &str) {
        self.fuses.record_success(skill_name);
    }

    pub fn reset_skill_fuse(&self, skill_name: &str) {
        self.fuses.reset(skill_name);
    }

    // ---- Level 2-4 ----

    pub fn new_agent_state(&self) -> AgentBudget {
        AgentBudget::new(self.limits.agent_max_skill_calls)
    }

    pub fn new_turn_state(&self) -> TurnBudget {
        TurnBudget::new(self.limits.turn_max_agents, self.limits.turn_max_skill_calls)
    }

    pub fn new_conversation_state(&self) -> ConversationBudget {
        ConversationBudget::new(
            self.limits.conversation_max_calls,
            self.limits.conversation_window_ms,
        )
    }

    pub fn check_agent(
        &self,
        state: &AgentBudget,
        call_count: usize,
    ) -> Result<AgentBudget, BreakerError> {
        state.check(call_count)
    }

    pub fn check_turn_agents(&self, state: &TurnBudget, n: usize) -> Result<TurnBudget, BreakerError> {
        state.check_agents(n)
    }

    pub fn check_turn_skill_calls(
        &self,
        state: &TurnBudget,
        n: usize,
    ) -> Result<TurnBudget, BreakerError> {
        state.check_skill_calls(n)
    }

    pub fn check_conversation(
        &self,
        state: &ConversationBudget,
        n: usize,
    ) -> Result<ConversationBudget, BreakerError> {
        state.check(n)
    }

    pub fn check_all(
        &self,
        skill_name: &str,
        agent: &AgentBudget,
        turn: &TurnBudget,
        conversation: &ConversationBudget,
    ) -> Result<Budgets, BreakerError> {
        self.check_all_at(skill_name, agent, turn, conversation, Instant::now())
    }

    /// 顺序固定为 1 → 2 → 3 → 4，任一级失败立即返回
    pub fn check_all_at(
        &self,
        skill_name: &str,
        agent: &AgentBudget,
        turn: &TurnBudget,
        conversation: &ConversationBudget,
        now: Instant,
    ) -> Result<Budgets, BreakerError> {
        if self.fuses.check_at(skill_name, now) == FuseStatus::CircuitOpen {
            return Err(BreakerError::CircuitOpen {
                skill: skill_name.to_string(),
            });
        }
        let agent = agent.check(1)?;
        let turn = turn.check_skill_calls(1)?;
        let conversation = conversation.check_at(1, now)?;
        Ok(Budgets {
            agent,
            turn,
            conversation,
        })
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::isolated(BreakerLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blow(breaker: &CircuitBreaker, skill: &str, now: Instant) {
        for _ in 0..breaker.limits().fuse.max_melts {
            breaker.fuses().record_failure_at(skill, now);
        }
    }

    #[test]
    fn test_check_all_threads_all_three_states() {
        let breaker = CircuitBreaker::default();
        let now = Instant::now();
        let out = breaker
            .check_all_at(
                "memory_search",
                &breaker.new_agent_state(),
                &breaker.new_turn_state(),
                &breaker.new_conversation_state(),
                now,
            )
            .unwrap();
        assert_eq!(out.agent.skill_calls, 1);
        assert_eq!(out.turn.skill_calls, 1);
        assert_eq!(out.conversation.calls_in_window_at(now), 1);
    }

    #[test]
    fn test_level_checks_reject_without_mutating() {
        let breaker = CircuitBreaker::default();
        let agent = breaker.check_agent(&breaker.new_agent_state(), 5).unwrap();
        assert!(breaker.check_agent(&agent, 1).is_err());
        assert_eq!(agent.skill_calls, 5);

        let turn = breaker.check_turn_agents(&breaker.new_turn_state(), 8).unwrap();
        assert_eq!(breaker.check_turn_agents(&turn, 1).unwrap_err().level(), 3);
        let turn = breaker.check_turn_skill_calls(&turn, 30).unwrap();
        assert!(breaker.check_turn_skill_calls(&turn, 1).is_err());

        let conversation = breaker
            .check_conversation(&breaker.new_conversation_state(), 50)
            .unwrap();
        assert_eq!(
            breaker.check_conversation(&conversation, 1).unwrap_err().level(),
            4
        );
    }

    #[test]
    fn test_open_fuse_wins_over_exhausted_budget() {
        let breaker = CircuitBreaker::default();
        let now = Instant::now();
        blow(&breaker, "s", now);
        let exhausted = AgentBudget::new(0);
        let err = breaker
            .check_all_at(
                "s",
                &exhausted,
                &breaker.new_turn_state(),
                &breaker.new_conversation_state(),
                now,
            )
            .unwrap_err();
        assert_eq!(err, BreakerError::CircuitOpen { skill: "s".into() });
        assert_eq!(err.level(), 1);
    }

    #[test]
    fn test_agent_checked_before_turn_and_conversation() {
        let breaker = CircuitBreaker::default();
        let now = Instant::now();
        let err = breaker
            .check_all_at(
                "s",
                &AgentBudget::new(0),
                &TurnBudget::new(1, 0),
                &ConversationBudget::new(0, 1_000),
                now,
            )
            .unwrap_err();
        assert_eq!(err.level(), 2);
        assert_eq!(err.scope(), "agent_skill_calls");

        let err = breaker
            .check_all_at(
                "s",
                &AgentBudget::new(1),
                &TurnBudget::new(1, 0),
                &ConversationBudget::new(0, 1_000),
                now,
            )
            .unwrap_err();
        assert_eq!(err.level(), 3);

        let err = breaker
            .check_all_at(
                "s",
                &AgentBudget::new(1),
                &TurnBudget::new(1, 1),
                &ConversationBudget::new(0, 1_000),
                now,
            )
            .unwrap_err();
        assert_eq!(err.level(), 4);
        assert_eq!(err.scope(), "conversation_calls");
    }

    #[test]
    fn test_failed_check_all_leaves_inputs_untouched() {
        let breaker = CircuitBreaker::default();
        let now = Instant::now();
        let agent = AgentBudget::new(3);
        let turn = TurnBudget::new(1, 5);
        let conversation = ConversationBudget::new(0, 1_000);
        assert!(breaker
            .check_all_at("s", &agent, &turn, &conversation, now)
            .is_err());
        assert_eq!(agent.skill_calls, 0);
        assert_eq!(turn.skill_calls, 0);
    }

    #[test]
    fn test_reset_reopens_skill() {
        let breaker = CircuitBreaker::default();
        let now = Instant::now();
        blow(&breaker, "s", now);
        assert_eq!(breaker.fuses().check_at("s", now), FuseStatus::CircuitOpen);
        breaker.reset_skill_fuse("s");
        assert_eq!(breaker.check_skill("s"), FuseStatus::Closed);
    }
}
