//! 第一级：按技能名的保险丝
//!
//! 进程级共享，按技能名懒创建。窗口内熔断（melt）次数达到上限即熔断为 Open，冷却期过后自动恢复 Closed，无需人工复位。
//! 所有读写都在同一把锁内完成，多个 Agent 同时对同一技能 check / melt / reset 时保持原子性。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

/// 保险丝策略（"standard" 计数策略）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FusePolicy {
    /// 窗口内允许的最大熔断次数，达到即熔断
    pub max_melts: usize,
    /// 熔断计数窗口
    pub melt_window: Duration,
    /// 熔断后自动恢复前的冷却时长
    pub cooldown: Duration,
}

impl Default for FusePolicy {
    fn default() -> Self {
        Self {
            max_melts: 3,
            melt_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

/// check_skill 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuseStatus {
    Closed,
    CircuitOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FuseState {
    Closed,
    Open { until: Instant },
}

#[derive(Debug)]
struct Fuse {
    state: FuseState,
    melts: VecDeque<Instant>,
}

impl Fuse {
    fn new() -> Self {
        Self {
            state: FuseState::Closed,
            melts: VecDeque::new(),
        }
    }

    fn close(&mut self) {
        self.state = FuseState::Closed;
        self.melts.clear();
    }

    /// 冷却到期则自动闭合
    fn refresh(&mut self, now: Instant) {
        if let FuseState::Open { until } = self.state {
            if now >= until {
                self.close();
            }
        }
    }
}

/// 保险丝注册表：技能名 -> 保险丝
#[derive(Debug)]
pub struct FuseRegistry {
    policy: FusePolicy,
    fuses: Mutex<HashMap<String, Fuse>>,
}

static GLOBAL_FUSES: OnceLock<Arc<FuseRegistry>> = OnceLock::new();

impl FuseRegistry {
    pub fn new(policy: FusePolicy) -> Self {
        Self {
            policy,
            fuses: Mutex::new(HashMap::new()),
        }
    }

    /// 进程级注册表；首次访问时以给定策略创建，之后忽略参数
    pub fn global(policy: FusePolicy) -> Arc<FuseRegistry> {
        Arc::clone(GLOBAL_FUSES.get_or_init(|| Arc::new(FuseRegistry::new(policy))))
    }

    pub fn policy(&self) -> FusePolicy {
        self.policy
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Fuse>> {
        // 锁内不会 panic 留下半更新状态，中毒时直接取回数据
        self.fuses.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 幂等安装：已存在则不做任何事
    pub fn install(&self, skill_name: &str) {
        self.lock()
            .entry(skill_name.to_string())
            .or_insert_with(Fuse::new);
    }

    pub fn is_installed(&self, skill_name: &str) -> bool {
        self.lock().contains_key(skill_name)
    }

    pub fn check(&self, skill_name: &str) -> FuseStatus {
        self.check_at(skill_name, Instant::now())
    }

    /// 检查保险丝；不存在时自动安装并视为 Closed
    pub fn check_at(&self, skill_name: &str, now: Instant) -> FuseStatus {
        let mut fuses = self.lock();
        let fuse = fuses
            .entry(skill_name.to_string())
            .or_insert_with(Fuse::new);
        fuse.refresh(now);
        match fuse.state {
            FuseState::Closed => FuseStatus::Closed,
            FuseState::Open { .. } => FuseStatus::CircuitOpen,
        }
    }

    pub fn record_failure(&self, skill_name: &str) {
        self.record_failure_at(skill_name, Instant::now())
    }

    /// 记一次熔断；窗口内累计达到 max_melts 即熔断，冷却期内的失败不再计数
    pub fn record_failure_at(&self, skill_name: &str, now: Instant) {
        let policy = self.policy;
        let mut fuses = self.lock();
        let fuse = fuses
            .entry(skill_name.to_string())
            .or_insert_with(Fuse::new);
        fuse.refresh(now);
        if matches!(fuse.state, FuseState::Open { .. }) {
            return;
        }

        while let Some(oldest) = fuse.melts.front() {
            if now.saturating_duration_since(*oldest) >= policy.melt_window {
                fuse.melts.pop_front();
            } else {
                break;
            }
        }
        fuse.melts.push_back(now);

        if fuse.melts.len() >= policy.max_melts {
            fuse.state = FuseState::Open {
                until: now + policy.cooldown,
            };
            fuse.melts.clear();
            tracing::warn!(
                skill = skill_name,
                cooldown_ms = policy.cooldown.as_millis() as u64,
                "skill fuse blown"
            );
        }
    }

    /// 占位：熔断窗口本身会让旧的失败自然过期
    pub fn record_success(&self, _skill_name: &str) {}

    /// 强制闭合；不存在的保险丝不做任何事
    pub fn reset(&self, skill_name: &str) {
        if let Some(fuse) = self.lock().get_mut(skill_name) {
            fuse.close();
        }
    }
}

impl Default for FuseRegistry {
    fn default() -> Self {
        Self::new(FusePolicy::default())
    }
}
