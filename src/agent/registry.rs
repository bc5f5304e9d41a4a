//! Agent 注册表
//!
//! 以 {类型, 用户} 为键，保存活跃 Agent 的句柄（收件箱发送端 + 阶段观察端），查找结果要么有要么没有。
//! 读写锁保护的 HashMap，由编排引擎显式持有，不做全局单例。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{mpsc, watch};

use crate::scheduler::AgentId;

/// Agent 类型：持久的记忆 Agent（每用户一个）或一次性的子 Agent
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AgentKind {
    Memory,
    Sub(AgentId),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentKey {
    pub kind: AgentKind,
    pub user_id: String,
}

impl AgentKey {
    pub fn memory(user_id: impl Into<String>) -> Self {
        Self {
            kind: AgentKind::Memory,
            user_id: user_id.into(),
        }
    }

    pub fn sub(user_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            kind: AgentKind::Sub(agent_id.into()),
            user_id: user_id.into(),
        }
    }
}

/// Agent 阶段：Idle → Running → AwaitingExternal → Running → Idle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentPhase {
    Idle,
    Running,
    /// 等待编排器回答，附带问题
    AwaitingExternal(String),
}

/// 发往 Agent 私有收件箱的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentInput {
    Resume(String),
}

/// 活跃 Agent 的句柄
#[derive(Debug, Clone)]
pub struct AgentHandle {
    pub inbox: mpsc::Sender<AgentInput>,
    pub phase: watch::Receiver<AgentPhase>,
    /// 任务已放行的技能调用数，任务被外部中止后仍可读取
    pub calls: Arc<AtomicUsize>,
}

impl AgentHandle {
    pub fn phase(&self) -> AgentPhase {
        self.phase.borrow().clone()
    }

    pub fn tool_calls_used(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentKey, AgentHandle>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<AgentKey, AgentHandle>> {
        self.agents.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<AgentKey, AgentHandle>> {
        self.agents.write().unwrap_or_else(|e| e.into_inner())
    }

    /// 注册并返回被替换的旧句柄
    pub fn register(&self, key: AgentKey, handle: AgentHandle) -> Option<AgentHandle> {
        self.write().insert(key, handle)
    }

    pub fn lookup(&self, key: &AgentKey) -> Option<AgentHandle> {
        self.read().get(key).cloned()
    }

    pub fn remove(&self, key: &AgentKey) -> Option<AgentHandle> {
        self.write().remove(key)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// 某用户当前在等待编排器回答的 Agent
    pub fn awaiting(&self, user_id: &str) -> Vec<(AgentKey, String)> {
        self.read()
            .iter()
            .filter(|(key, _)| key.user_id == user_id)
            .filter_map(|(key, handle)| match handle.phase() {
                AgentPhase::AwaitingExternal(question) => Some((key.clone(), question)),
                _ => None,
            })
            .collect()
    }
}
