//! 等待一组 Agent 任务
//!
//! WaitAll：等到全部完成或超时，返回届时已完成的结果；WaitAny：任一完成（或超时）即返回已完成的全部结果。
//! 两种模式都不取消未完成的任务：它们的句柄留在调用方的表中，可再次等待或自行 abort。
//! 表中不存在的 agent_id 直接忽略。

use std::collections::HashMap;
use std::time::Duration;

use futures_util::future::select_all;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{timeout_at, Instant};

use crate::scheduler::types::{AgentExecutionResult, AgentId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    All,
    Any,
}

/// 等待指定 Agent；已收割的句柄从 agent_tasks 中移除，超时未完成的原样放回
pub async fn wait_for_agents(
    agent_tasks: &mut HashMap<AgentId, JoinHandle<AgentExecutionResult>>,
    agent_ids: &[AgentId],
    mode: WaitMode,
    timeout: Option<Duration>,
) -> HashMap<AgentId, AgentExecutionResult> {
    let deadline = timeout.map(|t| Instant::now() + t);
    match mode {
        WaitMode::All => wait_all(agent_tasks, agent_ids, deadline).await,
        WaitMode::Any => wait_any(agent_tasks, agent_ids, deadline).await,
    }
}

async fn wait_all(
    agent_tasks: &mut HashMap<AgentId, JoinHandle<AgentExecutionResult>>,
    agent_ids: &[AgentId],
    deadline: Option<Instant>,
) -> HashMap<AgentId, AgentExecutionResult> {
    let mut results = HashMap::new();
    for agent_id in agent_ids {
        let Some(mut handle) = agent_tasks.remove(agent_id) else {
            continue;
        };
        // timeout_at 先轮询内部 future，截止后已完成的任务仍会被收割
        let joined = match deadline {
            Some(deadline) => timeout_at(deadline, &mut handle).await.ok(),
            None => Some((&mut handle).await),
        };
        match joined {
            Some(joined) => {
                results.insert(agent_id.clone(), result_from_join(joined));
            }
            None => {
                agent_tasks.insert(agent_id.clone(), handle);
            }
        }
    }
    results
}

async fn wait_any(
    agent_tasks: &mut HashMap<AgentId, JoinHandle<AgentExecutionResult>>,
    agent_ids: &[AgentId],
    deadline: Option<Instant>,
) -> HashMap<AgentId, AgentExecutionResult> {
    let mut results = HashMap::new();
    let mut pending: Vec<(AgentId, JoinHandle<AgentExecutionResult>)> = agent_ids
        .iter()
        .filter_map(|id| agent_tasks.remove(id).map(|handle| (id.clone(), handle)))
        .collect();
    if pending.is_empty() {
        return results;
    }

    let first = {
        let select = select_all(pending.iter_mut().map(|(_, handle)| handle));
        let out = match deadline {
            Some(deadline) => timeout_at(deadline, select).await.ok(),
            None => Some(select.await),
        };
        out.map(|(joined, index, _rest)| (joined, index))
    };

    if let Some((joined, index)) = first {
        let (agent_id, _) = pending.swap_remove(index);
        results.insert(agent_id, result_from_join(joined));
    }

    for (agent_id, handle) in pending {
        if handle.is_finished() {
            results.insert(agent_id, result_from_join(handle.await));
        } else {
            agent_tasks.insert(agent_id, handle);
        }
    }
    results
}

/// 任务 panic 或被取消时转为 failed 结果，不向外传播
pub(crate) fn result_from_join(
    joined: Result<AgentExecutionResult, JoinError>,
) -> AgentExecutionResult {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            AgentExecutionResult::failed(format!("agent crashed: {message}"), 0)
        }
        Err(_) => AgentExecutionResult::failed("agent task was cancelled", 0),
    }
}
