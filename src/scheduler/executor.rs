//! 波次执行
//!
//! 先规划波次（环 / 未知依赖直接返回错误，不执行任何 Agent），再逐波执行：
//! 同一波内全部并发，波与波之间是同步屏障。上游未完成的 Agent 直接标记 skipped，从不调用 execute_fn；
//! execute_fn panic 只影响它自己，转成 failed 结果。
//!
//! 两种时限：agent_timeout 限制单个 Agent，wave_timeout 限制整波的等待；
//! 到点仍未结束的任务被中止并记为 timeout。调度层不知道被中止的任务用了多少次技能调用，
//! 这类结果的 tool_calls_used 为 0，需要时由调用方从自己的计数补上。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::scheduler::graph::plan_waves;
use crate::scheduler::types::{
    AgentExecutionResult, AgentId, DispatchSpec, SchedulerError, SchedulerEvent,
};
use crate::scheduler::wait::{wait_for_agents, WaitMode};

/// 上游结果快照：截至当前波之前的全部结果
pub type DepResults = Arc<HashMap<AgentId, AgentExecutionResult>>;

/// Agent 调度器：在给定运行时上按波次并发执行派发
#[derive(Debug, Clone)]
pub struct AgentScheduler {
    runtime: Handle,
    agent_timeout: Option<Duration>,
    wave_timeout: Option<Duration>,
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
}

impl AgentScheduler {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            agent_timeout: None,
            wave_timeout: None,
            events: None,
        }
    }

    /// 使用当前 tokio 运行时；须在运行时内调用
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// 单个 Agent 的执行上限，超出即为 timeout
    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = Some(timeout);
        self
    }

    /// 每一波的等待上限；到点未结束的 Agent 被中止
    pub fn with_wave_timeout(mut self, timeout: Duration) -> Self {
        self.wave_timeout = Some(timeout);
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn plan_waves(
        &self,
        dispatches: &HashMap<AgentId, DispatchSpec>,
    ) -> Result<Vec<Vec<AgentId>>, SchedulerError> {
        plan_waves(dispatches)
    }

    /// 在运行时上启动单个 Agent；返回的句柄可交给 wait_for_agents
    pub fn spawn_agent<F, Fut>(
        &self,
        spec: DispatchSpec,
        dep_results: DepResults,
        execute_fn: Arc<F>,
    ) -> JoinHandle<AgentExecutionResult>
    where
        F: Fn(DispatchSpec, DepResults) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AgentExecutionResult> + Send + 'static,
    {
        let limit = self.agent_timeout;
        self.runtime.spawn(async move {
            let agent_id = spec.agent_id.clone();
            let run = execute_fn(spec, dep_results);
            match limit {
                Some(limit) => tokio::time::timeout(limit, run).await.unwrap_or_else(|_| {
                    tracing::warn!(agent = %agent_id, timeout_ms = limit.as_millis() as u64, "agent timed out");
                    AgentExecutionResult::timeout(
                        format!("agent timed out after {}ms", limit.as_millis()),
                        0,
                    )
                }),
                None => run.await,
            }
        })
    }

    /// 执行整批派发，返回包含每一个 agent_id 的结果表
    pub async fn execute<F, Fut>(
        &self,
        dispatches: HashMap<AgentId, DispatchSpec>,
        execute_fn: F,
    ) -> Result<HashMap<AgentId, AgentExecutionResult>, SchedulerError>
    where
        F: Fn(DispatchSpec, DepResults) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AgentExecutionResult> + Send + 'static,
    {
        let waves = plan_waves(&dispatches)?;
        let execute_fn = Arc::new(execute_fn);
        let mut results: HashMap<AgentId, AgentExecutionResult> = HashMap::new();

        for (index, wave) in waves.into_iter().enumerate() {
            tracing::info!(wave = index, agents = ?wave, "wave started");
            self.emit(SchedulerEvent::WaveStarted {
                index,
                agents: wave.clone(),
            });

            let snapshot: DepResults = Arc::new(results.clone());
            let mut running = HashMap::new();
            let mut launched = Vec::new();

            for agent_id in wave {
                let spec = dispatches[&agent_id].clone();

                // 直接依赖都在之前的波次里；skipped 会逐层传递，所以只看直接依赖即可覆盖所有祖先
                let blocked_by = spec
                    .depends_on
                    .iter()
                    .find(|dep| !results.get(*dep).is_some_and(|r| r.is_completed()))
                    .cloned();

                if let Some(dep) = blocked_by {
                    tracing::info!(agent = %agent_id, dependency = %dep, "agent skipped");
                    let skipped = AgentExecutionResult::skipped(format!(
                        "skipped: dependency '{dep}' did not complete"
                    ));
                    self.emit(SchedulerEvent::AgentFinished {
                        agent_id: agent_id.clone(),
                        status: skipped.status,
                    });
                    results.insert(agent_id, skipped);
                    continue;
                }

                let handle = self.spawn_agent(spec, Arc::clone(&snapshot), Arc::clone(&execute_fn));
                running.insert(agent_id.clone(), handle);
                launched.push(agent_id);
            }

            let mut finished =
                wait_for_agents(&mut running, &launched, WaitMode::All, self.wave_timeout).await;
            for (agent_id, handle) in running.drain() {
                handle.abort();
                let limit = self.wave_timeout.unwrap_or_default();
                tracing::warn!(agent = %agent_id, wave = index, timeout_ms = limit.as_millis() as u64, "wave deadline passed, agent aborted");
                finished.insert(
                    agent_id,
                    AgentExecutionResult::timeout(
                        format!("wave deadline of {}ms passed", limit.as_millis()),
                        0,
                    ),
                );
            }
            for (agent_id, result) in finished {
                if !result.is_completed() {
                    tracing::warn!(agent = %agent_id, status = ?result.status, result = %result.result, "agent did not complete");
                }
                self.emit(SchedulerEvent::AgentFinished {
                    agent_id: agent_id.clone(),
                    status: result.status,
                });
                results.insert(agent_id, result);
            }

            tracing::info!(wave = index, "wave completed");
            self.emit(SchedulerEvent::WaveCompleted { index });
        }

        Ok(results)
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}
