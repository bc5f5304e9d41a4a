//! Agent 调度：依赖图 → 波次 → 并发执行
//!
//! - **types**: 派发描述、执行结果、调度错误与事件
//! - **graph**: Kahn 拓扑排序，按波次输出
//! - **executor**: 逐波并发执行，失败向下游传递为 skipped，panic 就地转为 failed
//! - **wait**: WaitAll / WaitAny 等待原语

pub mod executor;
pub mod graph;
pub mod types;
pub mod wait;

pub use executor::{AgentScheduler, DepResults};
pub use graph::{plan_waves, DependencyGraph};
pub use types::{
    index_dispatches, AgentExecutionResult, AgentId, AgentStatus, DispatchSpec, SchedulerError,
    SchedulerEvent,
};
pub use wait::{wait_for_agents, WaitMode};
