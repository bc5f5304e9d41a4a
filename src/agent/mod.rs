//! Agent 运行时
//!
//! - **registry**: 活跃 Agent 的句柄表，按 {类型, 用户} 查找
//! - **runner**: 单次任务的 LLM 技能调用循环，受熔断与先检索后写入约束

pub mod registry;
pub mod runner;

pub use registry::{AgentHandle, AgentInput, AgentKey, AgentKind, AgentPhase, AgentRegistry};
pub use runner::{
    mission_channels, AgentRunner, AgentSettings, Mission, MissionChannels, MissionReport,
    TurnLedger, ASK_ORCHESTRATOR,
};
