//! Hive - 个人助理的多智能体编排核心
//!
//! 模块划分：
//! - **agent**: Agent 注册表与任务循环（LLM 技能调用 + 等待编排器回答）
//! - **breaker**: 四级熔断（技能保险丝、Agent / 轮次 / 会话预算）与滑动窗口限流
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、恢复策略、会话取消监管
//! - **engine**: 编排引擎：会话状态、轮次准入、波次执行、事件发布
//! - **llm**: LLM 客户端抽象与 Mock 实现
//! - **memory**: 对话记忆与压缩监视器
//! - **observability**: 日志初始化
//! - **scheduler**: 依赖图波次规划、并发执行与等待原语
//! - **skills**: 技能注册表与先检索后写入执行器

pub mod agent;
pub mod breaker;
pub mod config;
pub mod core;
pub mod engine;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod scheduler;
pub mod skills;

pub use engine::{Engine, EngineError, EngineEvent, EngineSettings, TurnOutcome};
