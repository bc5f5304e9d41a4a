//! 技能系统
//!
//! 技能是 Agent 可调用的命名能力（记忆检索 / 写入、任务、日历等集成）。
//! - **registry**: Skill trait 与按名查找的注册表
//! - **executor**: 先检索后写入的执行包装，附带超时与审计日志

mod executor;
mod registry;

pub use executor::{
    stub_response, ExecOptions, SearchSession, SkillClass, SkillError, SkillExecutor,
    SkillOutcome, DEFAULT_READ_SKILLS, DEFAULT_WRITE_SKILLS,
};
pub use registry::{Skill, SkillContext, SkillRegistry};
