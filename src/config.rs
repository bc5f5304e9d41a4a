//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__BREAKER__MAX_MELTS=5`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::agent::AgentSettings;
use crate::breaker::{BreakerLimits, FusePolicy};
use crate::engine::EngineSettings;
use crate::skills::{DEFAULT_READ_SKILLS, DEFAULT_WRITE_SKILLS};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub breaker: BreakerSection,
    pub scheduler: SchedulerSection,
    pub skills: SkillsSection,
    pub agent: AgentSection,
    pub memory: MemorySection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 对话历史保留轮数（短期记忆）
    pub max_context_turns: usize,
    /// 第一级保险丝是否进程级共享
    pub process_wide_fuses: bool,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            max_context_turns: 20,
            process_wide_fuses: true,
        }
    }
}

/// [breaker] 段：四级熔断的阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub max_melts: usize,
    pub melt_window_ms: u64,
    pub cooldown_ms: u64,
    pub agent_max_skill_calls: usize,
    pub turn_max_agents: usize,
    pub turn_max_skill_calls: usize,
    pub conversation_max_calls: usize,
    pub conversation_window_ms: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            max_melts: 3,
            melt_window_ms: 60_000,
            cooldown_ms: 30_000,
            agent_max_skill_calls: 5,
            turn_max_agents: 8,
            turn_max_skill_calls: 30,
            conversation_max_calls: 50,
            conversation_window_ms: 300_000,
        }
    }
}

/// [scheduler] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// 单个 Agent 执行上限（秒），0 表示不限
    pub agent_timeout_secs: u64,
    /// 每一波等待上限（毫秒），到点未结束的 Agent 被中止；未设置表示一直等
    pub wait_timeout_ms: Option<u64>,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            agent_timeout_secs: 120,
            wait_timeout_ms: None,
        }
    }
}

/// [skills] 段：读 / 写技能分类与单次调用超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SkillsSection {
    pub read_skills: Vec<String>,
    pub write_skills: Vec<String>,
    pub skill_timeout_secs: u64,
}

impl Default for SkillsSection {
    fn default() -> Self {
        Self {
            read_skills: DEFAULT_READ_SKILLS.iter().map(|s| s.to_string()).collect(),
            write_skills: DEFAULT_WRITE_SKILLS.iter().map(|s| s.to_string()).collect(),
            skill_timeout_secs: 30,
        }
    }
}

/// [agent] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_iterations: usize,
    pub await_timeout_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            await_timeout_secs: 300,
        }
    }
}

/// [memory] 段：压缩阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub compaction_token_threshold: u64,
    pub keep_recent_messages: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            compaction_token_threshold: 8000,
            keep_recent_messages: 6,
        }
    }
}

impl AppConfig {
    pub fn breaker_limits(&self) -> BreakerLimits {
        let b = &self.breaker;
        BreakerLimits {
            fuse: FusePolicy {
                max_melts: b.max_melts,
                melt_window: Duration::from_millis(b.melt_window_ms),
                cooldown: Duration::from_millis(b.cooldown_ms),
            },
            agent_max_skill_calls: b.agent_max_skill_calls,
            turn_max_agents: b.turn_max_agents,
            turn_max_skill_calls: b.turn_max_skill_calls,
            conversation_max_calls: b.conversation_max_calls,
            conversation_window_ms: b.conversation_window_ms,
        }
    }

    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            max_iterations: self.agent.max_iterations,
            await_timeout: Duration::from_secs(self.agent.await_timeout_secs),
        }
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.scheduler.wait_timeout_ms.map(Duration::from_millis)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            breaker: self.breaker_limits(),
            process_wide_fuses: self.app.process_wide_fuses,
            agent: self.agent_settings(),
            agent_timeout: (self.scheduler.agent_timeout_secs > 0)
                .then(|| Duration::from_secs(self.scheduler.agent_timeout_secs)),
            read_skills: self.skills.read_skills.clone(),
            write_skills: self.skills.write_skills.clone(),
            skill_timeout_secs: self.skills.skill_timeout_secs,
            max_context_turns: self.app.max_context_turns,
            keep_recent_messages: self.memory.keep_recent_messages,
            compaction_token_threshold: self.memory.compaction_token_threshold,
            wave_timeout: self.wait_timeout(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
