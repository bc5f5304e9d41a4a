//! 可观测性：tracing 订阅器初始化
//!
//! 默认级别 info，RUST_LOG 覆盖。技能审计日志以 JSON 字符串字段输出（event = "skill_audit"）。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局订阅器；重复调用时保留已有的订阅器
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
