//! 技能执行器：先检索后写入
//!
//! 每个技能名归入读 / 写 / 透传三类之一。会话状态只有一个 has_searched 标志：
//! 任一读技能成功后置为 true 且不会回退；标志为 false 时写技能直接拒绝，不调用处理函数。
//! 每次实际执行都施加超时并输出结构化审计日志（JSON）。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tokio::time::timeout;

use crate::skills::registry::{Skill, SkillContext};

/// 默认读技能
pub const DEFAULT_READ_SKILLS: &[&str] = &[
    "memory_search",
    "memory_get",
    "memory_list",
    "task_search",
    "task_list",
];

/// 默认写技能
pub const DEFAULT_WRITE_SKILLS: &[&str] = &[
    "memory_store",
    "memory_update",
    "memory_delete",
    "task_create",
    "task_update",
    "task_complete",
    "task_delete",
];

/// 技能分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillClass {
    Read,
    Write,
    Passthrough,
}

/// 单次任务的检索状态；每个任务开始时新建
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchSession {
    pub has_searched: bool,
}

impl SearchSession {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SkillError {
    /// 策略拒绝：写之前必须先检索
    #[error("memory write '{skill}' rejected: search before writing")]
    MemoryWriteWithoutSearch { skill: String },

    #[error("skill '{skill}' failed: {reason}")]
    Failed { skill: String, reason: String },

    #[error("skill '{skill}' timed out")]
    Timeout { skill: String },
}

/// 执行结果与（可能更新的）会话，无论成败都返回会话
#[derive(Debug, Clone)]
pub struct SkillOutcome {
    pub result: Result<String, SkillError>,
    pub session: SearchSession,
}

/// 单次调用选项
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOptions {
    /// 覆盖执行器默认超时
    pub timeout: Option<Duration>,
}

pub struct SkillExecutor {
    read_skills: HashSet<String>,
    write_skills: HashSet<String>,
    timeout: Duration,
}

impl SkillExecutor {
    pub fn new(read_skills: Vec<String>, write_skills: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            read_skills: read_skills.into_iter().collect(),
            write_skills: write_skills.into_iter().collect(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn classify(&self, skill_name: &str) -> SkillClass {
        if self.read_skills.contains(skill_name) {
            SkillClass::Read
        } else if self.write_skills.contains(skill_name) {
            SkillClass::Write
        } else {
            SkillClass::Passthrough
        }
    }

    /// 不调用处理函数，判断该会话下此技能是否会被放行
    pub fn admits(&self, skill_name: &str, session: SearchSession) -> bool {
        session.has_searched || self.classify(skill_name) != SkillClass::Write
    }

    /// handler 为 None 时视为存根技能，返回固定的存根文本
    pub async fn execute(
        &self,
        skill_name: &str,
        handler: Option<Arc<dyn Skill>>,
        args: Value,
        ctx: &SkillContext,
        session: SearchSession,
        opts: ExecOptions,
    ) -> SkillOutcome {
        let class = self.classify(skill_name);

        if !self.admits(skill_name, session) {
            tracing::warn!(
                skill = skill_name,
                agent = %ctx.agent_id,
                "memory write attempted before any search"
            );
            return SkillOutcome {
                result: Err(SkillError::MemoryWriteWithoutSearch {
                    skill: skill_name.to_string(),
                }),
                session,
            };
        }

        let result = self
            .run(skill_name, handler, args, ctx, opts.timeout.unwrap_or(self.timeout))
            .await;

        let session = match (&result, class) {
            (Ok(_), SkillClass::Read) => SearchSession { has_searched: true },
            _ => session,
        };
        SkillOutcome { result, session }
    }

    async fn run(
        &self,
        skill_name: &str,
        handler: Option<Arc<dyn Skill>>,
        args: Value,
        ctx: &SkillContext,
        limit: Duration,
    ) -> Result<String, SkillError> {
        let Some(handler) = handler else {
            return Ok(stub_response(skill_name));
        };

        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = timeout(limit, handler.execute(args, ctx)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let audit = serde_json::json!({
            "event": "skill_audit",
            "skill": skill_name,
            "agent": ctx.agent_id,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::debug!(audit = %audit.to_string(), "skill");

        match result {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(reason)) => Err(SkillError::Failed {
                skill: skill_name.to_string(),
                reason,
            }),
            Err(_) => Err(SkillError::Timeout {
                skill: skill_name.to_string(),
            }),
        }
    }
}

impl Default for SkillExecutor {
    fn default() -> Self {
        Self::new(
            DEFAULT_READ_SKILLS.iter().map(|s| s.to_string()).collect(),
            DEFAULT_WRITE_SKILLS.iter().map(|s| s.to_string()).collect(),
            30,
        )
    }
}

pub fn stub_response(skill_name: &str) -> String {
    format!("[stub] {skill_name} is not implemented")
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        name: &'static str,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Skill for Counting {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "counting skill"
        }

        async fn execute(&self, _args: Value, _ctx: &SkillContext) -> Result<String, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err("backend down".to_string())
            } else {
                Ok(format!("{} ok", self.name))
            }
        }
    }

    struct Slow;

    #[async_trait]
    impl Skill for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "never finishes in time"
        }

        async fn execute(&self, _args: Value, _ctx: &SkillContext) -> Result<String, String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".to_string())
        }
    }

    fn skill(name: &'static str, fail: bool) -> (Arc<dyn Skill>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let s: Arc<dyn Skill> = Arc::new(Counting {
            name,
            calls: Arc::clone(&calls),
            fail,
        });
        (s, calls)
    }

    async fn call(
        exec: &SkillExecutor,
        name: &str,
        handler: Option<Arc<dyn Skill>>,
        session: SearchSession,
    ) -> SkillOutcome {
        exec.execute(
            name,
            handler,
            Value::Null,
            &SkillContext::default(),
            session,
            ExecOptions::default(),
        )
        .await
    }

    #[test]
    fn test_classify() {
        let exec = SkillExecutor::default();
        assert_eq!(exec.classify("memory_search"), SkillClass::Read);
        assert_eq!(exec.classify("memory_store"), SkillClass::Write);
        assert_eq!(exec.classify("calendar_list"), SkillClass::Passthrough);
    }

    #[test]
    fn test_admits() {
        let exec = SkillExecutor::default();
        let fresh = SearchSession::new();
        let searched = SearchSession { has_searched: true };
        assert!(!exec.admits("memory_store", fresh));
        assert!(exec.admits("memory_store", searched));
        assert!(exec.admits("memory_search", fresh));
        assert!(exec.admits("calendar_list", fresh));
    }

    #[tokio::test]
    async fn test_write_before_search_is_rejected_without_calling_handler() {
        let exec = SkillExecutor::default();
        let (store, calls) = skill("memory_store", false);
        let out = call(&exec, "memory_store", Some(store), SearchSession::new()).await;
        assert_eq!(
            out.result,
            Err(SkillError::MemoryWriteWithoutSearch {
                skill: "memory_store".into()
            })
        );
        assert!(!out.session.has_searched);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_search_then_multiple_writes() {
        let exec = SkillExecutor::default();
        let (search, _) = skill("memory_search", false);
        let (store, calls) = skill("memory_store", false);

        let out = call(&exec, "memory_search", Some(search), SearchSession::new()).await;
        assert!(out.result.is_ok());
        assert!(out.session.has_searched);

        let mut session = out.session;
        for _ in 0..3 {
            let out = call(&exec, "memory_store", Some(Arc::clone(&store)), session).await;
            assert_eq!(out.result.as_deref(), Ok("memory_store ok"));
            assert!(out.session.has_searched);
            session = out.session;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_search_does_not_unlock_writes() {
        let exec = SkillExecutor::default();
        let (search, _) = skill("memory_search", true);
        let out = call(&exec, "memory_search", Some(search), SearchSession::new()).await;
        assert!(matches!(out.result, Err(SkillError::Failed { .. })));
        assert!(!out.session.has_searched);
    }

    #[tokio::test]
    async fn test_passthrough_leaves_session_alone() {
        let exec = SkillExecutor::default();
        let (cal, calls) = skill("calendar_list", false);
        let out = call(&exec, "calendar_list", Some(cal), SearchSession::new()).await;
        assert!(out.result.is_ok());
        assert!(!out.session.has_searched);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stub_handler_returns_canned_response() {
        let exec = SkillExecutor::default();
        let out = call(&exec, "memory_search", None, SearchSession::new()).await;
        assert_eq!(out.result, Ok(stub_response("memory_search")));
        assert!(out.session.has_searched);
    }

    #[tokio::test]
    async fn test_timeout_option() {
        let exec = SkillExecutor::default();
        let out = exec
            .execute(
                "slow",
                Some(Arc::new(Slow)),
                Value::Null,
                &SkillContext::default(),
                SearchSession::new(),
                ExecOptions {
                    timeout: Some(Duration::from_millis(20)),
                },
            )
            .await;
        assert_eq!(out.result, Err(SkillError::Timeout { skill: "slow".into() }));
    }
}
