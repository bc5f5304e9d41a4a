//! Mock LLM 客户端（用于测试与本地运行，无需 API）
//!
//! - MockLlmClient：回显最后一条 User 消息作为最终回复
//! - ScriptedLlmClient：按消息中出现的标记选择脚本，依次返回预设的 Completion；并发的多个 Agent 互不干扰

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::{Completion, LlmClient, LlmError};
use crate::memory::{Message, Role};

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat(&self, messages: &[Message], _skills: &[Value]) -> Result<Completion, LlmError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(Completion::text(format!("Echo from Mock: {last_user}")))
    }
}

struct Script {
    marker: String,
    replies: VecDeque<Result<Completion, LlmError>>,
}

/// 脚本化客户端：第一条包含 marker 的脚本生效；脚本耗尽或无匹配时返回 fallback 文本
#[derive(Default)]
pub struct ScriptedLlmClient {
    scripts: Mutex<Vec<Script>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, marker: impl Into<String>, replies: Vec<Completion>) -> Self {
        self.on_results(marker, replies.into_iter().map(Ok).collect())
    }

    pub fn on_results(
        self,
        marker: impl Into<String>,
        replies: Vec<Result<Completion, LlmError>>,
    ) -> Self {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Script {
                marker: marker.into(),
                replies: replies.into(),
            });
        self
    }

    /// 至今收到的所有请求（按到达顺序）
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn chat(&self, messages: &[Message], _skills: &[Value]) -> Result<Completion, LlmError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(messages.to_vec());

        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        let script = scripts.iter_mut().find(|s| {
            messages
                .iter()
                .filter(|m| m.role == Role::System)
                .any(|m| m.content.contains(&s.marker))
        });
        match script.and_then(|s| s.replies.pop_front()) {
            Some(reply) => reply,
            None => Ok(Completion::text("done")),
        }
    }
}
