//! 压缩监视器
//!
//! 消费编排引擎发布的事件：累计每个会话自上次压缩以来的 token 用量，轮次结束时超过阈值就发出压缩请求。
//! 区间本身由 ConversationMemory 按精确边界计算，这里只决定「何时」。

use std::collections::HashMap;

use crate::engine::EngineEvent;

/// 请求对某个会话做一次增量压缩
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionRequest {
    pub conversation_id: String,
    pub tokens_since_last: u64,
}

#[derive(Debug)]
pub struct CompactionMonitor {
    threshold_tokens: u64,
    tokens: HashMap<String, u64>,
}

impl CompactionMonitor {
    pub fn new(threshold_tokens: u64) -> Self {
        Self {
            threshold_tokens,
            tokens: HashMap::new(),
        }
    }

    pub fn observe(&mut self, event: &EngineEvent) -> Option<CompactionRequest> {
        match event {
            EngineEvent::TokenUsage {
                conversation_id,
                prompt_tokens,
                completion_tokens,
                ..
            } => {
                *self.tokens.entry(conversation_id.clone()).or_insert(0) +=
                    prompt_tokens + completion_tokens;
                None
            }
            EngineEvent::TurnCompleted {
                conversation_id, ..
            } => {
                let used = self.tokens.get(conversation_id).copied().unwrap_or(0);
                if used < self.threshold_tokens {
                    return None;
                }
                self.tokens.insert(conversation_id.clone(), 0);
                Some(CompactionRequest {
                    conversation_id: conversation_id.clone(),
                    tokens_since_last: used,
                })
            }
            _ => None,
        }
    }

    pub fn pending_tokens(&self, conversation_id: &str) -> u64 {
        self.tokens.get(conversation_id).copied().unwrap_or(0)
    }
}
