//! 短期记忆：对话历史
//!
//! 保留最近 N 轮对话，超出时自动剪枝；同时精确记录已压缩的边界，供增量压缩只处理新消息。

use std::ops::Range;

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
    /// 技能调用结果
    Tool,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
        }
    }
}

/// 一次待压缩的区间，附带取出时的代次
///
/// 剪枝、压缩、清空都会移动下标，每次都让代次加一；代次对不上的区间不能再用。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompactionWindow {
    pub range: Range<usize>,
    epoch: u64,
}

/// 短期记忆：最近 N 轮对话（每轮含 user + assistant，故实际保留约 max_turns*2 条消息）
#[derive(Clone, Debug)]
pub struct ConversationMemory {
    messages: Vec<Message>,
    max_turns: usize,
    /// messages[..compacted_upto] 已经是压缩后的内容
    compacted_upto: usize,
    /// 下标移动的次数，只增不减
    epoch: u64,
}

impl ConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_turns,
            compacted_upto: 0,
            epoch: 0,
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
        self.prune();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.compacted_upto = 0;
        self.epoch += 1;
    }

    pub fn compacted_upto(&self) -> usize {
        self.compacted_upto
    }

    /// 待压缩区间：从上次边界到倒数 keep_recent 条之前；没有新内容时返回 None
    pub fn compaction_range(&self, keep_recent: usize) -> Option<Range<usize>> {
        let end = self.messages.len().saturating_sub(keep_recent);
        (end > self.compacted_upto).then(|| self.compacted_upto..end)
    }

    /// 同 compaction_range，但带上代次，供稍后 apply_compaction 校验
    pub fn compaction_window(&self, keep_recent: usize) -> Option<CompactionWindow> {
        self.compaction_range(keep_recent).map(|range| CompactionWindow {
            range,
            epoch: self.epoch,
        })
    }

    /// 用一条摘要替换窗口内的消息，边界移到摘要之后
    ///
    /// 取出窗口后若发生过剪枝、压缩或清空，下标已经失效，此时不做任何修改并返回 false。
    pub fn apply_compaction(&mut self, window: CompactionWindow, summary: impl Into<String>) -> bool {
        let CompactionWindow { range, epoch } = window;
        if epoch != self.epoch || range.start != self.compacted_upto || range.end > self.messages.len() {
            return false;
        }
        self.messages
            .splice(range.clone(), std::iter::once(Message::system(summary)));
        self.compacted_upto = range.start + 1;
        self.epoch += 1;
        true
    }

    /// 超出 max_turns*2 时丢弃最旧的消息，边界随之前移
    fn prune(&mut self) {
        if self.messages.len() > self.max_turns * 2 {
            let keep = self.max_turns * 2;
            let dropped = self.messages.len() - keep;
            self.messages.drain(..dropped);
            self.compacted_upto = self.compacted_upto.saturating_sub(dropped);
            self.epoch += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
