//! 记忆层：会话短期记忆与压缩监视

pub mod conversation;
pub mod monitor;

pub use conversation::{CompactionWindow, ConversationMemory, Message, Role};
pub use monitor::{CompactionMonitor, CompactionRequest};
