//! 派发计划：让 LLM 把用户消息拆成带依赖的派发列表
//!
//! 期望的回复是一个 JSON 对象 `{"dispatches": [{"agent_id", "mission", "skills", "depends_on"}]}`；
//! 允许外面包一层 markdown 代码块或说明文字，取第一个 `{` 到最后一个 `}` 之间的内容解析。

use serde::Deserialize;

use crate::memory::Message;
use crate::scheduler::DispatchSpec;

/// 规划器系统提示的标记
pub const PLANNER_MARKER: &str = "[planner]";

/// 压缩器系统提示的标记
pub const COMPACTOR_MARKER: &str = "[compactor]";

#[derive(Debug, Deserialize)]
struct DispatchPlan {
    #[serde(default)]
    dispatches: Vec<DispatchSpec>,
}

pub fn planner_prompt(skill_names: &[String]) -> String {
    format!(
        "{PLANNER_MARKER} Break the user's request into agent dispatches. Reply with JSON only: \
         {{\"dispatches\": [{{\"agent_id\": \"...\", \"mission\": \"...\", \"skills\": [...], \"depends_on\": [...]}}]}}. \
         Use agent_id \"memory\" for anything that reads or writes the user's memory. \
         Known skills: {}.",
        if skill_names.is_empty() {
            "(none)".to_string()
        } else {
            skill_names.join(", ")
        }
    )
}

pub fn compactor_prompt() -> String {
    format!(
        "{COMPACTOR_MARKER} Summarize the following conversation excerpt in a few sentences. \
         Keep facts, decisions and open questions; drop greetings and repetition."
    )
}

/// 解析 LLM 回复中的派发计划
pub fn parse_plan(content: &str) -> Result<Vec<DispatchSpec>, String> {
    let start = content.find('{');
    let end = content.rfind('}');
    let body = match (start, end) {
        (Some(s), Some(e)) if s < e => &content[s..=e],
        _ => return Err(format!("no JSON object in planner reply: {}", preview(content))),
    };
    let plan: DispatchPlan =
        serde_json::from_str(body).map_err(|e| format!("invalid dispatch plan: {e}"))?;
    Ok(plan.dispatches)
}

/// 压缩输入：把待压缩的消息拼成一条 user 消息
pub fn compaction_messages(excerpt: &[Message]) -> Vec<Message> {
    let body = excerpt
        .iter()
        .map(|m| format!("{:?}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n");
    vec![Message::system(compactor_prompt()), Message::user(body)]
}

fn preview(s: &str) -> String {
    s.chars().take(80).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fenced_plan() {
        let reply = "Here is the plan:\n```json\n{\"dispatches\": [\
            {\"agent_id\": \"a\", \"mission\": \"find flights\", \"skills\": [\"flight_search\"]},\
            {\"agent_id\": \"b\", \"mission\": \"book\", \"depends_on\": [\"a\"]}]}\n```";
        let plan = parse_plan(reply).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[1].depends_on, vec!["a".to_string()]);
        assert!(plan[1].skills.is_empty());
    }

    #[test]
    fn test_empty_plan_is_allowed() {
        assert!(parse_plan("{}").unwrap().is_empty());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(parse_plan("sure, I'll do that").is_err());
        assert!(parse_plan("{\"dispatches\": 3}").is_err());
    }
}
