//! Agent 任务循环
//!
//! 单个任务：构造提示 → 调用 LLM → 逐个执行技能调用 → 结果回填 → 下一轮，直到 LLM 给出最终回复。
//! 每次技能调用前先过先检索后写入闸门，再过四级熔断 check_all，放行后才交给技能执行器。
//! 策略性拒绝经 RecoveryEngine 转为纠正提示交回 LLM；预算耗尽、LLM 故障、取消与等待超时则结束任务。
//!
//! 内置伪技能 ask_orchestrator：任务挂起在私有收件箱上，阶段切到 AwaitingExternal，收到 Resume 后继续。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::agent::registry::{AgentHandle, AgentInput, AgentPhase};
use crate::breaker::{AgentBudget, CircuitBreaker, ConversationBudget, TurnBudget};
use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::llm::{Completion, LlmClient, TokenUsage, ToolCall};
use crate::memory::Message;
use crate::scheduler::{AgentExecutionResult, DepResults, DispatchSpec};
use crate::skills::{
    ExecOptions, SearchSession, SkillContext, SkillError, SkillExecutor, SkillRegistry,
};

/// 向编排器提问并等待回答的伪技能
pub const ASK_ORCHESTRATOR: &str = "ask_orchestrator";

/// 收件箱容量
const INBOX_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct AgentSettings {
    /// 单个任务内 LLM 往返上限
    pub max_iterations: usize,
    /// ask_orchestrator 等待回答的上限
    pub await_timeout: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            await_timeout: Duration::from_secs(300),
        }
    }
}

/// 本轮共享的第三级状态，外加所属会话的第四级状态
///
/// conversation 由同一会话的所有轮次共用，并发轮次看到的是同一个滑动窗口。
/// 加锁顺序固定为先 TurnLedger 后 conversation。
#[derive(Debug, Clone)]
pub struct TurnLedger {
    pub turn: TurnBudget,
    pub conversation: Arc<Mutex<ConversationBudget>>,
}

impl TurnLedger {
    pub fn new(turn: TurnBudget, conversation: Arc<Mutex<ConversationBudget>>) -> Self {
        Self { turn, conversation }
    }
}

/// 一次任务的输入
#[derive(Debug, Clone)]
pub struct Mission {
    pub spec: DispatchSpec,
    pub deps: DepResults,
    pub ctx: SkillContext,
    /// 持久 Agent 之前任务的记录，放在系统提示之后
    pub history: Vec<Message>,
}

/// 任务一侧的通道：私有收件箱、阶段发布端、取消令牌、已用调用计数
pub struct MissionChannels {
    inbox: mpsc::Receiver<AgentInput>,
    phase: watch::Sender<AgentPhase>,
    cancel: CancellationToken,
    calls: Arc<AtomicUsize>,
}

/// 新建一对句柄 / 通道：句柄交给注册表，通道交给任务
pub fn mission_channels(cancel: CancellationToken) -> (AgentHandle, MissionChannels) {
    let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
    let (phase_tx, phase_rx) = watch::channel(AgentPhase::Idle);
    let calls = Arc::new(AtomicUsize::new(0));
    (
        AgentHandle {
            inbox: inbox_tx,
            phase: phase_rx,
            calls: Arc::clone(&calls),
        },
        MissionChannels {
            inbox: inbox_rx,
            phase: phase_tx,
            cancel,
            calls,
        },
    )
}

/// 任务结束后的汇报
#[derive(Debug, Clone)]
pub struct MissionReport {
    pub result: AgentExecutionResult,
    pub usage: TokenUsage,
    /// 除系统提示外的全部消息（含 history）
    pub transcript: Vec<Message>,
}

struct MissionState {
    messages: Vec<Message>,
    budget: AgentBudget,
    session: SearchSession,
    tool_calls_used: usize,
    usage: TokenUsage,
}

pub struct AgentRunner {
    llm: Arc<dyn LlmClient>,
    skills: Arc<SkillRegistry>,
    executor: Arc<SkillExecutor>,
    breaker: CircuitBreaker,
    recovery: RecoveryEngine,
    settings: AgentSettings,
}

impl AgentRunner {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        skills: Arc<SkillRegistry>,
        executor: Arc<SkillExecutor>,
        breaker: CircuitBreaker,
        settings: AgentSettings,
    ) -> Self {
        Self {
            llm,
            skills,
            executor,
            breaker,
            recovery: RecoveryEngine::new(),
            settings,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn run(
        &self,
        mission: Mission,
        mut channels: MissionChannels,
        ledger: &Mutex<TurnLedger>,
    ) -> MissionReport {
        channels.phase.send_replace(AgentPhase::Running);

        let mut messages = vec![Message::system(system_prompt(&mission))];
        messages.extend(mission.history.iter().cloned());
        messages.push(Message::user(mission.spec.mission.clone()));

        let mut state = MissionState {
            messages,
            budget: self.breaker.new_agent_state(),
            session: SearchSession::new(),
            tool_calls_used: 0,
            usage: TokenUsage::default(),
        };

        let outcome = self.drive(&mission, &mut channels, ledger, &mut state).await;
        channels.phase.send_replace(AgentPhase::Idle);

        let agent_id = &mission.spec.agent_id;
        let used = state.tool_calls_used;
        let result = match outcome {
            Ok(answer) => {
                tracing::info!(agent = %agent_id, tool_calls = used, "mission completed");
                AgentExecutionResult::completed(answer, used)
            }
            Err(err @ AgentError::AwaitTimeout(_)) => {
                tracing::warn!(agent = %agent_id, error = %err, "mission timed out");
                AgentExecutionResult::timeout(err.to_string(), used)
            }
            Err(err) => {
                tracing::warn!(agent = %agent_id, error = %err, "mission failed");
                AgentExecutionResult::failed(err.to_string(), used)
            }
        };

        state.messages.remove(0);
        MissionReport {
            result,
            usage: state.usage,
            transcript: state.messages,
        }
    }

    async fn drive(
        &self,
        mission: &Mission,
        channels: &mut MissionChannels,
        ledger: &Mutex<TurnLedger>,
        state: &mut MissionState,
    ) -> Result<String, AgentError> {
        let mut schema = self.skills.schema_for(&mission.spec.skills);
        schema.push(ask_orchestrator_schema());

        for _ in 0..self.settings.max_iterations {
            let completion = tokio::select! {
                _ = channels.cancel.cancelled() => return Err(AgentError::Cancelled),
                completion = self.llm.chat(&state.messages, &schema) => completion?,
            };
            state.usage.add(completion.usage);

            if completion.tool_calls.is_empty() {
                state.messages.push(Message::assistant(completion.content.clone()));
                return Ok(completion.content);
            }
            state.messages.push(Message::assistant(describe_calls(&completion)));

            for call in &completion.tool_calls {
                let observation = match self.invoke(mission, channels, ledger, state, call).await {
                    Ok(output) => output,
                    Err(err) => match self.recovery.handle(&err, &mission.spec.skills) {
                        RecoveryAction::RetryWithPrompt(prompt) => {
                            tracing::debug!(agent = %mission.spec.agent_id, skill = %call.skill, error = %err, "returning guidance to model");
                            prompt
                        }
                        RecoveryAction::Abort => return Err(err),
                    },
                };
                state
                    .messages
                    .push(Message::tool(format!("[{}] {}", call.skill, observation)));
            }
        }

        Err(AgentError::MaxIterations(self.settings.max_iterations))
    }

    async fn invoke(
        &self,
        mission: &Mission,
        channels: &mut MissionChannels,
        ledger: &Mutex<TurnLedger>,
        state: &mut MissionState,
        call: &ToolCall,
    ) -> Result<String, AgentError> {
        if call.skill == ASK_ORCHESTRATOR {
            return self.await_orchestrator(mission, channels, &call.args).await;
        }
        if !mission.spec.skills.contains(&call.skill) {
            return Err(AgentError::SkillOutOfScope(call.skill.clone()));
        }
        // 先检索后写入的拒绝不消耗预算
        if !self.executor.admits(&call.skill, state.session) {
            return Err(SkillError::MemoryWriteWithoutSearch {
                skill: call.skill.clone(),
            }
            .into());
        }

        {
            let mut ledger = ledger.lock().await;
            let shared = Arc::clone(&ledger.conversation);
            let mut conversation = shared.lock().await;
            let budgets = self.breaker.check_all(
                &call.skill,
                &state.budget,
                &ledger.turn,
                &conversation,
            )?;
            state.budget = budgets.agent;
            ledger.turn = budgets.turn;
            *conversation = budgets.conversation;
        }
        state.tool_calls_used += 1;
        channels.calls.store(state.tool_calls_used, Ordering::Release);

        let outcome = self
            .executor
            .execute(
                &call.skill,
                self.skills.get(&call.skill),
                call.args.clone(),
                &mission.ctx,
                state.session,
                ExecOptions::default(),
            )
            .await;
        state.session = outcome.session;

        match outcome.result {
            Ok(output) => {
                self.breaker.record_skill_success(&call.skill);
                Ok(output)
            }
            Err(err @ SkillError::MemoryWriteWithoutSearch { .. }) => Err(err.into()),
            Err(err) => {
                self.breaker.record_skill_failure(&call.skill);
                Err(err.into())
            }
        }
    }

    async fn await_orchestrator(
        &self,
        mission: &Mission,
        channels: &mut MissionChannels,
        args: &Value,
    ) -> Result<String, AgentError> {
        let question = args
            .get("question")
            .and_then(Value::as_str)
            .unwrap_or("(no question)")
            .to_string();
        tracing::info!(agent = %mission.spec.agent_id, question = %question, "awaiting orchestrator");
        channels
            .phase
            .send_replace(AgentPhase::AwaitingExternal(question));

        let limit = self.settings.await_timeout;
        let answer = tokio::select! {
            _ = channels.cancel.cancelled() => Err(AgentError::Cancelled),
            received = tokio::time::timeout(limit, channels.inbox.recv()) => match received {
                Ok(Some(AgentInput::Resume(answer))) => Ok(answer),
                Ok(None) => Err(AgentError::Cancelled),
                Err(_) => Err(AgentError::AwaitTimeout(limit.as_secs())),
            },
        };

        channels.phase.send_replace(AgentPhase::Running);
        answer
    }
}

fn system_prompt(mission: &Mission) -> String {
    let spec = &mission.spec;
    let mut prompt = format!(
        "[agent:{}] You are a focused assistant agent. Complete the mission using only the listed skills, \
         then reply with a concise final answer.\nSkills: {}\nIf you need information only the orchestrator \
         has, call {ASK_ORCHESTRATOR} with a \"question\".",
        spec.agent_id,
        if spec.skills.is_empty() {
            "(none)".to_string()
        } else {
            spec.skills.join(", ")
        },
    );

    if !mission.deps.is_empty() {
        prompt.push_str("\nResults from earlier agents:");
        let mut ids: Vec<&String> = mission.deps.keys().collect();
        ids.sort();
        for id in ids {
            let r = &mission.deps[id];
            prompt.push_str(&format!("\n- {id} ({:?}): {}", r.status, r.result));
        }
    }
    prompt
}

fn describe_calls(completion: &Completion) -> String {
    let calls: Vec<String> = completion
        .tool_calls
        .iter()
        .map(|c| format!("{}({})", c.skill, c.args))
        .collect();
    if completion.content.is_empty() {
        format!("calling {}", calls.join(", "))
    } else {
        format!("{}\ncalling {}", completion.content, calls.join(", "))
    }
}

fn ask_orchestrator_schema() -> Value {
    serde_json::json!({
        "name": ASK_ORCHESTRATOR,
        "description": "Ask the orchestrator a question and wait for the answer",
        "parameters": {
            "type": "object",
            "properties": {"question": {"type": "string"}},
            "required": ["question"]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerLimits;
    use crate::llm::ScriptedLlmClient;
    use crate::scheduler::AgentStatus;
    use crate::skills::Skill;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct Memory;

    #[async_trait]
    impl Skill for Memory {
        fn name(&self) -> &str {
            "memory_search"
        }

        fn description(&self) -> &str {
            "search memory"
        }

        async fn execute(&self, _args: Value, _ctx: &SkillContext) -> Result<String, String> {
            Ok("no existing entry".to_string())
        }
    }

    struct Broken;

    #[async_trait]
    impl Skill for Broken {
        fn name(&self) -> &str {
            "gmail_send"
        }

        fn description(&self) -> &str {
            "always fails"
        }

        async fn execute(&self, _args: Value, _ctx: &SkillContext) -> Result<String, String> {
            Err("smtp down".to_string())
        }
    }

    fn runner(llm: ScriptedLlmClient, limits: BreakerLimits) -> AgentRunner {
        let mut skills = SkillRegistry::new();
        skills.register(Memory);
        skills.register(Broken);
        AgentRunner::new(
            Arc::new(llm),
            Arc::new(skills),
            Arc::new(SkillExecutor::default()),
            CircuitBreaker::isolated(limits),
            AgentSettings {
                max_iterations: 6,
                await_timeout: Duration::from_millis(200),
            },
        )
    }

    fn mission(id: &str, skills: &[&str]) -> Mission {
        Mission {
            spec: DispatchSpec::new(id, "remember that I like tea").with_skills(skills.iter().copied()),
            deps: Arc::new(HashMap::new()),
            ctx: SkillContext::default(),
            history: Vec::new(),
        }
    }

    fn ledger(limits: &BreakerLimits) -> Mutex<TurnLedger> {
        Mutex::new(TurnLedger::new(
            TurnBudget::new(limits.turn_max_agents, limits.turn_max_skill_calls),
            Arc::new(Mutex::new(ConversationBudget::new(
                limits.conversation_max_calls,
                limits.conversation_window_ms,
            ))),
        ))
    }

    fn call(skill: &str) -> Completion {
        Completion::calls(vec![ToolCall::new(skill, serde_json::json!({}))])
    }

    #[tokio::test]
    async fn test_write_before_search_self_corrects() {
        let llm = ScriptedLlmClient::new().on(
            "agent:mem",
            vec![
                call("memory_store"),
                call("memory_search"),
                call("memory_store"),
                Completion::text("stored").with_usage(10, 5),
            ],
        );
        let limits = BreakerLimits::default();
        let runner = runner(llm, limits);
        let (_handle, channels) = mission_channels(CancellationToken::new());
        let ledger = ledger(&limits);

        let report = runner
            .run(mission("mem", &["memory_search", "memory_store"]), channels, &ledger)
            .await;

        assert_eq!(report.result.status, AgentStatus::Completed);
        assert_eq!(report.result.result, "stored");
        // 被拒绝的写入不计预算
        assert_eq!(report.result.tool_calls_used, 2);
        assert_eq!(report.usage.total(), 15);
        assert!(report
            .transcript
            .iter()
            .any(|m| m.content.contains("must search memory before writing")));
        assert_eq!(ledger.lock().await.turn.skill_calls, 2);
    }

    #[tokio::test]
    async fn test_turns_share_one_conversation_window() {
        let llm = ScriptedLlmClient::new()
            .on("agent:first", vec![call("memory_search"), call("memory_search"), Completion::text("a")])
            .on("agent:second", vec![call("memory_search"), call("memory_search"), Completion::text("b")]);
        let limits = BreakerLimits {
            conversation_max_calls: 3,
            ..BreakerLimits::default()
        };
        let runner = runner(llm, limits);
        let conversation = Arc::new(Mutex::new(ConversationBudget::new(3, 60_000)));
        let turn = || TurnBudget::new(limits.turn_max_agents, limits.turn_max_skill_calls);
        let first_turn = Mutex::new(TurnLedger::new(turn(), Arc::clone(&conversation)));
        let second_turn = Mutex::new(TurnLedger::new(turn(), Arc::clone(&conversation)));

        let (_h1, first_channels) = mission_channels(CancellationToken::new());
        let (h2, second_channels) = mission_channels(CancellationToken::new());
        let (first, second) = tokio::join!(
            runner.run(mission("first", &["memory_search"]), first_channels, &first_turn),
            runner.run(mission("second", &["memory_search"]), second_channels, &second_turn),
        );

        assert_eq!(first.result.tool_calls_used + second.result.tool_calls_used, 3);
        assert_eq!(conversation.lock().await.calls_in_window_at(std::time::Instant::now()), 3);
        assert_eq!(h2.tool_calls_used(), second.result.tool_calls_used);
    }

    #[tokio::test]
    async fn test_agent_budget_exhaustion_fails_mission() {
        let llm = ScriptedLlmClient::new().on(
            "agent:greedy",
            vec![call("memory_search"), call("memory_search"), call("memory_search")],
        );
        let limits = BreakerLimits {
            agent_max_skill_calls: 2,
            ..BreakerLimits::default()
        };
        let runner = runner(llm, limits);
        let (_handle, channels) = mission_channels(CancellationToken::new());
        let report = runner
            .run(mission("greedy", &["memory_search"]), channels, &ledger(&limits))
            .await;
        assert_eq!(report.result.status, AgentStatus::Failed);
        assert!(report.result.result.contains("limit exceeded"));
        assert_eq!(report.result.tool_calls_used, 2);
    }

    #[tokio::test]
    async fn test_repeated_failures_blow_fuse_and_model_is_told() {
        let llm = ScriptedLlmClient::new().on(
            "agent:mailer",
            vec![
                call("gmail_send"),
                call("gmail_send"),
                call("gmail_send"),
                call("gmail_send"),
                Completion::text("could not send"),
            ],
        );
        let limits = BreakerLimits {
            agent_max_skill_calls: 10,
            ..BreakerLimits::default()
        };
        let runner = runner(llm, limits);
        let (_handle, channels) = mission_channels(CancellationToken::new());
        let report = runner
            .run(mission("mailer", &["gmail_send"]), channels, &ledger(&limits))
            .await;
        assert_eq!(report.result.status, AgentStatus::Completed);
        // 第四次调用被保险丝拦下，没有计入预算
        assert_eq!(report.result.tool_calls_used, 3);
        assert!(report
            .transcript
            .iter()
            .any(|m| m.content.contains("temporarily disabled")));
        assert_eq!(
            runner.breaker().check_skill("gmail_send"),
            crate::breaker::FuseStatus::CircuitOpen
        );
    }

    #[tokio::test]
    async fn test_out_of_scope_skill_is_not_executed() {
        let llm = ScriptedLlmClient::new().on(
            "agent:scoped",
            vec![call("gmail_send"), Completion::text("ok")],
        );
        let limits = BreakerLimits::default();
        let runner = runner(llm, limits);
        let (_handle, channels) = mission_channels(CancellationToken::new());
        let report = runner
            .run(mission("scoped", &["memory_search"]), channels, &ledger(&limits))
            .await;
        assert_eq!(report.result.status, AgentStatus::Completed);
        assert_eq!(report.result.tool_calls_used, 0);
        assert!(report
            .transcript
            .iter()
            .any(|m| m.content.contains("not available to you")));
    }

    #[tokio::test]
    async fn test_awaiting_external_resumes_with_answer() {
        let llm = ScriptedLlmClient::new().on(
            "agent:asker",
            vec![
                Completion::calls(vec![ToolCall::new(
                    ASK_ORCHESTRATOR,
                    serde_json::json!({"question": "which city?"}),
                )]),
                Completion::text("booked"),
            ],
        );
        let limits = BreakerLimits::default();
        let runner = Arc::new(runner(llm, limits));
        let (handle, channels) = mission_channels(CancellationToken::new());
        let ledger = Arc::new(ledger(&limits));

        let task = {
            let runner = Arc::clone(&runner);
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move { runner.run(mission("asker", &[]), channels, &ledger).await })
        };

        let mut phase = handle.phase.clone();
        phase
            .wait_for(|p| matches!(p, AgentPhase::AwaitingExternal(_)))
            .await
            .unwrap();
        assert_eq!(handle.phase(), AgentPhase::AwaitingExternal("which city?".into()));
        handle.inbox.send(AgentInput::Resume("Lisbon".into())).await.unwrap();

        let report = task.await.unwrap();
        assert_eq!(report.result.status, AgentStatus::Completed);
        assert!(report.transcript.iter().any(|m| m.content.contains("Lisbon")));
        assert_eq!(handle.phase(), AgentPhase::Idle);
    }

    #[tokio::test]
    async fn test_unanswered_question_times_out() {
        let llm = ScriptedLlmClient::new().on(
            "agent:asker",
            vec![Completion::calls(vec![ToolCall::new(
                ASK_ORCHESTRATOR,
                serde_json::json!({"question": "anyone?"}),
            )])],
        );
        let limits = BreakerLimits::default();
        let runner = runner(llm, limits);
        let (_handle, channels) = mission_channels(CancellationToken::new());
        let report = runner
            .run(mission("asker", &[]), channels, &ledger(&limits))
            .await;
        assert_eq!(report.result.status, AgentStatus::Timeout);
    }

    #[tokio::test]
    async fn test_cancellation_fails_waiting_mission() {
        let llm = ScriptedLlmClient::new().on(
            "agent:asker",
            vec![Completion::calls(vec![ToolCall::new(
                ASK_ORCHESTRATOR,
                serde_json::json!({"question": "?"}),
            )])],
        );
        let limits = BreakerLimits::default();
        let runner = runner(llm, limits);
        let cancel = CancellationToken::new();
        let (_handle, channels) = mission_channels(cancel.clone());
        cancel.cancel();
        let report = runner
            .run(mission("asker", &[]), channels, &ledger(&limits))
            .await;
        assert_eq!(report.result.status, AgentStatus::Failed);
        assert!(report.result.result.contains("cancelled"));
    }

    #[test]
    fn test_prompt_includes_upstream_results() {
        let mut deps = HashMap::new();
        deps.insert(
            "a".to_string(),
            AgentExecutionResult::completed("from_a", 1),
        );
        let m = Mission {
            deps: Arc::new(deps),
            ..mission("b", &["s2"])
        };
        let prompt = system_prompt(&m);
        assert!(prompt.contains("[agent:b]"));
        assert!(prompt.contains("from_a"));
        assert!(prompt.contains("s2"));
    }
}
