//! 编排引擎
//!
//! 持有会话状态（会话级预算、对话记忆、轮次计数、取消监管），每个用户轮次：
//! 1. 用第三级预算整体准入本轮派发数，超限则整轮拒绝，不执行任何 Agent
//! 2. 交给 AgentScheduler 逐波执行；本轮预算放在本轮账本里，会话预算由同一会话的所有轮次共用一份，
//!    由各 Agent 的 check_all 依次推进，并发的轮次也不会越过第四级上限
//! 3. 记忆 Agent（agent_id = "memory"）每用户持久，携带自己的历史并受先检索后写入约束；其余为一次性子 Agent
//! 4. 汇总结果写回对话记忆，发布 TokenUsage / TurnCompleted 事件供压缩监视器消费

pub mod plan;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::agent::{
    mission_channels, AgentInput, AgentKey, AgentPhase, AgentRegistry, AgentRunner,
    AgentSettings, Mission, TurnLedger,
};
use crate::breaker::{BreakerError, BreakerLimits, CircuitBreaker, ConversationBudget};
use crate::core::SessionSupervisor;
use crate::llm::{LlmClient, LlmError};
use crate::memory::{CompactionMonitor, ConversationMemory, Message};
use crate::scheduler::{
    index_dispatches, plan_waves, AgentExecutionResult, AgentId, AgentScheduler, AgentStatus,
    DepResults, DispatchSpec, SchedulerError,
};
use crate::skills::{
    SkillContext, SkillExecutor, SkillRegistry, DEFAULT_READ_SKILLS, DEFAULT_WRITE_SKILLS,
};

/// 持久记忆 Agent 的派发 id
pub const MEMORY_AGENT_ID: &str = "memory";

const EVENT_CAPACITY: usize = 256;

/// 引擎发布的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    TurnStarted {
        conversation_id: String,
        turn: u64,
        agents: usize,
    },
    /// 每个 Agent 任务结束时发布一次
    TokenUsage {
        conversation_id: String,
        agent_id: AgentId,
        prompt_tokens: u64,
        completion_tokens: u64,
    },
    TurnCompleted {
        conversation_id: String,
        turn: u64,
        statuses: HashMap<AgentId, AgentStatus>,
    },
    Compacted {
        conversation_id: String,
        replaced_messages: usize,
    },
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Breaker(#[from] BreakerError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("Invalid dispatch plan: {0}")]
    InvalidPlan(String),

    #[error("No agent '{agent_id}' registered for user '{user_id}'")]
    AgentNotFound { user_id: String, agent_id: AgentId },

    #[error("Agent '{0}' is not waiting for an answer")]
    NotAwaiting(AgentId),

    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),
}

/// 引擎参数，通常由 AppConfig::engine_settings 生成
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub breaker: BreakerLimits,
    /// true 时第一级保险丝使用进程级注册表
    pub process_wide_fuses: bool,
    pub agent: AgentSettings,
    pub agent_timeout: Option<Duration>,
    pub read_skills: Vec<String>,
    pub write_skills: Vec<String>,
    pub skill_timeout_secs: u64,
    /// 对话记忆与记忆 Agent 历史保留的轮数
    pub max_context_turns: usize,
    pub keep_recent_messages: usize,
    pub compaction_token_threshold: u64,
    /// 每一波的等待上限，到点未结束的 Agent 记为 timeout
    pub wave_timeout: Option<Duration>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            breaker: BreakerLimits::default(),
            process_wide_fuses: true,
            agent: AgentSettings::default(),
            agent_timeout: Some(Duration::from_secs(120)),
            read_skills: DEFAULT_READ_SKILLS.iter().map(|s| s.to_string()).collect(),
            write_skills: DEFAULT_WRITE_SKILLS.iter().map(|s| s.to_string()).collect(),
            skill_timeout_secs: 30,
            max_context_turns: 20,
            keep_recent_messages: 6,
            compaction_token_threshold: 8000,
            wave_timeout: None,
        }
    }
}

/// 一个轮次的结果
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub conversation_id: String,
    pub turn: u64,
    pub results: HashMap<AgentId, AgentExecutionResult>,
    /// 写入对话记忆的汇总
    pub summary: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

struct ConversationState {
    /// 第四级状态：本会话的所有轮次共用
    budget: Arc<tokio::sync::Mutex<ConversationBudget>>,
    memory: ConversationMemory,
    turns: u64,
    supervisor: SessionSupervisor,
}

pub struct Engine {
    llm: Arc<dyn LlmClient>,
    skills: Arc<SkillRegistry>,
    memory_runner: Arc<AgentRunner>,
    sub_runner: Arc<AgentRunner>,
    breaker: CircuitBreaker,
    registry: Arc<AgentRegistry>,
    conversations: Mutex<HashMap<String, ConversationState>>,
    /// 每个用户记忆 Agent 的历史
    memory_histories: Arc<Mutex<HashMap<String, Vec<Message>>>>,
    events: broadcast::Sender<EngineEvent>,
    settings: EngineSettings,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn agent_key(user_id: &str, agent_id: &str) -> AgentKey {
    if agent_id == MEMORY_AGENT_ID {
        AgentKey::memory(user_id)
    } else {
        AgentKey::sub(user_id, agent_id)
    }
}

/// 计划中第一个重复出现的 agent_id
fn duplicate_agent_id(dispatches: &[DispatchSpec]) -> Option<&AgentId> {
    let mut seen = HashSet::new();
    dispatches
        .iter()
        .map(|d| &d.agent_id)
        .find(|id| !seen.insert(*id))
}

impl Engine {
    pub fn new(llm: Arc<dyn LlmClient>, skills: SkillRegistry, settings: EngineSettings) -> Self {
        let breaker = if settings.process_wide_fuses {
            CircuitBreaker::global(settings.breaker)
        } else {
            CircuitBreaker::isolated(settings.breaker)
        };
        let skills = Arc::new(skills);

        let memory_executor = Arc::new(SkillExecutor::new(
            settings.read_skills.clone(),
            settings.write_skills.clone(),
            settings.skill_timeout_secs,
        ));
        // 子 Agent 的技能全部透传
        let sub_executor = Arc::new(SkillExecutor::new(
            Vec::new(),
            Vec::new(),
            settings.skill_timeout_secs,
        ));

        let memory_runner = Arc::new(AgentRunner::new(
            Arc::clone(&llm),
            Arc::clone(&skills),
            memory_executor,
            breaker.clone(),
            settings.agent,
        ));
        let sub_runner = Arc::new(AgentRunner::new(
            Arc::clone(&llm),
            Arc::clone(&skills),
            sub_executor,
            breaker.clone(),
            settings.agent,
        ));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            llm,
            skills,
            memory_runner,
            sub_runner,
            breaker,
            registry: Arc::new(AgentRegistry::new()),
            conversations: Mutex::new(HashMap::new()),
            memory_histories: Arc::new(Mutex::new(HashMap::new())),
            events,
            settings,
        }
    }

    pub fn new_conversation_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: EngineEvent) {
        // 没有订阅者时丢弃
        let _ = self.events.send(event);
    }

    fn conversations(&self) -> MutexGuard<'_, HashMap<String, ConversationState>> {
        lock(&self.conversations)
    }

    /// 让 LLM 为一条用户消息生成派发计划
    pub async fn plan_turn(
        &self,
        conversation_id: &str,
        user_message: &str,
    ) -> Result<Vec<DispatchSpec>, EngineError> {
        let mut messages = vec![Message::system(plan::planner_prompt(
            &self.skills.skill_names(),
        ))];
        if let Some(state) = self.conversations().get(conversation_id) {
            messages.extend(state.memory.messages().iter().cloned());
        }
        messages.push(Message::user(user_message));

        let completion = self.llm.chat(&messages, &[]).await?;
        plan::parse_plan(&completion.content).map_err(EngineError::InvalidPlan)
    }

    /// 规划并执行一个轮次
    pub async fn run_turn(
        &self,
        conversation_id: &str,
        user_id: &str,
        user_message: &str,
    ) -> Result<TurnOutcome, EngineError> {
        let dispatches = self.plan_turn(conversation_id, user_message).await?;
        self.handle_turn(conversation_id, user_id, user_message, dispatches)
            .await
    }

    /// 执行给定派发；准入失败或依赖图无效时不执行任何 Agent，也不改动会话
    pub async fn handle_turn(
        &self,
        conversation_id: &str,
        user_id: &str,
        user_message: &str,
        dispatches: Vec<DispatchSpec>,
    ) -> Result<TurnOutcome, EngineError> {
        let started_at = Utc::now();
        if let Some(id) = duplicate_agent_id(&dispatches) {
            tracing::warn!(conversation = %conversation_id, agent = %id, "turn rejected: duplicate agent_id");
            return Err(EngineError::InvalidPlan(format!("duplicate agent_id '{id}'")));
        }
        let dispatches = index_dispatches(dispatches);

        let turn_budget = self
            .breaker
            .check_turn_agents(&self.breaker.new_turn_state(), dispatches.len())
            .map_err(|err| {
                tracing::warn!(conversation = %conversation_id, agents = dispatches.len(), error = %err, "turn rejected");
                err
            })?;
        plan_waves(&dispatches)?;

        let (turn, conversation_budget, cancel) = {
            let mut conversations = self.conversations();
            let state = conversations
                .entry(conversation_id.to_string())
                .or_insert_with(|| ConversationState {
                    budget: Arc::new(tokio::sync::Mutex::new(
                        self.breaker.new_conversation_state(),
                    )),
                    memory: ConversationMemory::new(self.settings.max_context_turns),
                    turns: 0,
                    supervisor: SessionSupervisor::new(),
                });
            state.turns += 1;
            state.memory.push(Message::user(user_message));
            (
                state.turns,
                Arc::clone(&state.budget),
                state.supervisor.child_token(),
            )
        };

        tracing::info!(conversation = %conversation_id, turn, agents = dispatches.len(), "turn started");
        self.publish(EngineEvent::TurnStarted {
            conversation_id: conversation_id.to_string(),
            turn,
            agents: dispatches.len(),
        });

        let agent_ids: Vec<AgentId> = dispatches.keys().cloned().collect();
        let ledger = Arc::new(tokio::sync::Mutex::new(TurnLedger::new(
            turn_budget,
            conversation_budget,
        )));

        let execute_fn = {
            let ledger = Arc::clone(&ledger);
            let registry = Arc::clone(&self.registry);
            let histories = Arc::clone(&self.memory_histories);
            let memory_runner = Arc::clone(&self.memory_runner);
            let sub_runner = Arc::clone(&self.sub_runner);
            let events = self.events.clone();
            let conversation_id = conversation_id.to_string();
            let user_id = user_id.to_string();
            let history_limit = self.settings.max_context_turns * 2;

            move |spec: DispatchSpec, deps: DepResults| {
                let ledger = Arc::clone(&ledger);
                let registry = Arc::clone(&registry);
                let histories = Arc::clone(&histories);
                let memory_runner = Arc::clone(&memory_runner);
                let sub_runner = Arc::clone(&sub_runner);
                let events = events.clone();
                let conversation_id = conversation_id.clone();
                let user_id = user_id.clone();
                let cancel = cancel.child_token();

                async move {
                    let agent_id = spec.agent_id.clone();
                    let is_memory = agent_id == MEMORY_AGENT_ID;
                    let key = agent_key(&user_id, &agent_id);

                    let (handle, channels) = mission_channels(cancel);
                    registry.register(key, handle);

                    let history = if is_memory {
                        lock(&histories).get(&user_id).cloned().unwrap_or_default()
                    } else {
                        Vec::new()
                    };
                    let mission = Mission {
                        ctx: SkillContext {
                            user_id: user_id.clone(),
                            conversation_id: conversation_id.clone(),
                            agent_id: agent_id.clone(),
                        },
                        spec,
                        deps,
                        history,
                    };

                    let runner = if is_memory { memory_runner } else { sub_runner };
                    let report = runner.run(mission, channels, &ledger).await;

                    if is_memory {
                        let mut transcript = report.transcript;
                        let excess = transcript.len().saturating_sub(history_limit);
                        transcript.drain(..excess);
                        lock(&histories).insert(user_id, transcript);
                    }

                    let _ = events.send(EngineEvent::TokenUsage {
                        conversation_id,
                        agent_id,
                        prompt_tokens: report.usage.prompt_tokens,
                        completion_tokens: report.usage.completion_tokens,
                    });
                    report.result
                }
            }
        };

        let mut scheduler = AgentScheduler::current();
        if let Some(limit) = self.settings.agent_timeout {
            scheduler = scheduler.with_agent_timeout(limit);
        }
        if let Some(limit) = self.settings.wave_timeout {
            scheduler = scheduler.with_wave_timeout(limit);
        }
        let mut executed = scheduler.execute(dispatches, execute_fn).await;

        // 被调度层中止的任务来不及汇报，已用调用数从注册表里的句柄读取
        if let Ok(results) = executed.as_mut() {
            for (agent_id, result) in results
                .iter_mut()
                .filter(|(_, r)| r.status == AgentStatus::Timeout)
            {
                if let Some(handle) = self.registry.lookup(&agent_key(user_id, agent_id)) {
                    result.tool_calls_used = result.tool_calls_used.max(handle.tool_calls_used());
                }
            }
        }

        // 子 Agent 只在任务期间注册；记忆 Agent 保留
        for agent_id in agent_ids.iter().filter(|id| id.as_str() != MEMORY_AGENT_ID) {
            self.registry.remove(&AgentKey::sub(user_id, agent_id));
        }
        let results = executed?;

        let summary = summarize(turn, &results);
        if let Some(state) = self.conversations().get_mut(conversation_id) {
            state.memory.push(Message::assistant(summary.clone()));
        }

        let statuses: HashMap<AgentId, AgentStatus> = results
            .iter()
            .map(|(id, r)| (id.clone(), r.status))
            .collect();
        tracing::info!(conversation = %conversation_id, turn, statuses = ?statuses, "turn completed");
        self.publish(EngineEvent::TurnCompleted {
            conversation_id: conversation_id.to_string(),
            turn,
            statuses,
        });

        Ok(TurnOutcome {
            conversation_id: conversation_id.to_string(),
            turn,
            results,
            summary,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// 把编排器的回答送给正在等待的 Agent
    pub async fn resume(
        &self,
        user_id: &str,
        agent_id: &str,
        answer: impl Into<String>,
    ) -> Result<(), EngineError> {
        let key = agent_key(user_id, agent_id);
        let not_found = || EngineError::AgentNotFound {
            user_id: user_id.to_string(),
            agent_id: agent_id.to_string(),
        };

        let handle = self.registry.lookup(&key).ok_or_else(not_found)?;
        if !matches!(handle.phase(), AgentPhase::AwaitingExternal(_)) {
            return Err(EngineError::NotAwaiting(agent_id.to_string()));
        }
        handle
            .inbox
            .send(AgentInput::Resume(answer.into()))
            .await
            .map_err(|_| not_found())
    }

    /// 某用户正在等待回答的 Agent 及其问题
    pub fn awaiting(&self, user_id: &str) -> Vec<(AgentKey, String)> {
        self.registry.awaiting(user_id)
    }

    /// 取消会话内所有进行中的任务；之后的轮次使用新的取消令牌
    pub fn cancel(&self, conversation_id: &str) -> bool {
        match self.conversations().get_mut(conversation_id) {
            Some(state) => {
                state.supervisor.cancel();
                state.supervisor = SessionSupervisor::new();
                tracing::info!(conversation = %conversation_id, "conversation cancelled");
                true
            }
            None => false,
        }
    }

    pub fn conversation_messages(&self, conversation_id: &str) -> Option<Vec<Message>> {
        self.conversations()
            .get(conversation_id)
            .map(|s| s.memory.messages().to_vec())
    }

    /// 会话窗口内已计入的技能调用数
    pub async fn conversation_calls(&self, conversation_id: &str) -> Option<usize> {
        let budget = self
            .conversations()
            .get(conversation_id)
            .map(|s| Arc::clone(&s.budget))?;
        let calls = budget.lock().await.calls_in_window_at(Instant::now());
        Some(calls)
    }

    pub fn memory_history(&self, user_id: &str) -> Vec<Message> {
        lock(&self.memory_histories)
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// 对会话做一次增量压缩；没有可压缩内容或压缩期间边界变动时返回 false
    pub async fn compact_conversation(&self, conversation_id: &str) -> Result<bool, EngineError> {
        let keep = self.settings.keep_recent_messages;
        let (window, excerpt) = {
            let conversations = self.conversations();
            let state = conversations
                .get(conversation_id)
                .ok_or_else(|| EngineError::UnknownConversation(conversation_id.to_string()))?;
            match state.memory.compaction_window(keep) {
                Some(window) => {
                    let excerpt = state.memory.messages()[window.range.clone()].to_vec();
                    (window, excerpt)
                }
                None => return Ok(false),
            }
        };

        let completion = self
            .llm
            .chat(&plan::compaction_messages(&excerpt), &[])
            .await?;

        let replaced = window.range.len();
        let applied = self
            .conversations()
            .get_mut(conversation_id)
            .is_some_and(|state| state.memory.apply_compaction(window, completion.content));
        if !applied {
            tracing::info!(conversation = %conversation_id, "history moved during compaction, summary discarded");
            return Ok(false);
        }

        tracing::info!(conversation = %conversation_id, replaced, "conversation compacted");
        self.publish(EngineEvent::Compacted {
            conversation_id: conversation_id.to_string(),
            replaced_messages: replaced,
        });
        Ok(true)
    }

    /// 后台压缩任务：消费事件，达到阈值时压缩对应会话；引擎释放后退出
    pub fn spawn_compactor(engine: &Arc<Engine>) -> JoinHandle<()> {
        let weak = Arc::downgrade(engine);
        let mut rx = engine.subscribe();
        let mut monitor = CompactionMonitor::new(engine.settings.compaction_token_threshold);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(request) = monitor.observe(&event) else {
                            continue;
                        };
                        let Some(engine) = weak.upgrade() else {
                            break;
                        };
                        if let Err(e) = engine.compact_conversation(&request.conversation_id).await {
                            tracing::warn!(conversation = %request.conversation_id, error = %e, "compaction failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "compactor lagged behind engine events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

fn summarize(turn: u64, results: &HashMap<AgentId, AgentExecutionResult>) -> String {
    let mut ids: Vec<&AgentId> = results.keys().collect();
    ids.sort();
    let mut summary = format!("Turn {turn} results:");
    for id in ids {
        let r = &results[id];
        summary.push_str(&format!("\n- {id} [{:?}]: {}", r.status, r.result));
    }
    summary
}
