//! Hive - 本地运行入口
//!
//! 用法：`hive [plan.json] [--config path]`
//! plan.json 为 `{"dispatches": [...]}`；未给出时运行内置的示例计划。使用 Mock LLM，输出各 Agent 的结果 JSON。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use hive::config::{load_config, AppConfig};
use hive::engine::plan::parse_plan;
use hive::llm::MockLlmClient;
use hive::scheduler::DispatchSpec;
use hive::skills::SkillRegistry;
use hive::{observability, Engine};

fn demo_plan() -> Vec<DispatchSpec> {
    vec![
        DispatchSpec::new("memory", "Recall what the user said about travel")
            .with_skills(["memory_search", "memory_store"]),
        DispatchSpec::new("flights", "Find flights to Lisbon").with_skills(["flight_search"]),
        DispatchSpec::new("itinerary", "Draft an itinerary")
            .depends_on(["memory", "flights"]),
    ]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let mut plan_path: Option<PathBuf> = None;
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            config_path = args.next().map(PathBuf::from);
        } else {
            plan_path = Some(PathBuf::from(arg));
        }
    }

    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let dispatches = match plan_path {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read plan {}", path.display()))?;
            parse_plan(&raw).map_err(anyhow::Error::msg)?
        }
        None => demo_plan(),
    };

    let engine = Arc::new(Engine::new(
        Arc::new(MockLlmClient),
        SkillRegistry::new(),
        cfg.engine_settings(),
    ));
    let compactor = Engine::spawn_compactor(&engine);

    let conversation_id = Engine::new_conversation_id();
    let outcome = engine
        .handle_turn(&conversation_id, "local", "run plan", dispatches)
        .await
        .context("Turn failed")?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "conversation_id": outcome.conversation_id,
            "turn": outcome.turn,
            "started_at": outcome.started_at.to_rfc3339(),
            "finished_at": outcome.finished_at.to_rfc3339(),
            "results": outcome.results,
        }))?
    );

    drop(engine);
    compactor.abort();
    Ok(())
}
