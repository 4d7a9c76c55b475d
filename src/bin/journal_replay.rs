//! Journal replay tool.
//!
//! Feeds each recorded cycle's decisions JSON back through the executor via
//! a stub LLM and verifies the normalised decision payload reproduces
//! bytewise. Exits 1 when any cycle fails replay validation.

use async_trait::async_trait;
use clap::Parser;
use fleetbot::backtest::run_journal_replay;
use fleetbot::errors::FleetError;
use fleetbot::executor::{normalize_decision, normalized_payload, Decision, Executor, ExecutorConfig};
use fleetbot::journal::replay::{build_executor_context, parse_decisions_json};
use fleetbot::journal::Store;
use fleetbot::llm::{ChatRequest, ChatResponse, LlmClient, Usage};
use fleetbot::logger::{self, LogTag};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Parser)]
#[command(name = "journal_replay", version)]
struct Args {
    /// Path to the journal directory.
    #[arg(long, default_value = "journal")]
    journal_dir: String,

    /// Number of recent cycles to replay.
    #[arg(long, default_value_t = 5)]
    limit: usize,

    /// Executor config file (JSON). Defaults apply when the file is absent.
    #[arg(long, default_value = "etc/executor.json")]
    executor_config: String,

    /// Executor prompt template.
    #[arg(long, default_value = "etc/prompts/executor/default_prompt.tmpl")]
    template: String,

    /// Model alias for the replay executor.
    #[arg(long, default_value = "journal-replay")]
    model: String,

    /// Optional symbol for backtest replay against the journal market data.
    #[arg(long)]
    replay_symbol: Option<String>,

    /// Initial equity for the journal backtest replay.
    #[arg(long, default_value_t = 100_000.0)]
    initial_equity: f64,
}

/// Feeds recorded decisions back into the executor without hitting an LLM.
struct ReplayLlm {
    payload: Mutex<String>,
}

impl ReplayLlm {
    fn new() -> Self {
        Self { payload: Mutex::new(String::new()) }
    }

    fn set_payload(&self, payload: &str) {
        *self.payload.lock().unwrap() = payload.to_string();
    }
}

#[async_trait]
impl LlmClient for ReplayLlm {
    async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, FleetError> {
        Err(FleetError::Llm("replay client does not support chat".into()))
    }

    async fn chat_structured(&self, request: &ChatRequest) -> Result<ChatResponse, FleetError> {
        Ok(ChatResponse {
            model: request.model.clone(),
            content: self.payload.lock().unwrap().clone(),
            reasoning: None,
            usage: Usage::default(),
        })
    }
}

#[tokio::main]
async fn main() {
    logger::init();
    let args = Args::parse();

    let store = Store::new(&args.journal_dir);
    let records = match store.latest(args.limit) {
        Ok(records) => records,
        Err(err) => {
            logger::error(LogTag::Journal, &format!("load journal: {}", err));
            std::process::exit(1);
        }
    };
    if records.is_empty() {
        logger::info(LogTag::Journal, "no journal cycles found");
        return;
    }

    let exec_cfg = load_executor_config(&args.executor_config);
    let stub = Arc::new(ReplayLlm::new());
    let executor = match Executor::new(exec_cfg.clone(), stub.clone(), &args.template, &args.model)
    {
        Ok(executor) => executor,
        Err(err) => {
            logger::error(LogTag::Executor, &format!("init executor: {}", err));
            std::process::exit(1);
        }
    };

    let mut passed = 0;
    let mut failed = 0;
    for (idx, record) in records.iter().enumerate() {
        let label = format!("{} #{}", record.trader_id, idx + 1);
        stub.set_payload(&record.decisions_json);
        let ctx = build_executor_context(&exec_cfg, record);
        let result = match executor.get_full_decision(&ctx).await {
            Ok(result) => result,
            Err(err) => {
                failed += 1;
                logger::error(LogTag::Executor, &format!("[FAIL] {} executor validation: {}", label, err));
                continue;
            }
        };
        if let Err(err) = compare_decisions(&record.decisions_json, &result.decisions, &ctx) {
            failed += 1;
            logger::error(LogTag::Executor, &format!("[FAIL] {} decision mismatch: {}", label, err));
            continue;
        }
        passed += 1;
        logger::info(
            LogTag::Journal,
            &format!(
                "[OK]   {} decisions={} success={}",
                label,
                result.decisions.len(),
                record.success
            ),
        );
    }

    logger::info(
        LogTag::Journal,
        &format!("journal replay complete: {} passed, {} failed", passed, failed),
    );
    if failed > 0 {
        std::process::exit(1);
    }

    if let Some(symbol) = args.replay_symbol.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        match run_journal_replay(&records, symbol, args.initial_equity).await {
            Ok(result) => logger::info(
                LogTag::Journal,
                &format!(
                    "backtest replay {}: trades={} win_rate={:.2}% total_pnl={:.2}",
                    symbol.to_uppercase(),
                    result.trades,
                    result.win_rate * 100.0,
                    result.total_pnl
                ),
            ),
            Err(err) => {
                logger::error(LogTag::Journal, &format!("backtest replay: {}", err));
                std::process::exit(1);
            }
        }
    }
}

fn load_executor_config(path: &str) -> ExecutorConfig {
    if !Path::new(path).exists() {
        return ExecutorConfig::default();
    }
    match std::fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|raw| serde_json::from_str(&raw).map_err(|e| e.to_string()))
    {
        Ok(cfg) => cfg,
        Err(err) => {
            logger::warn(
                LogTag::Executor,
                &format!("executor config {} unreadable ({}), using defaults", path, err),
            );
            ExecutorConfig::default()
        }
    }
}

fn compare_decisions(
    recorded_json: &str,
    replayed: &[Decision],
    ctx: &fleetbot::executor::DecisionContext,
) -> Result<(), String> {
    let recorded_raw =
        parse_decisions_json(recorded_json).map_err(|e| format!("parse recorded decisions: {}", e))?;
    if recorded_raw.is_empty() && replayed.is_empty() {
        return Ok(());
    }
    if recorded_raw.len() != replayed.len() {
        return Err(format!(
            "decision count mismatch recorded={} replayed={}",
            recorded_raw.len(),
            replayed.len()
        ));
    }
    let mut recorded = Vec::with_capacity(recorded_raw.len());
    for raw in &recorded_raw {
        recorded.push(normalize_decision(raw, ctx).map_err(|e| e.to_string())?);
    }
    let recorded_payload = normalized_payload(&recorded);
    let replayed_payload = normalized_payload(replayed);
    if recorded_payload != replayed_payload {
        return Err("decision payload mismatch".into());
    }
    Ok(())
}
