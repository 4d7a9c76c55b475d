//! End-to-end decision cycle scenarios against the sim exchange with a
//! scripted LLM.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use fleetbot::cache::{CacheStore, TtlSet};
use fleetbot::clock::{Clock, ManualClock};
use fleetbot::errors::FleetError;
use fleetbot::exchange::SimProvider;
use fleetbot::executor::{ExecutorConfig, OutputValidation};
use fleetbot::journal::Store;
use fleetbot::llm::{BudgetConfig, BudgetGuard, ChatRequest, ChatResponse, LlmClient, Usage};
use fleetbot::manager::{
    Manager, ManagerConfig, ManagerDeps, PersistenceService, RiskParameters, TraderConfig,
};
use fleetbot::market::StaticMarketProvider;
use fleetbot::persistence::{Database, Service};
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Returns canned structured responses in order; errors when exhausted.
struct ScriptedLlm {
    responses: Mutex<VecDeque<(String, u32)>>,
}

impl ScriptedLlm {
    fn new() -> Self {
        Self { responses: Mutex::new(VecDeque::new()) }
    }

    fn push(&self, payload: &str, total_tokens: u32) {
        self.responses
            .lock()
            .unwrap()
            .push_back((payload.to_string(), total_tokens));
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, FleetError> {
        Err(FleetError::Llm("scripted client only supports structured output".into()))
    }

    async fn chat_structured(&self, request: &ChatRequest) -> Result<ChatResponse, FleetError> {
        let (payload, total_tokens) = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| FleetError::Llm("script exhausted".into()))?;
        Ok(ChatResponse {
            model: request.model.clone(),
            content: payload,
            reasoning: Some("scripted".into()),
            usage: Usage { prompt_tokens: 0, completion_tokens: total_tokens, total_tokens },
        })
    }
}

struct Harness {
    manager: Manager,
    llm: Arc<ScriptedLlm>,
    exchange: Arc<SimProvider>,
    service: Arc<Service>,
    journal_dir: tempfile::TempDir,
    clock: ManualClock,
    _template: tempfile::NamedTempFile,
}

fn trader_config(id: &str, template: &str, allocation_pct: f64) -> TraderConfig {
    TraderConfig {
        id: id.into(),
        name: id.into(),
        exchange_provider: "sim".into(),
        market_provider: "static".into(),
        allocation_pct,
        decision_interval_secs: 60,
        prompt_template: template.into(),
        auto_start: false,
        version: 1,
        risk_params: RiskParameters {
            max_positions: 4,
            max_position_size_usd: 500.0,
            max_margin_usage_pct: 80.0,
            major_coin_leverage: 20,
            altcoin_leverage: 10,
            min_risk_reward_ratio: 3.0,
            min_confidence: 75,
            stop_loss_enabled: true,
            take_profit_enabled: true,
            ..Default::default()
        },
    }
}

async fn harness(
    trader_ids: &[&str],
    executor_cfg: ExecutorConfig,
    budget_cfg: Option<BudgetConfig>,
) -> Harness {
    let mut template = tempfile::NamedTempFile::new().unwrap();
    template
        .write_all(b"{{/* Version: v1.0.0 */}}\nDecide.\n{{context}}\n")
        .unwrap();
    let template_path = template.path().to_string_lossy().to_string();

    let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 11, 8, 12, 0, 0).unwrap());
    let budget = budget_cfg.map(|cfg| {
        Arc::new(BudgetGuard::with_clock(&cfg, Arc::new(clock.clone())).expect("budget enabled"))
    });
    let llm = Arc::new(ScriptedLlm::new());
    let exchange = Arc::new(SimProvider::new(1000.0));
    let market = Arc::new(StaticMarketProvider::new());
    market.set_price("BTC", 100.0);

    let db = Arc::new(Database::in_memory().unwrap());
    let cache = Arc::new(CacheStore::memory());
    let service = Arc::new(
        Service::new(db, cache, TtlSet::default()).with_clock(Arc::new(clock.clone())),
    );
    let journal_dir = tempfile::tempdir().unwrap();

    let share = 100.0 / trader_ids.len() as f64;
    let manager_cfg = ManagerConfig {
        reserve_equity_pct: 0.0,
        max_concurrent_decisions: 0,
        traders: trader_ids
            .iter()
            .map(|id| trader_config(id, &template_path, share))
            .collect(),
    };

    let deps = ManagerDeps {
        executor_cfg,
        llm: llm.clone(),
        budget,
        recorder: Some(service.clone()),
        exchange: exchange.clone(),
        market,
        journal: Arc::new(Store::new(journal_dir.path())),
        persistence: Some(service.clone() as Arc<dyn PersistenceService>),
        clock: Arc::new(clock.clone()),
    };

    let manager = Manager::new(manager_cfg, deps).unwrap();
    manager.start().await.unwrap();
    Harness { manager, llm, exchange, service, journal_dir, clock, _template: template }
}

const OPEN_BTC: &str = r#"{"signal":"buy_to_enter","symbol":"BTC","leverage":5,"position_size_usd":200,"entry_price":100,"stop_loss":95,"take_profit":115,"risk_usd":10,"confidence":90,"invalidation_condition":"below EMA20","reasoning":"clear uptrend"}"#;
const CLOSE_BTC: &str = r#"{"signal":"close","symbol":"BTC","leverage":5,"position_size_usd":200,"entry_price":110,"stop_loss":0,"take_profit":0,"risk_usd":0,"confidence":80,"invalidation_condition":"target reached","reasoning":"take profit"}"#;

#[tokio::test]
async fn open_close_round_trip() {
    let h = harness(&["t1"], ExecutorConfig::default(), None).await;

    // Tick 1: open long BTC for 200 USD at 100.
    h.llm.push(OPEN_BTC, 100);
    let outcome = h.manager.run_cycle_for("t1").await.unwrap();
    assert!(outcome.record.success);
    assert_eq!(outcome.applied, 1);
    assert!(outcome.journal_path.is_some());
    assert_eq!(h.manager.registry().owner("BTC"), Some("t1".to_string()));

    let open_rows = h
        .service
        .database()
        .active_positions_by_traders(&["t1".to_string()])
        .unwrap();
    assert_eq!(open_rows["t1"].len(), 1);
    assert_eq!(open_rows["t1"][0].status, "open");
    assert!((open_rows["t1"][0].quantity - 2.0).abs() < 1e-9);

    let journal_files = Store::new(h.journal_dir.path()).list(0).unwrap();
    assert_eq!(journal_files.len(), 1);

    // Tick 2: close at 110; realised pnl = +1 * (110 - 100) * 2 = 20.
    h.clock.advance(chrono::Duration::seconds(60));
    h.llm.push(CLOSE_BTC, 100);
    let outcome = h.manager.run_cycle_for("t1").await.unwrap();
    assert!(outcome.record.success);
    assert_eq!(outcome.applied, 1);
    assert_eq!(h.manager.registry().owner("BTC"), None);

    let trades = h.service.database().recent_trades("t1", 10).unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].realized_net_pnl, Some(20.0));
    assert_eq!(Store::new(h.journal_dir.path()).list(0).unwrap().len(), 2);
}

#[tokio::test]
async fn ownership_conflict_rejects_second_trader() {
    let h = harness(&["t1", "t2"], ExecutorConfig::default(), None).await;

    h.llm.push(OPEN_BTC, 100);
    let outcome = h.manager.run_cycle_for("t1").await.unwrap();
    assert!(outcome.record.success);
    let fills_after_open = h.exchange.fill_count();

    // t2 tries to open the same symbol: rejected before any order leaves.
    h.llm.push(OPEN_BTC, 100);
    let outcome = h.manager.run_cycle_for("t2").await.unwrap();
    assert!(!outcome.record.success);
    assert_eq!(outcome.applied, 0);
    assert_eq!(outcome.rejected, 1);
    assert!(outcome.record.error_message.contains("already owned"));
    assert_eq!(h.exchange.fill_count(), fills_after_open, "no exchange order submitted");
    assert_eq!(h.manager.registry().owner("BTC"), Some("t1".to_string()));
}

#[tokio::test]
async fn budget_exhaustion_pauses_until_next_day() {
    let budget_cfg = BudgetConfig {
        daily_token_limit: 1000,
        alert_threshold_pct: 80,
        strict_enforcement: true,
        cost_per_million_tokens: HashMap::new(),
    };
    let h = harness(&["t1"], ExecutorConfig::default(), Some(budget_cfg)).await;

    let hold = r#"{"signal":"hold","symbol":"BTC","leverage":1,"position_size_usd":0,"entry_price":0,"stop_loss":0,"take_profit":0,"risk_usd":0,"confidence":80,"invalidation_condition":"","reasoning":"wait"}"#;

    h.llm.push(hold, 600);
    assert!(h.manager.run_cycle_for("t1").await.unwrap().record.success);

    h.llm.push(hold, 300); // 90%, alert only
    assert!(h.manager.run_cycle_for("t1").await.unwrap().record.success);

    h.llm.push(hold, 200); // crosses the ceiling
    let outcome = h.manager.run_cycle_for("t1").await.unwrap();
    assert!(!outcome.record.success);
    assert!(outcome.record.error_message.contains("budget"));

    let trader = h.manager.trader("t1").await.unwrap();
    let runtime = trader.runtime.read().await.clone();
    let paused_until = runtime.paused_until.expect("trader paused");
    assert_eq!(paused_until, Utc.with_ymd_and_hms(2025, 11, 9, 0, 0, 0).unwrap());
    assert!(runtime.is_paused(h.clock.now_utc()));

    // Advancing the clock past UTC midnight resumes the trader and the
    // ledger resets on the next attempt.
    h.clock.advance(chrono::Duration::hours(24));
    assert!(!runtime.is_paused(h.clock.now_utc()));
    h.llm.push(hold, 100);
    let outcome = h.manager.run_cycle_for("t1").await.unwrap();
    assert!(outcome.record.success);
}

#[tokio::test]
async fn strict_schema_violation_fails_cycle() {
    let executor_cfg = ExecutorConfig {
        output_validation: OutputValidation {
            enabled: true,
            schema_path: "schemas/decision_output.json".into(),
            fail_on_invalid: true,
        },
        ..Default::default()
    };
    let h = harness(&["t1"], executor_cfg, None).await;

    let invalid = r#"{"signal":"buy_to_enter","symbol":"BTC","leverage":3,"position_size_usd":150,"entry_price":100,"stop_loss":95,"take_profit":110,"risk_usd":15,"confidence":80,"invalidation_condition":"below EMA","reasoning":"trend","extra_field":"not allowed"}"#;
    h.llm.push(invalid, 100);
    let fills_before = h.exchange.fill_count();
    let outcome = h.manager.run_cycle_for("t1").await.unwrap();
    assert!(!outcome.record.success);
    assert!(outcome
        .record
        .error_message
        .to_lowercase()
        .contains("additional properties"));
    assert_eq!(h.exchange.fill_count(), fills_before, "no orders on schema failure");
    assert!(outcome.journal_path.is_some(), "failed cycles are still journaled");
}

#[tokio::test]
async fn lenient_schema_violation_still_applies() {
    let executor_cfg = ExecutorConfig {
        output_validation: OutputValidation {
            enabled: true,
            schema_path: "schemas/decision_output.json".into(),
            fail_on_invalid: false,
        },
        ..Default::default()
    };
    let h = harness(&["t1"], executor_cfg, None).await;

    let invalid = r#"{"signal":"buy_to_enter","symbol":"BTC","leverage":3,"position_size_usd":150,"entry_price":100,"stop_loss":95,"take_profit":110,"risk_usd":15,"confidence":80,"invalidation_condition":"below EMA","reasoning":"trend","extra_field":"warn only"}"#;
    h.llm.push(invalid, 100);
    let outcome = h.manager.run_cycle_for("t1").await.unwrap();
    assert!(outcome.record.success);
    assert_eq!(outcome.applied, 1);
}

#[tokio::test]
async fn low_confidence_open_is_rejected_individually() {
    let h = harness(&["t1"], ExecutorConfig::default(), None).await;

    // Two decisions in one cycle: the low-confidence ETH open is rejected,
    // the BTC open applies, and the cycle still succeeds.
    let payload = format!(
        r#"[{},{}]"#,
        OPEN_BTC,
        r#"{"signal":"sell_to_enter","symbol":"ETH","leverage":5,"position_size_usd":100,"entry_price":50,"stop_loss":55,"take_profit":35,"risk_usd":10,"confidence":40,"invalidation_condition":"","reasoning":"weak"}"#
    );
    h.llm.push(&payload, 100);
    let outcome = h.manager.run_cycle_for("t1").await.unwrap();
    assert!(outcome.record.success);
    assert_eq!(outcome.applied, 1);
    assert_eq!(outcome.rejected, 1);
    assert_eq!(h.manager.registry().owner("BTC"), Some("t1".to_string()));
    assert_eq!(h.manager.registry().owner("ETH"), None);
}

#[tokio::test]
async fn reload_preserves_positions_across_config_swap() {
    let h = harness(&["t1"], ExecutorConfig::default(), None).await;
    h.llm.push(OPEN_BTC, 100);
    h.manager.run_cycle_for("t1").await.unwrap();
    assert_eq!(h.manager.registry().owner("BTC"), Some("t1".to_string()));

    let trader = h.manager.trader("t1").await.unwrap();
    let mut new_cfg = trader.config.read().await.clone();
    new_cfg.risk_params.min_confidence = 80;
    let summary = h.manager.reload(vec![new_cfg]).await.unwrap();
    assert_eq!(summary.updated, vec!["t1".to_string()]);

    // book and cycle numbering survive the swap
    assert_eq!(h.manager.registry().owner("BTC"), Some("t1".to_string()));
    let trader = h.manager.trader("t1").await.unwrap();
    assert_eq!(trader.runtime.read().await.cycle_number, 1);
    assert_eq!(trader.config.read().await.risk_params.min_confidence, 80);

    // removing the trader releases its symbols
    let summary = h.manager.reload(vec![]).await.unwrap();
    assert_eq!(summary.removed, vec!["t1".to_string()]);
    assert_eq!(h.manager.registry().owner("BTC"), None);
}

#[tokio::test]
async fn journal_replay_round_trips_recorded_cycle() {
    let h = harness(&["t1"], ExecutorConfig::default(), None).await;

    h.llm.push(OPEN_BTC, 100);
    let outcome = h.manager.run_cycle_for("t1").await.unwrap();
    let path = outcome.journal_path.unwrap();

    let store = Store::new(h.journal_dir.path());
    let record = store.load(&path).unwrap();
    assert_eq!(record.trader_id, "t1");
    assert_eq!(record.cycle_number, 1);
    assert!(!record.prompt_digest.is_empty());
    assert!(!record.decisions_json.is_empty());
    assert_eq!(record.actions.len(), 1);
    assert_eq!(record.actions[0]["action"], "open_long");

    // The stored raw payload renormalises to the journaled action summary.
    let cfg = ExecutorConfig::default();
    let ctx = fleetbot::journal::replay::build_executor_context(&cfg, &record);
    let raw = fleetbot::journal::replay::parse_decisions_json(&record.decisions_json).unwrap();
    let decisions: Vec<_> = raw
        .iter()
        .map(|r| fleetbot::executor::normalize_decision(r, &ctx).unwrap())
        .collect();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].symbol, "BTC");
    assert_eq!(decisions[0].action, "open_long");
}
