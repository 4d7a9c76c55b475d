//! One cooperative worker per virtual trader.
//!
//! Ticks are drift-free (`next = period_start + n * interval`); a tick that
//! cannot start before the following one is dropped, never queued. At most
//! one cycle is in flight per trader.

use super::registry::PositionRegistry;
use super::risk::enforce_secondary_risk;
use super::types::{
    normalize_symbol, DecisionCycleEvent, PersistenceService, PositionEvent, PositionEventKind,
    RuntimeStateEvent, SymbolCooldown, TraderConfig, VirtualPosition, VirtualTrader,
};
use crate::clock::{next_utc_midnight, Clock};
use crate::errors::FleetError;
use crate::exchange::{ExchangeProvider, Order};
use crate::executor::{
    sha256_hex, AccountInfo, CandidateCoin, Decision, DecisionContext, Executor, PositionInfo,
};
use crate::journal::{CycleRecord, Store};
use crate::logger::{self, LogTag};
use crate::market::MarketProvider;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

/// Everything a trader loop needs. No back-pointer to the manager beyond
/// the cancellation receiver.
pub struct LoopDeps {
    pub trader: Arc<VirtualTrader>,
    pub registry: Arc<PositionRegistry>,
    pub executor: Arc<Executor>,
    pub exchange: Arc<dyn ExchangeProvider>,
    pub market: Arc<dyn MarketProvider>,
    pub journal: Arc<Store>,
    pub persistence: Option<Arc<dyn PersistenceService>>,
    pub clock: Arc<dyn Clock>,
    pub decision_semaphore: Option<Arc<Semaphore>>,
    /// Symbol -> no-opens-before instant for this trader.
    pub cooldowns: Mutex<HashMap<String, DateTime<Utc>>>,
    in_flight: tokio::sync::Mutex<()>,
}

impl LoopDeps {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trader: Arc<VirtualTrader>,
        registry: Arc<PositionRegistry>,
        executor: Arc<Executor>,
        exchange: Arc<dyn ExchangeProvider>,
        market: Arc<dyn MarketProvider>,
        journal: Arc<Store>,
        persistence: Option<Arc<dyn PersistenceService>>,
        clock: Arc<dyn Clock>,
        decision_semaphore: Option<Arc<Semaphore>>,
    ) -> Self {
        Self {
            trader,
            registry,
            executor,
            exchange,
            market,
            journal,
            persistence,
            clock,
            decision_semaphore,
            cooldowns: Mutex::new(HashMap::new()),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub fn set_cooldowns(&self, entries: HashMap<String, DateTime<Utc>>) {
        *self.cooldowns.lock().unwrap() = entries;
    }
}

/// Result of one cycle, returned for tests and replay tooling.
pub struct CycleOutcome {
    pub record: CycleRecord,
    pub applied: usize,
    pub rejected: usize,
    pub journal_path: Option<PathBuf>,
}

pub struct TraderLoop;

impl TraderLoop {
    /// Spawns the tick-driven worker. The task exits on cancellation after
    /// finishing the current atomic phase.
    pub fn spawn(deps: Arc<LoopDeps>, mut cancel: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            {
                let mut runtime = deps.trader.runtime.write().await;
                runtime.running = true;
            }
            let interval = {
                let config = deps.trader.config.read().await;
                config.decision_interval()
            };
            let period_start = deps.clock.now_utc();
            let interval_chrono =
                chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::seconds(60));
            let mut n: i64 = 0;

            logger::info(
                LogTag::Trader,
                &format!("{}: loop started, interval {:?}", deps.trader.id, interval),
            );

            loop {
                // Drop missed ticks instead of queueing catch-up work.
                let now = deps.clock.now_utc();
                let elapsed = now - period_start;
                let min_n = elapsed.num_milliseconds() / interval_chrono.num_milliseconds().max(1);
                n = (n + 1).max(min_n + 1);
                let next = period_start + interval_chrono * (n as i32);
                {
                    let mut runtime = deps.trader.runtime.write().await;
                    runtime.next_decision_at = Some(next);
                }
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = cancel.changed() => {}
                }
                if *cancel.borrow() {
                    break;
                }

                {
                    let now = deps.clock.now_utc();
                    let mut runtime = deps.trader.runtime.write().await;
                    if !runtime.running {
                        break;
                    }
                    if runtime.is_paused(now) {
                        continue;
                    }
                    if runtime.paused_until.is_some() {
                        runtime.paused_until = None;
                        runtime.pause_reason.clear();
                    }
                }

                let _permit = match &deps.decision_semaphore {
                    Some(sem) => match sem.clone().acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                    None => None,
                };
                Self::run_cycle(&deps).await;
            }

            {
                let mut runtime = deps.trader.runtime.write().await;
                runtime.running = false;
            }
            logger::info(LogTag::Trader, &format!("{}: loop stopped", deps.trader.id));
        })
    }

    /// Executes one full decision cycle. Errors are folded into the journal
    /// record; the cycle itself never propagates a failure.
    pub async fn run_cycle(deps: &LoopDeps) -> CycleOutcome {
        let _guard = match deps.in_flight.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                // Another cycle is in flight for this trader; drop the tick.
                return CycleOutcome {
                    record: CycleRecord::new(&deps.trader.id, deps.clock.now_utc()),
                    applied: 0,
                    rejected: 0,
                    journal_path: None,
                };
            }
        };

        let now = deps.clock.now_utc();
        let config = deps.trader.config.read().await.clone();
        let cycle_number = {
            let mut runtime = deps.trader.runtime.write().await;
            runtime.cycle_number += 1;
            runtime.cycle_number
        };

        let mut record = CycleRecord::new(&deps.trader.id, now);
        record.config_version = config.version;
        record.cycle_number = cycle_number;

        let mut applied = 0;
        let mut rejected = 0;

        match Self::build_context(deps, &config, &mut record).await {
            Ok(ctx) => {
                match deps.executor.get_full_decision_for(&ctx, &deps.trader.id).await {
                    Ok(full) => {
                        record.prompt_digest = sha256_hex(full.user_prompt.as_bytes());
                        record.cot_trace = full.cot_trace.clone();
                        record.decisions_json = full.raw_payload.clone();
                        record.actions = action_summaries(&full.decisions);

                        let mut attempted = 0;
                        let mut first_reason = String::new();
                        for decision in &full.decisions {
                            if decision.is_hold() {
                                continue;
                            }
                            attempted += 1;
                            match Self::apply_decision(deps, &config, decision).await {
                                Ok(true) => applied += 1,
                                Ok(false) => {
                                    rejected += 1;
                                    if first_reason.is_empty() {
                                        first_reason =
                                            format!("{}: order not filled", decision.symbol);
                                    }
                                }
                                Err(err) => {
                                    rejected += 1;
                                    if first_reason.is_empty() {
                                        first_reason = err.to_string();
                                    }
                                    logger::warn(
                                        LogTag::Trader,
                                        &format!(
                                            "{}: decision rejected: {}",
                                            deps.trader.id, err
                                        ),
                                    );
                                }
                            }
                        }
                        // Success when anything applied, or nothing needed applying.
                        record.success = attempted == 0 || applied > 0;
                        if !record.success {
                            record.error_message = first_reason;
                        }
                    }
                    Err(err) => {
                        record.success = false;
                        record.error_message = err.to_string();
                        if err.pauses_trader() {
                            let until = next_utc_midnight(now);
                            let mut runtime = deps.trader.runtime.write().await;
                            runtime.paused_until = Some(until);
                            runtime.pause_reason = "llm budget exhausted".into();
                            logger::warn(
                                LogTag::Budget,
                                &format!(
                                    "{}: paused until {} (budget exhausted)",
                                    deps.trader.id, until
                                ),
                            );
                        }
                    }
                }
            }
            Err(err) => {
                record.success = false;
                record.error_message = err.to_string();
            }
        }

        {
            let mut runtime = deps.trader.runtime.write().await;
            runtime.last_decision_at = Some(now);
        }

        let journal_path = match deps.journal.append(&record) {
            Ok(path) => Some(path),
            Err(err) => {
                logger::error(
                    LogTag::Journal,
                    &format!("{}: journal append failed: {}", deps.trader.id, err),
                );
                None
            }
        };

        // The journal is the source of truth: a failed append skips DB
        // mirroring entirely so the database never runs ahead of it.
        if journal_path.is_some() {
            Self::mirror_cycle(deps, &config, &record).await;
        }

        logger::log(
            LogTag::Trader,
            "CYCLE",
            &format!(
                "{} #{} success={} applied={} rejected={}",
                deps.trader.id, cycle_number, record.success, applied, rejected
            ),
        );

        CycleOutcome { record, applied, rejected, journal_path }
    }

    async fn mirror_cycle(deps: &LoopDeps, config: &TraderConfig, record: &CycleRecord) {
        let Some(persistence) = &deps.persistence else {
            return;
        };
        if let Err(err) = persistence
            .record_decision_cycle(DecisionCycleEvent {
                trader_id: deps.trader.id.clone(),
                config_version: config.version,
                cycle: record.clone(),
            })
            .await
        {
            logger::error(
                LogTag::Persist,
                &format!("{}: mirror decision cycle: {}", deps.trader.id, err),
            );
        }
        let runtime = deps.trader.runtime.read().await.clone();
        if let Err(err) = persistence
            .upsert_runtime_state(RuntimeStateEvent {
                trader_id: deps.trader.id.clone(),
                active_config_version: config.version,
                is_running: runtime.running,
                state: runtime,
            })
            .await
        {
            logger::error(
                LogTag::Persist,
                &format!("{}: mirror runtime state: {}", deps.trader.id, err),
            );
        }
    }

    /// Assembles the decision context and records its inputs into the
    /// pending journal entry.
    async fn build_context(
        deps: &LoopDeps,
        config: &TraderConfig,
        record: &mut CycleRecord,
    ) -> Result<DecisionContext, FleetError> {
        let account = deps.exchange.account().await?;
        let exchange_positions = deps.exchange.positions().await?;
        let filtered = deps.registry.filter_positions(&deps.trader.id, &exchange_positions);

        let alloc = *deps.trader.resource_alloc.read().await;
        let equity = if alloc.current_equity_usd > 0.0 {
            alloc.current_equity_usd
        } else {
            account.total_equity
        };
        let used_pct = if equity > 0.0 { alloc.margin_used_usd / equity * 100.0 } else { 0.0 };

        let mut ctx = DecisionContext::default();
        ctx.current_time = record.timestamp.to_rfc3339();
        ctx.call_count = record.cycle_number;
        ctx.account = AccountInfo {
            total_equity: equity,
            available_balance: (equity - alloc.margin_used_usd).max(0.0),
            margin_used: alloc.margin_used_usd,
            margin_used_pct: used_pct,
            position_count: filtered.len(),
            ..Default::default()
        };

        ctx.positions = filtered
            .iter()
            .map(|pos| PositionInfo {
                symbol: normalize_symbol(&pos.symbol),
                side: pos.side.to_lowercase(),
                entry_price: pos.entry_price,
                mark_price: pos.mark_price,
                quantity: pos.quantity,
                leverage: pos.leverage.round() as u32,
                unrealized_pnl: pos.unrealized_pnl,
                liquidation_price: pos.liquidation_price,
                margin_used: pos.margin_used,
                ..Default::default()
            })
            .collect();

        let candidates = deps
            .market
            .candidates()
            .await
            .map_err(|e| FleetError::Exchange(format!("market candidates: {}", e)))?;
        let mut symbols: Vec<String> = candidates.iter().map(|s| normalize_symbol(s)).collect();
        for pos in &ctx.positions {
            if !symbols.contains(&pos.symbol) {
                symbols.push(pos.symbol.clone());
            }
        }

        for symbol in &symbols {
            match deps.market.snapshot(symbol).await {
                Ok(snap) => {
                    ctx.market_data.insert(symbol.clone(), snap);
                }
                Err(err) => {
                    logger::debug(
                        LogTag::Trader,
                        &format!("{}: snapshot {} unavailable: {}", deps.trader.id, symbol, err),
                    );
                }
            }
        }

        // Primary guards shape the candidate set before the LLM sees it:
        // symbols in cooldown and symbols below the liquidity floor are
        // dropped here rather than rejected later.
        let now = deps.clock.now_utc();
        let cooldowns = deps.cooldowns.lock().unwrap().clone();
        let liquidity_floor = config.risk_params.liquidity_threshold_usd;
        ctx.candidate_coins = candidates
            .iter()
            .map(|s| normalize_symbol(s))
            .filter(|symbol| {
                if let Some(until) = cooldowns.get(symbol) {
                    if now < *until {
                        return false;
                    }
                }
                if liquidity_floor > 0.0 {
                    if let Some(snap) = ctx.market_data.get(symbol) {
                        if snap.open_interest.is_some()
                            && snap.open_interest_usd() < liquidity_floor
                        {
                            return false;
                        }
                    }
                }
                true
            })
            .map(|symbol| CandidateCoin { symbol, sources: Vec::new() })
            .collect();

        let exec_cfg = deps.executor.config();
        ctx.major_coin_leverage = if config.risk_params.major_coin_leverage > 0 {
            config.risk_params.major_coin_leverage
        } else {
            exec_cfg.major_coin_leverage
        };
        ctx.altcoin_leverage = if config.risk_params.altcoin_leverage > 0 {
            config.risk_params.altcoin_leverage
        } else {
            exec_cfg.altcoin_leverage
        };
        ctx.max_risk_pct = config.risk_params.max_risk_pct;
        ctx.max_position_size_usd = config.risk_params.max_position_size_usd;
        ctx.liquidity_threshold_usd = config.risk_params.liquidity_threshold_usd;
        ctx.max_margin_usage_pct = config.risk_params.max_margin_usage_pct;
        ctx.btc_eth_position_value_min_multiple =
            config.risk_params.btc_eth_position_value_min_multiple;
        ctx.btc_eth_position_value_max_multiple =
            config.risk_params.btc_eth_position_value_max_multiple;
        ctx.alt_position_value_min_multiple = config.risk_params.alt_position_value_min_multiple;
        ctx.alt_position_value_max_multiple = config.risk_params.alt_position_value_max_multiple;
        ctx.cooldown_after_close =
            Duration::from_secs(config.risk_params.cooldown_after_close_secs);
        ctx.recently_closed = deps.cooldowns.lock().unwrap().clone();

        // Inputs into the pending journal entry.
        record.account = account_digest(&ctx.account);
        record.positions = ctx.positions.iter().map(position_digest).collect();
        record.candidates = ctx.candidate_coins.iter().map(|c| c.symbol.clone()).collect();
        record.market_digest = market_digest(&ctx);

        Ok(ctx)
    }

    /// Applies one accepted decision: secondary risk, ownership, order
    /// submission, registry bookkeeping and persistence events.
    /// Returns Ok(true) on fill, Ok(false) when the order did not fill.
    async fn apply_decision(
        deps: &LoopDeps,
        config: &TraderConfig,
        decision: &Decision,
    ) -> Result<bool, FleetError> {
        let symbol = normalize_symbol(&decision.symbol);
        let now = deps.clock.now_utc();

        if decision.is_open() {
            // Ownership is checked before any order leaves the process.
            if let Some(owner) = deps.registry.owner(&symbol) {
                if owner != deps.trader.id {
                    return Err(FleetError::SymbolOwned { symbol, owner });
                }
            }
            if let Some(until) = deps.cooldowns.lock().unwrap().get(&symbol) {
                if now < *until {
                    return Err(FleetError::RiskViolation(format!(
                        "{}: in cooldown until {}",
                        symbol, until
                    )));
                }
            }
            let alloc = *deps.trader.resource_alloc.read().await;
            enforce_secondary_risk(
                decision,
                &config.risk_params,
                &alloc,
                deps.registry.position_count(&deps.trader.id),
            )?;

            let price = decision.entry_price;
            if price <= 0.0 {
                return Err(FleetError::RiskViolation(format!(
                    "{}: open decision has no entry price",
                    symbol
                )));
            }
            let qty = decision.position_size_usd / price;
            if qty <= 0.0 || !qty.is_finite() {
                return Err(FleetError::RiskViolation(format!(
                    "{}: non-positive order size",
                    symbol
                )));
            }
            let order = Order::ioc_limit(
                &symbol,
                decision.action == "open_long",
                price,
                qty,
                false,
            );
            let response = deps.exchange.submit_order(&order).await?;
            let Some(fill) = response.fill() else {
                return Ok(false);
            };

            let fill_price = fill.avg_price();
            let fill_size = fill.total_size();
            deps.registry.assign(
                &deps.trader.id,
                VirtualPosition {
                    symbol: symbol.clone(),
                    side: if decision.action == "open_long" { "long".into() } else { "short".into() },
                    quantity: fill_size,
                    entry_price: fill_price,
                    leverage: decision.leverage,
                    confidence: decision.confidence,
                    risk_usd: decision.risk_usd,
                    opened_at_ms: now.timestamp_millis(),
                    exchange: config.exchange_provider.clone(),
                },
            )?;
            {
                let mut alloc = deps.trader.resource_alloc.write().await;
                alloc.margin_used_usd += decision.position_size_usd / decision.leverage.max(1) as f64;
            }
            logger::log(
                LogTag::Trader,
                "OPEN",
                &format!("{} {} {} @ {:.4}", deps.trader.id, decision.action, symbol, fill_price),
            );
            Self::emit_position_event(deps, config, decision, PositionEventKind::Open, fill_price, fill_size)
                .await;
            Ok(true)
        } else {
            let Some(position) = deps.registry.position(&deps.trader.id, &symbol) else {
                return Err(FleetError::RiskViolation(format!(
                    "{}: no owned position to close",
                    symbol
                )));
            };
            let price = if decision.entry_price > 0.0 {
                decision.entry_price
            } else {
                position.entry_price
            };
            let order = Order::ioc_limit(
                &symbol,
                decision.action == "close_short",
                price,
                position.quantity,
                true,
            );
            let response = deps.exchange.submit_order(&order).await?;
            let Some(fill) = response.fill() else {
                return Ok(false);
            };

            deps.registry.release(&deps.trader.id, &symbol);
            {
                let mut alloc = deps.trader.resource_alloc.write().await;
                let entry_margin =
                    position.quantity * position.entry_price / position.leverage.max(1) as f64;
                alloc.margin_used_usd = (alloc.margin_used_usd - entry_margin).max(0.0);
            }

            if config.risk_params.cooldown_after_close_secs > 0 {
                let until = now
                    + chrono::Duration::seconds(config.risk_params.cooldown_after_close_secs as i64);
                deps.cooldowns.lock().unwrap().insert(symbol.clone(), until);
                if let Some(persistence) = &deps.persistence {
                    let cooldown = SymbolCooldown {
                        trader_id: deps.trader.id.clone(),
                        symbol: symbol.clone(),
                        cooldown_until: Some(until),
                        reason: "closed position".into(),
                        consecutive_losses: 0,
                    };
                    if let Err(err) = persistence.record_cooldown(cooldown).await {
                        logger::error(
                            LogTag::Persist,
                            &format!("{}: record cooldown: {}", deps.trader.id, err),
                        );
                    }
                }
            }

            logger::log(
                LogTag::Trader,
                "CLOSE",
                &format!("{} {} {} @ {:.4}", deps.trader.id, decision.action, symbol, fill.avg_price()),
            );
            Self::emit_position_event(
                deps,
                config,
                decision,
                PositionEventKind::Close,
                fill.avg_price(),
                fill.total_size(),
            )
            .await;
            Ok(true)
        }
    }

    async fn emit_position_event(
        deps: &LoopDeps,
        config: &TraderConfig,
        decision: &Decision,
        kind: PositionEventKind,
        fill_price: f64,
        fill_size: f64,
    ) {
        let Some(persistence) = &deps.persistence else {
            return;
        };
        let event = PositionEvent {
            kind,
            trader_id: deps.trader.id.clone(),
            exchange: config.exchange_provider.clone(),
            decision: decision.clone(),
            fill_price,
            fill_size,
            occurred_at: deps.clock.now_utc(),
        };
        if let Err(err) = persistence.record_position_event(event).await {
            logger::error(
                LogTag::Persist,
                &format!("{}: record position event: {}", deps.trader.id, err),
            );
        }
    }
}

fn action_summaries(decisions: &[Decision]) -> Vec<Map<String, Value>> {
    decisions
        .iter()
        .map(|d| {
            let mut map = Map::new();
            map.insert("symbol".into(), json!(d.symbol));
            map.insert("action".into(), json!(d.action));
            map.insert("confidence".into(), json!(d.confidence));
            map
        })
        .collect()
}

fn account_digest(account: &AccountInfo) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("equity".into(), json!(account.total_equity));
    map.insert("available".into(), json!(account.available_balance));
    map.insert("used_margin".into(), json!(account.margin_used));
    map.insert("used_pct".into(), json!(account.margin_used_pct));
    map.insert("positions".into(), json!(account.position_count));
    map
}

fn position_digest(pos: &PositionInfo) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("symbol".into(), json!(pos.symbol));
    map.insert("side".into(), json!(pos.side));
    map.insert("qty".into(), json!(pos.quantity));
    map.insert("lev".into(), json!(pos.leverage));
    map.insert("entry".into(), json!(pos.entry_price));
    map.insert("mark".into(), json!(pos.mark_price));
    map.insert("upnl".into(), json!(pos.unrealized_pnl));
    map.insert("liq".into(), json!(pos.liquidation_price));
    map
}

fn market_digest(ctx: &DecisionContext) -> Map<String, Value> {
    let mut map = Map::new();
    for (symbol, snap) in &ctx.market_data {
        let mut entry = Map::new();
        entry.insert("price".into(), json!(snap.price.last));
        entry.insert("chg1h".into(), json!(snap.change.one_hour));
        entry.insert("chg4h".into(), json!(snap.change.four_hour));
        if let Some(oi) = &snap.open_interest {
            entry.insert("oi_latest".into(), json!(oi.latest));
        }
        if let Some(funding) = &snap.funding {
            entry.insert("funding".into(), json!(funding.rate));
        }
        map.insert(symbol.clone(), Value::Object(entry));
    }
    map
}
