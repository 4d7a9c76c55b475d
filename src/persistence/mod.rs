//! Persistence service: mirrors journal cycles and position lifecycle to
//! the database and keeps the per-trader caches materialised.
//!
//! Implements the manager's `PersistenceService` hooks and the executor's
//! `ConversationRecorder`. Every operation is idempotent under duplicate
//! keys; cache writes are best-effort and logged on failure.

pub mod database;
pub mod models;

pub use database::Database;

use crate::cache::{keys, CacheStore, TtlSet};
use crate::clock::{Clock, SystemClock};
use crate::errors::FleetError;
use crate::executor::{ConversationRecord, ConversationRecorder};
use crate::journal::CycleRecord;
use crate::logger::{self, LogTag};
use crate::manager::types::{
    normalize_ids, AccountSyncSnapshot, AnalyticsSnapshot, DecisionCycleEvent, PersistenceService,
    PositionEvent, PositionEventKind, RuntimeStateEvent, SymbolCooldown,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use models::{
    DecisionCycleRow, PositionCloseDetail, PositionDetail, PositionRow, TradeDetail, TradeRow,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

const RECENT_TRADES_LIMIT: usize = 100;
const CONVERSATIONS_CACHE_LIMIT: usize = 20;

/// Open position entry as cached per trader.
///
/// `risk_usd` is the risk accepted at entry; `unrealized_pnl` is a
/// mark-to-market metric. They are distinct fields and neither ever
/// overwrites the other.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionCacheEntry {
    pub symbol: String,
    pub side: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub leverage: f64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub risk_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unrealized_pnl: Option<f64>,
    pub updated_at_ms: i64,
    #[serde(default)]
    pub exchange: String,
}

/// Closed trade entry as cached in the per-trader recent list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeCacheEntry {
    pub trader_id: String,
    pub symbol: String,
    pub side: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    #[serde(default)]
    pub confidence: f64,
    pub closed_at_ms: i64,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub entry_time_ms: i64,
    #[serde(default)]
    pub leverage: f64,
    #[serde(default)]
    pub position_size: f64,
}

/// Latest decision summary cached per trader.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionCacheEntry {
    pub trader_id: String,
    #[serde(default)]
    pub config_version: i64,
    pub success: bool,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub confidence: i32,
    #[serde(default)]
    pub error: String,
}

pub struct Service {
    db: Arc<Database>,
    cache: Arc<CacheStore>,
    ttl: TtlSet,
    clock: Arc<dyn Clock>,
}

impl Service {
    pub fn new(db: Arc<Database>, cache: Arc<CacheStore>, ttl: TtlSet) -> Self {
        Self { db, cache, ttl, clock: Arc::new(SystemClock) }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    // ------------------------------------------------------------------
    // position lifecycle
    // ------------------------------------------------------------------

    async fn handle_open_position(
        &self,
        trader_id: &str,
        symbol: &str,
        event: &PositionEvent,
    ) -> Result<(), FleetError> {
        let price = effective_price(event);
        let qty = effective_quantity(event, price);
        let side = if event.decision.action.eq_ignore_ascii_case("open_short") {
            "short"
        } else {
            "long"
        };
        let entry_time = event.occurred_at;

        let mut detail = PositionDetail::default();
        detail.entry.price = price;
        detail.entry.quantity = qty;
        detail.entry.time_ms = entry_time.timestamp_millis();
        detail.entry.leverage = event.decision.leverage as f64;
        detail.exchange.provider = event.exchange.trim().to_string();
        detail.risk.confidence = event.decision.confidence as f64;
        detail.risk.risk_usd = event.decision.risk_usd;

        let row = PositionRow {
            id: position_id(trader_id, symbol),
            trader_id: trader_id.to_string(),
            symbol: symbol.to_string(),
            side: side.to_string(),
            status: "open".into(),
            detail: detail.encode(),
        };
        self.db.upsert_position_open(&row)?;

        let entry = PositionCacheEntry {
            symbol: symbol.to_string(),
            side: side.to_string(),
            quantity: qty,
            entry_price: price,
            leverage: event.decision.leverage as f64,
            confidence: event.decision.confidence as f64,
            risk_usd: event.decision.risk_usd,
            unrealized_pnl: None,
            updated_at_ms: self.clock.now_utc().timestamp_millis(),
            exchange: event.exchange.trim().to_string(),
        };
        self.cache_open_position(trader_id, symbol, Some(entry)).await;
        Ok(())
    }

    async fn handle_close_position(
        &self,
        trader_id: &str,
        symbol: &str,
        event: &PositionEvent,
    ) -> Result<(), FleetError> {
        let id = position_id(trader_id, symbol);
        let existing = self.db.find_position(&id)?;
        let existing_detail = existing
            .as_ref()
            .map(|row| PositionDetail::decode(&row.detail))
            .unwrap_or_default();

        let mut close_price = effective_price(event);
        if close_price <= 0.0 && existing_detail.entry.price > 0.0 {
            close_price = existing_detail.entry.price;
        }
        let close_time = event.occurred_at;
        let mut qty = effective_quantity(event, close_price);
        if qty <= 0.0 && existing_detail.entry.quantity > 0.0 {
            qty = existing_detail.entry.quantity;
        }

        // Realised PnL = sign * (exit - entry) * qty, sign -1 for shorts.
        let mut pnl: Option<f64> = None;
        if let Some(row) = &existing {
            if close_price > 0.0 && existing_detail.entry.price > 0.0 && qty > 0.0 {
                let sign = if row.side.eq_ignore_ascii_case("short") { -1.0 } else { 1.0 };
                pnl = Some(sign * (close_price - existing_detail.entry.price) * qty);
            }
        }

        let mut detail = existing_detail.clone();
        detail.close = Some(PositionCloseDetail {
            price: close_price,
            time_ms: close_time.timestamp_millis(),
            quantity: qty,
            pnl: pnl.unwrap_or(0.0),
        });
        self.db.mark_position_closed(&id, &detail.encode())?;

        let summary = self.insert_trade(trader_id, symbol, close_price, qty, pnl, close_time, event)?;
        self.cache_open_position(trader_id, symbol, None).await;
        if let Some(summary) = summary {
            self.append_recent_trade(trader_id, summary).await;
            self.refresh_analytics(trader_id).await;
        }
        Ok(())
    }

    /// Recomputes since-inception analytics from the recent trade history
    /// after a close. Best-effort: failures are logged by the caller chain.
    async fn refresh_analytics(&self, trader_id: &str) {
        let trades = match self.db.recent_trades(trader_id, RECENT_TRADES_LIMIT) {
            Ok(trades) => trades,
            Err(err) => {
                logger::error(
                    LogTag::Persist,
                    &format!("analytics trades load trader={}: {}", trader_id, err),
                );
                return;
            }
        };
        if trades.is_empty() {
            return;
        }
        let total = trades.len() as u64;
        let wins = trades
            .iter()
            .filter(|t| t.realized_net_pnl.unwrap_or(0.0) > 0.0)
            .count() as u64;
        let total_pnl: f64 = trades.iter().filter_map(|t| t.realized_net_pnl).sum();
        let snapshot = AnalyticsSnapshot {
            trader_id: trader_id.to_string(),
            total_pnl_usd: total_pnl,
            total_pnl_pct: 0.0,
            sharpe_ratio: 0.0,
            win_rate: wins as f64 / total as f64,
            total_trades: total,
            max_drawdown_pct: 0.0,
            updated_at: Some(self.clock.now_utc()),
        };
        if let Err(err) = self.record_analytics(snapshot).await {
            logger::error(
                LogTag::Persist,
                &format!("analytics refresh trader={}: {}", trader_id, err),
            );
        }
    }

    fn insert_trade(
        &self,
        trader_id: &str,
        symbol: &str,
        close_price: f64,
        qty: f64,
        pnl: Option<f64>,
        close_time: DateTime<Utc>,
        event: &PositionEvent,
    ) -> Result<Option<TradeCacheEntry>, FleetError> {
        let id = position_id(trader_id, symbol);
        let Some(pos) = self.db.find_position(&id)? else {
            return Ok(None);
        };
        let pos_detail = PositionDetail::decode(&pos.detail);
        let trade_qty = if qty > 0.0 { qty } else { pos_detail.entry.quantity };
        let entry_ts = pos_detail.entry.time_ms;
        let close_ts_ms = close_time.timestamp_millis();

        let mut detail = TradeDetail::default();
        detail.time.open_ts_ms = entry_ts;
        detail.time.close_ts_ms = close_ts_ms;
        if close_ts_ms > 0 && entry_ts > 0 && close_ts_ms > entry_ts {
            detail.time.duration_seconds = (close_ts_ms - entry_ts) / 1000;
        }
        detail.prices.entry = pos_detail.entry.price;
        detail.prices.exit = close_price;
        detail.quantity.total = trade_qty;
        detail.risk.confidence = event.decision.confidence as f64;
        detail.risk.leverage = pos_detail.entry.leverage;
        detail.exchange.provider = pos_detail.exchange.provider.clone();
        detail.pnl.net = pnl.unwrap_or(0.0);

        let row = TradeRow {
            id: trade_id(trader_id, symbol, close_time),
            trader_id: pos.trader_id.clone(),
            symbol: symbol.to_string(),
            side: pos.side.clone(),
            close_ts_ms,
            detail: detail.encode(),
        };
        if !self.db.insert_trade(&row)? {
            return Ok(None);
        }

        Ok(Some(TradeCacheEntry {
            trader_id: pos.trader_id,
            symbol: symbol.to_string(),
            side: pos.side,
            quantity: trade_qty,
            entry_price: pos_detail.entry.price,
            exit_price: close_price,
            realized_pnl: pnl.unwrap_or(0.0),
            confidence: event.decision.confidence as f64,
            closed_at_ms: close_ts_ms,
            exchange: pos_detail.exchange.provider,
            entry_time_ms: entry_ts,
            leverage: pos_detail.entry.leverage,
            position_size: pos_detail.entry.quantity,
        }))
    }

    // ------------------------------------------------------------------
    // cache plumbing
    // ------------------------------------------------------------------

    async fn load_positions_cache(
        &self,
        trader_id: &str,
    ) -> Result<HashMap<String, PositionCacheEntry>, FleetError> {
        let payload: Option<HashMap<String, PositionCacheEntry>> = self
            .cache
            .hash_get_json(&keys::trader_positions_hash_key(), &keys::trader_hash_field(trader_id))
            .await?;
        Ok(payload.unwrap_or_default())
    }

    async fn write_positions_cache(
        &self,
        trader_id: &str,
        payload: &HashMap<String, PositionCacheEntry>,
    ) {
        let key = keys::trader_positions_hash_key();
        let field = keys::trader_hash_field(trader_id);
        let result = if payload.is_empty() {
            self.cache.hash_del_field(&key, &field).await
        } else {
            self.cache
                .hash_set_json(&key, &field, self.ttl.positions(), payload)
                .await
        };
        if let Err(err) = result {
            logger::error(
                LogTag::Persist,
                &format!("set positions cache trader={}: {}", trader_id, err),
            );
        }
    }

    async fn cache_open_position(
        &self,
        trader_id: &str,
        symbol: &str,
        entry: Option<PositionCacheEntry>,
    ) {
        let mut payload = match self.load_positions_cache(trader_id).await {
            Ok(payload) => payload,
            Err(err) => {
                logger::error(
                    LogTag::Persist,
                    &format!("load positions cache trader={}: {}", trader_id, err),
                );
                return;
            }
        };
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return;
        }
        match entry {
            Some(mut entry) => {
                if entry.symbol.is_empty() {
                    entry.symbol = symbol.clone();
                }
                payload.insert(symbol, entry);
            }
            None => {
                payload.remove(&symbol);
            }
        }
        self.write_positions_cache(trader_id, &payload).await;
    }

    async fn load_trades_cache(&self, trader_id: &str) -> Result<Vec<TradeCacheEntry>, FleetError> {
        let payload: Option<Vec<TradeCacheEntry>> = self
            .cache
            .hash_get_json(
                &keys::trader_trades_recent_hash_key(),
                &keys::trader_hash_field(trader_id),
            )
            .await?;
        Ok(payload.unwrap_or_default())
    }

    async fn write_trades_cache(&self, trader_id: &str, payload: &[TradeCacheEntry]) {
        let key = keys::trader_trades_recent_hash_key();
        let field = keys::trader_hash_field(trader_id);
        let result = if payload.is_empty() {
            self.cache.hash_del_field(&key, &field).await
        } else {
            self.cache
                .hash_set_json(&key, &field, self.ttl.trades_recent(), &payload)
                .await
        };
        if let Err(err) = result {
            logger::error(
                LogTag::Persist,
                &format!("set trades cache trader={}: {}", trader_id, err),
            );
        }
    }

    async fn append_recent_trade(&self, trader_id: &str, entry: TradeCacheEntry) {
        let mut payload = match self.load_trades_cache(trader_id).await {
            Ok(payload) => payload,
            Err(err) => {
                logger::error(
                    LogTag::Persist,
                    &format!("load trades cache trader={}: {}", trader_id, err),
                );
                return;
            }
        };
        payload.insert(0, entry);
        payload.truncate(RECENT_TRADES_LIMIT);
        self.write_trades_cache(trader_id, &payload).await;
    }

    async fn cache_decision_summary(&self, trader_id: &str, record: &DecisionCycleEvent) {
        let mut entry = DecisionCacheEntry {
            trader_id: trader_id.to_string(),
            config_version: record.config_version,
            success: record.cycle.success,
            timestamp_ms: record.cycle.timestamp.timestamp_millis(),
            error: record.cycle.error_message.clone(),
            ..Default::default()
        };
        if let Some(first) = record.cycle.actions.first() {
            if let Some(sym) = first.get("symbol").and_then(|v| v.as_str()) {
                entry.symbol = sym.to_string();
            }
            if let Some(act) = first.get("action").and_then(|v| v.as_str()) {
                entry.action = act.to_string();
            }
            if let Some(conf) = first.get("confidence").and_then(|v| v.as_f64()) {
                entry.confidence = conf.round() as i32;
            }
        }
        if let Err(err) = self
            .cache
            .hash_set_json(
                &keys::trader_decision_last_hash_key(),
                &keys::trader_hash_field(trader_id),
                self.ttl.decision_last(),
                &entry,
            )
            .await
        {
            logger::error(
                LogTag::Persist,
                &format!("set decision cache trader={}: {}", trader_id, err),
            );
        }
    }

    async fn cache_conversation_id(&self, trader_id: &str, conversation_id: i64) {
        if conversation_id <= 0 || trader_id.trim().is_empty() {
            return;
        }
        let key = keys::conversations_key(trader_id);
        let mut ids: Vec<i64> = match self.cache.get_json(&key).await {
            Ok(ids) => ids.unwrap_or_default(),
            Err(err) => {
                logger::error(LogTag::Persist, &format!("load conversations cache: {}", err));
                return;
            }
        };
        ids.insert(0, conversation_id);
        ids.truncate(CONVERSATIONS_CACHE_LIMIT);
        if let Err(err) = self.cache.set_json(&key, self.ttl.conversations(), &ids).await {
            logger::error(LogTag::Persist, &format!("set conversations cache: {}", err));
        }
    }

    // ------------------------------------------------------------------
    // hydration
    // ------------------------------------------------------------------

    async fn hydrate_positions(&self, trader_ids: &[String]) -> Result<(), FleetError> {
        let data = self.db.active_positions_by_traders(trader_ids)?;
        let now_ms = self.clock.now_utc().timestamp_millis();
        for (trader_id, records) in data {
            let mut entries = HashMap::with_capacity(records.len());
            for rec in records {
                let symbol = rec.symbol.trim().to_uppercase();
                if symbol.is_empty() {
                    continue;
                }
                entries.insert(
                    symbol.clone(),
                    PositionCacheEntry {
                        symbol,
                        side: rec.side.to_lowercase(),
                        quantity: rec.quantity,
                        entry_price: rec.entry_price,
                        leverage: rec.leverage.unwrap_or(0.0),
                        confidence: rec.confidence.unwrap_or(0.0),
                        risk_usd: rec.risk_usd.unwrap_or(0.0),
                        unrealized_pnl: rec.unrealized_pnl,
                        updated_at_ms: now_ms,
                        exchange: rec.exchange_provider.trim().to_string(),
                    },
                );
            }
            self.write_positions_cache(&trader_id, &entries).await;
        }
        // Traders with no open rows are skipped entirely: the startup path
        // never issues cache deletes, stale entries expire via TTL.
        Ok(())
    }

    async fn hydrate_trades(&self, trader_ids: &[String]) -> Result<(), FleetError> {
        for trader_id in trader_ids {
            let records = self.db.recent_trades(trader_id, RECENT_TRADES_LIMIT)?;
            if records.is_empty() {
                continue;
            }
            let entries: Vec<TradeCacheEntry> = records
                .iter()
                .map(|rec| {
                    let mut closed_at_ms = rec.exit_ts_ms.unwrap_or(0);
                    if closed_at_ms == 0 && rec.entry_ts_ms > 0 {
                        closed_at_ms = rec.entry_ts_ms;
                    }
                    TradeCacheEntry {
                        trader_id: rec.trader_id.clone(),
                        symbol: rec.symbol.trim().to_uppercase(),
                        side: rec.side.to_lowercase(),
                        quantity: rec.quantity.unwrap_or(0.0),
                        entry_price: rec.entry_price.unwrap_or(0.0),
                        exit_price: rec.exit_price.unwrap_or(0.0),
                        realized_pnl: rec.realized_net_pnl.unwrap_or(0.0),
                        confidence: rec.confidence.unwrap_or(0.0),
                        closed_at_ms,
                        exchange: rec.exchange_provider.trim().to_string(),
                        entry_time_ms: rec.entry_ts_ms,
                        leverage: rec.leverage.unwrap_or(0.0),
                        position_size: rec.quantity.unwrap_or(0.0),
                    }
                })
                .collect();
            self.write_trades_cache(trader_id, &entries).await;
        }
        Ok(())
    }

    async fn hydrate_decision_cycles(&self, trader_ids: &[String]) -> Result<(), FleetError> {
        for trader_id in trader_ids {
            let Some(row) = self.db.last_decision(trader_id)? else {
                continue;
            };
            let mut cycle = CycleRecord::new(
                trader_id,
                DateTime::parse_from_rfc3339(&row.executed_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| self.clock.now_utc()),
            );
            cycle.config_version = row.config_version;
            cycle.success = row.success;
            cycle.error_message = row.error_message.clone().unwrap_or_default();
            cycle.decisions_json = row.decisions.clone().unwrap_or_default();
            cycle.actions = decision_actions(&cycle.decisions_json);
            self.cache_decision_summary(
                trader_id,
                &DecisionCycleEvent {
                    trader_id: trader_id.clone(),
                    config_version: row.config_version,
                    cycle,
                },
            )
            .await;
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceService for Service {
    async fn record_position_event(&self, event: PositionEvent) -> Result<(), FleetError> {
        let trader_id = event.trader_id.trim().to_string();
        let symbol = event.decision.symbol.trim().to_uppercase();
        if trader_id.is_empty() || symbol.is_empty() {
            return Ok(());
        }
        match event.kind {
            PositionEventKind::Open => self.handle_open_position(&trader_id, &symbol, &event).await,
            PositionEventKind::Close => {
                self.handle_close_position(&trader_id, &symbol, &event).await
            }
        }
    }

    async fn record_decision_cycle(&self, record: DecisionCycleEvent) -> Result<(), FleetError> {
        let trader_id = if record.trader_id.is_empty() {
            record.cycle.trader_id.clone()
        } else {
            record.trader_id.clone()
        };
        if trader_id.is_empty() {
            return Ok(());
        }
        let config_version = if record.config_version > 0 {
            record.config_version
        } else if record.cycle.config_version > 0 {
            record.cycle.config_version
        } else {
            1
        };
        let row = DecisionCycleRow {
            trader_id: trader_id.clone(),
            cycle_number: if record.cycle.cycle_number > 0 {
                Some(record.cycle.cycle_number)
            } else {
                None
            },
            config_version,
            success: record.cycle.success,
            prompt_digest: non_empty(&record.cycle.prompt_digest),
            cot_trace: non_empty(&record.cycle.cot_trace),
            decisions: non_empty(&record.cycle.decisions_json),
            error_message: non_empty(&record.cycle.error_message),
            executed_at: record.cycle.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        self.db.insert_decision_cycle(&row)?;
        self.cache_decision_summary(&trader_id, &record).await;
        Ok(())
    }

    async fn record_account_snapshot(
        &self,
        snapshot: AccountSyncSnapshot,
    ) -> Result<(), FleetError> {
        if snapshot.trader_id.is_empty() {
            return Ok(());
        }
        let ts = snapshot.synced_at.unwrap_or_else(|| self.clock.now_utc());
        let metadata = json!({
            "available_balance_usd": snapshot.available_balance_usd,
            "unrealized_pnl_usd": snapshot.unrealized_pnl_usd,
        })
        .to_string();
        let cum_pnl_pct = if snapshot.equity_usd != 0.0 {
            Some(snapshot.unrealized_pnl_usd / snapshot.equity_usd * 100.0)
        } else {
            None
        };
        self.db.upsert_account_snapshot(
            &snapshot.trader_id,
            ts.timestamp_millis(),
            snapshot.equity_usd,
            snapshot.unrealized_pnl_usd,
            cum_pnl_pct,
            &metadata,
        )
    }

    async fn record_analytics(&self, snapshot: AnalyticsSnapshot) -> Result<(), FleetError> {
        let trader_id = snapshot.trader_id.trim().to_string();
        if trader_id.is_empty() {
            return Ok(());
        }
        let updated = snapshot.updated_at.unwrap_or_else(|| self.clock.now_utc());
        let payload = json!({
            "total_pnl_usd": snapshot.total_pnl_usd,
            "total_pnl_pct": snapshot.total_pnl_pct,
            "sharpe_ratio": snapshot.sharpe_ratio,
            "win_rate": snapshot.win_rate,
            "total_trades": snapshot.total_trades,
            "max_drawdown_pct": snapshot.max_drawdown_pct,
            "updated_at_rfc3339": updated.to_rfc3339_opts(SecondsFormat::Secs, true),
        });
        if let Err(err) = self
            .cache
            .hash_set_json(
                &keys::trader_analytics_hash_key(),
                &keys::trader_hash_field(&trader_id),
                self.ttl.analytics(),
                &payload,
            )
            .await
        {
            logger::error(LogTag::Persist, &format!("set analytics cache: {}", err));
        }
        let since_inception = json!({
            "total_pnl_usd": snapshot.total_pnl_usd,
            "total_pnl_pct": snapshot.total_pnl_pct,
            "sharpe_ratio": snapshot.sharpe_ratio,
        });
        if let Err(err) = self
            .cache
            .hash_set_json(
                &keys::trader_since_inception_hash_key(),
                &keys::trader_hash_field(&trader_id),
                self.ttl.since_inception(),
                &since_inception,
            )
            .await
        {
            logger::error(LogTag::Persist, &format!("set since-inception cache: {}", err));
        }
        if let Err(err) = self
            .cache
            .zadd_score(&keys::leaderboard_zset_key(), &trader_id, snapshot.total_pnl_pct)
            .await
        {
            logger::error(LogTag::Persist, &format!("leaderboard zadd: {}", err));
        }
        Ok(())
    }

    async fn upsert_runtime_state(&self, event: RuntimeStateEvent) -> Result<(), FleetError> {
        if event.trader_id.is_empty() {
            return Ok(());
        }
        let detail = serde_json::to_string(&event.state)
            .map_err(|e| FleetError::Db(format!("encode runtime state: {}", e)))?;
        self.db.upsert_runtime_state(
            &event.trader_id,
            event.active_config_version,
            event.is_running,
            &detail,
        )
    }

    async fn record_cooldown(&self, cooldown: SymbolCooldown) -> Result<(), FleetError> {
        if cooldown.trader_id.is_empty() || cooldown.symbol.is_empty() {
            return Ok(());
        }
        let detail = json!({
            "reason": cooldown.reason,
            "consecutive_losses": cooldown.consecutive_losses,
        })
        .to_string();
        self.db.upsert_cooldown(
            &cooldown.trader_id,
            &cooldown.symbol.to_uppercase(),
            cooldown.cooldown_until.map(|t| t.timestamp_millis()).unwrap_or(0),
            &detail,
        )
    }

    async fn load_cooldowns(
        &self,
        trader_id: &str,
    ) -> Result<HashMap<String, DateTime<Utc>>, FleetError> {
        let rows = self.db.list_cooldowns(trader_id)?;
        let mut out = HashMap::with_capacity(rows.len());
        for (symbol, until_ms) in rows {
            if until_ms <= 0 {
                continue;
            }
            if let Some(until) = DateTime::from_timestamp_millis(until_ms) {
                out.insert(symbol.to_uppercase(), until);
            }
        }
        Ok(out)
    }

    async fn hydrate_caches(&self, trader_ids: &[String]) -> Result<(), FleetError> {
        let ids = normalize_ids(trader_ids);
        if ids.is_empty() {
            return Ok(());
        }
        let mut first_err = None;
        if let Err(err) = self.hydrate_positions(&ids).await {
            first_err.get_or_insert(err);
        }
        if let Err(err) = self.hydrate_trades(&ids).await {
            first_err.get_or_insert(err);
        }
        if let Err(err) = self.hydrate_decision_cycles(&ids).await {
            first_err.get_or_insert(err);
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ConversationRecorder for Service {
    async fn record_conversation(&self, rec: ConversationRecord) -> Result<(), FleetError> {
        let trader_id = rec.trader_id.trim().to_string();
        if trader_id.is_empty() || rec.prompt.trim().is_empty() || rec.response.trim().is_empty() {
            return Ok(());
        }
        let topic = if rec.topic.trim().is_empty() { None } else { Some(rec.topic.as_str()) };
        let system_meta = json!({
            "model": rec.model_name,
            "prompt_tokens": rec.prompt_tokens,
            "total_tokens": rec.total_tokens,
        })
        .to_string();
        let assistant_meta = json!({
            "model": rec.model_name,
            "completion_tokens": rec.completion_tokens,
            "total_tokens": rec.total_tokens,
        })
        .to_string();
        let messages = vec![
            ("system".to_string(), rec.prompt.clone(), rec.prompt_tokens, system_meta),
            ("assistant".to_string(), rec.response.clone(), rec.completion_tokens, assistant_meta),
        ];
        let conversation_id =
            self.db.insert_conversation(&trader_id, topic, rec.timestamp, &messages)?;
        self.cache_conversation_id(&trader_id, conversation_id).await;
        Ok(())
    }
}

fn position_id(trader_id: &str, symbol: &str) -> String {
    format!("{}|{}", trader_id.trim(), symbol.trim().to_uppercase())
}

fn trade_id(trader_id: &str, symbol: &str, close_time: DateTime<Utc>) -> String {
    format!(
        "{}|{}|{}",
        trader_id,
        symbol.trim().to_uppercase(),
        close_time.timestamp_nanos_opt().unwrap_or_else(|| close_time.timestamp_millis() * 1_000_000)
    )
}

fn effective_price(event: &PositionEvent) -> f64 {
    if event.fill_price > 0.0 {
        return event.fill_price;
    }
    if event.decision.entry_price > 0.0 {
        return event.decision.entry_price;
    }
    0.0
}

fn effective_quantity(event: &PositionEvent, price: f64) -> f64 {
    if event.fill_size > 0.0 {
        return event.fill_size;
    }
    if price > 0.0 && event.decision.position_size_usd > 0.0 {
        let qty = event.decision.position_size_usd / price;
        if qty.is_finite() && qty > 0.0 {
            return qty;
        }
    }
    if event.decision.position_size_usd > 0.0 {
        return event.decision.position_size_usd;
    }
    0.0
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Extracts normalised `{symbol, action, confidence}` summaries from a
/// decisions JSON payload.
pub fn decision_actions(payload: &str) -> Vec<serde_json::Map<String, serde_json::Value>> {
    if payload.trim().is_empty() {
        return Vec::new();
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
        return Vec::new();
    };
    let items = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };
    items
        .into_iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let mut action = serde_json::Map::new();
            if let Some(sym) = obj.get("symbol") {
                action.insert("symbol".into(), sym.clone());
            }
            if let Some(act) = obj.get("action").or_else(|| obj.get("signal")) {
                action.insert("action".into(), act.clone());
            }
            if let Some(conf) = obj.get("confidence") {
                action.insert("confidence".into(), conf.clone());
            }
            Some(action)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Decision;

    fn service() -> Service {
        Service::new(
            Arc::new(Database::in_memory().unwrap()),
            Arc::new(CacheStore::memory()),
            TtlSet::default(),
        )
    }

    fn open_event(trader: &str, symbol: &str, price: f64, size_usd: f64) -> PositionEvent {
        PositionEvent {
            kind: PositionEventKind::Open,
            trader_id: trader.into(),
            exchange: "sim".into(),
            decision: Decision {
                symbol: symbol.into(),
                action: "open_long".into(),
                leverage: 5,
                position_size_usd: size_usd,
                entry_price: price,
                confidence: 90,
                risk_usd: 10.0,
                ..Default::default()
            },
            fill_price: price,
            fill_size: size_usd / price,
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn open_close_round_trip_writes_trade() {
        let svc = service();
        svc.record_position_event(open_event("t1", "BTC", 100.0, 200.0)).await.unwrap();

        let positions = svc.db.active_positions_by_traders(&["t1".to_string()]).unwrap();
        assert_eq!(positions["t1"].len(), 1);
        assert_eq!(positions["t1"][0].quantity, 2.0);

        let mut close = open_event("t1", "BTC", 110.0, 200.0);
        close.kind = PositionEventKind::Close;
        close.decision.action = "close_long".into();
        close.fill_size = 2.0;
        svc.record_position_event(close).await.unwrap();

        let trades = svc.db.recent_trades("t1", 10).unwrap();
        assert_eq!(trades.len(), 1);
        // +1 * (110 - 100) * 2
        assert_eq!(trades[0].realized_net_pnl, Some(20.0));

        let cached: Option<HashMap<String, PositionCacheEntry>> = svc
            .cache
            .hash_get_json(&keys::trader_positions_hash_key(), "t1")
            .await
            .unwrap();
        assert!(cached.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn short_close_flips_pnl_sign() {
        let svc = service();
        let mut open = open_event("t1", "ETH", 100.0, 100.0);
        open.decision.action = "open_short".into();
        svc.record_position_event(open).await.unwrap();

        let mut close = open_event("t1", "ETH", 90.0, 100.0);
        close.kind = PositionEventKind::Close;
        close.decision.action = "close_short".into();
        close.fill_size = 1.0;
        svc.record_position_event(close).await.unwrap();

        let trades = svc.db.recent_trades("t1", 10).unwrap();
        // -1 * (90 - 100) * 1
        assert_eq!(trades[0].realized_net_pnl, Some(10.0));
    }

    #[tokio::test]
    async fn decision_cycle_replay_is_idempotent() {
        let svc = service();
        let mut cycle = CycleRecord::new("t1", Utc::now());
        cycle.cycle_number = 7;
        cycle.success = true;
        let event = DecisionCycleEvent { trader_id: "t1".into(), config_version: 2, cycle };
        svc.record_decision_cycle(event.clone()).await.unwrap();
        svc.record_decision_cycle(event).await.unwrap();

        let last = svc.db.last_decision("t1").unwrap().unwrap();
        assert_eq!(last.cycle_number, Some(7));
        assert_eq!(last.config_version, 2);
    }

    #[tokio::test]
    async fn recent_trades_cache_is_capped() {
        let svc = service();
        for i in 0..(RECENT_TRADES_LIMIT + 5) {
            svc.append_recent_trade(
                "t1",
                TradeCacheEntry {
                    trader_id: "t1".into(),
                    symbol: format!("S{}", i),
                    ..Default::default()
                },
            )
            .await;
        }
        let cached: Vec<TradeCacheEntry> = svc
            .cache
            .hash_get_json(&keys::trader_trades_recent_hash_key(), "t1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.len(), RECENT_TRADES_LIMIT);
        assert_eq!(cached[0].symbol, format!("S{}", RECENT_TRADES_LIMIT + 4));
    }

    #[tokio::test]
    async fn conversation_recorded_in_transaction() {
        let svc = service();
        let rec = ConversationRecord {
            trader_id: "t1".into(),
            topic: "decision".into(),
            prompt: "system prompt".into(),
            response: "assistant response".into(),
            model_name: "gpt-5".into(),
            prompt_tokens: 100,
            completion_tokens: 50,
            total_tokens: 150,
            timestamp: Utc::now(),
        };
        svc.record_conversation(rec).await.unwrap();
        assert_eq!(svc.db.conversation_message_count(1).unwrap(), 2);
    }

    #[tokio::test]
    async fn hydrate_skips_traders_without_rows() {
        let svc = service();
        svc.record_position_event(open_event("t1", "BTC", 100.0, 200.0)).await.unwrap();
        svc.hydrate_caches(&["t1".to_string(), "t2".to_string()]).await.unwrap();

        let t1: Option<HashMap<String, PositionCacheEntry>> = svc
            .cache
            .hash_get_json(&keys::trader_positions_hash_key(), "t1")
            .await
            .unwrap();
        assert_eq!(t1.unwrap().len(), 1);

        let t2: Option<HashMap<String, PositionCacheEntry>> = svc
            .cache
            .hash_get_json(&keys::trader_positions_hash_key(), "t2")
            .await
            .unwrap();
        assert!(t2.is_none());
    }
}
