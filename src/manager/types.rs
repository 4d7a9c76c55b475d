use crate::errors::FleetError;
use crate::executor::Decision;
use crate::journal::CycleRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

/// Canonical registry key: trimmed, uppercase.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

/// Per-trader risk parameters. Immutable for the lifetime of one config
/// version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskParameters {
    pub max_positions: usize,
    pub max_position_size_usd: f64,
    pub max_margin_usage_pct: f64,
    pub major_coin_leverage: u32,
    pub altcoin_leverage: u32,
    pub min_risk_reward_ratio: f64,
    pub min_confidence: i32,
    #[serde(default)]
    pub stop_loss_enabled: bool,
    #[serde(default)]
    pub take_profit_enabled: bool,
    #[serde(default)]
    pub max_risk_pct: f64,
    #[serde(default)]
    pub liquidity_threshold_usd: f64,
    /// Position-value bands as equity multiples, by symbol class.
    /// Zero disables the bound.
    #[serde(default)]
    pub btc_eth_position_value_min_multiple: f64,
    #[serde(default)]
    pub btc_eth_position_value_max_multiple: f64,
    #[serde(default)]
    pub alt_position_value_min_multiple: f64,
    #[serde(default)]
    pub alt_position_value_max_multiple: f64,
    #[serde(default)]
    pub cooldown_after_close_secs: u64,
}

/// Immutable snapshot of one trader's configuration. Never mutated in
/// place: config sync inserts a new version row and the manager swaps the
/// in-memory copy atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub exchange_provider: String,
    pub market_provider: String,
    pub allocation_pct: f64,
    #[serde(default = "default_decision_interval_secs")]
    pub decision_interval_secs: u64,
    pub prompt_template: String,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub risk_params: RiskParameters,
}

fn default_decision_interval_secs() -> u64 {
    180
}

impl TraderConfig {
    pub fn decision_interval(&self) -> Duration {
        Duration::from_secs(self.decision_interval_secs.max(1))
    }
}

/// Manager-wide settings plus the trader roster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagerConfig {
    #[serde(default)]
    pub reserve_equity_pct: f64,
    #[serde(default)]
    pub max_concurrent_decisions: usize,
    #[serde(default)]
    pub traders: Vec<TraderConfig>,
}

impl ManagerConfig {
    /// Total allocation plus the manager reserve must not exceed 100%.
    pub fn validate(&self) -> Result<(), FleetError> {
        let total: f64 = self.traders.iter().map(|t| t.allocation_pct).sum();
        let max_allowed = 100.0 - self.reserve_equity_pct;
        if total > max_allowed + 1e-6 {
            return Err(FleetError::Config(format!(
                "trader allocation {:.2} exceeds budget {:.2} (reserve={:.2})",
                total, max_allowed, self.reserve_equity_pct
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for trader in &self.traders {
            if trader.id.trim().is_empty() {
                return Err(FleetError::Config("trader config missing id".into()));
            }
            if !seen.insert(trader.id.clone()) {
                return Err(FleetError::Config(format!("duplicate trader id {}", trader.id)));
            }
        }
        Ok(())
    }
}

/// A position owned by one virtual trader.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VirtualPosition {
    pub symbol: String,
    pub side: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub confidence: i32,
    pub risk_usd: f64,
    pub opened_at_ms: i64,
    pub exchange: String,
}

/// Share of account equity currently granted to one trader.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub current_equity_usd: f64,
    pub margin_used_usd: f64,
}

/// Mutable runtime state of one trader loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeState {
    pub running: bool,
    pub paused_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pause_reason: String,
    pub cycle_number: u64,
    pub last_decision_at: Option<DateTime<Utc>>,
    pub next_decision_at: Option<DateTime<Utc>>,
}

impl RuntimeState {
    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        match self.paused_until {
            Some(until) => now < until,
            None => false,
        }
    }
}

/// Runtime twin of a TraderConfig. Virtual positions live in the registry
/// so one lock covers the owner map and every trader's book.
pub struct VirtualTrader {
    pub id: String,
    pub config: RwLock<TraderConfig>,
    pub resource_alloc: RwLock<ResourceAllocation>,
    pub runtime: RwLock<RuntimeState>,
}

impl VirtualTrader {
    pub fn new(config: TraderConfig) -> Self {
        Self {
            id: config.id.clone(),
            config: RwLock::new(config),
            resource_alloc: RwLock::new(ResourceAllocation::default()),
            runtime: RwLock::new(RuntimeState::default()),
        }
    }
}

/// A trader-symbol window during which new opens are forbidden.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolCooldown {
    pub trader_id: String,
    pub symbol: String,
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub consecutive_losses: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionEventKind {
    Open,
    Close,
}

/// Position lifecycle notification emitted after a fill.
#[derive(Debug, Clone)]
pub struct PositionEvent {
    pub kind: PositionEventKind,
    pub trader_id: String,
    pub exchange: String,
    pub decision: Decision,
    pub fill_price: f64,
    pub fill_size: f64,
    pub occurred_at: DateTime<Utc>,
}

/// One journal cycle handed to persistence for mirroring.
#[derive(Debug, Clone)]
pub struct DecisionCycleEvent {
    pub trader_id: String,
    pub config_version: i64,
    pub cycle: CycleRecord,
}

/// Periodic equity metrics for one trader.
#[derive(Debug, Clone, Default)]
pub struct AccountSyncSnapshot {
    pub trader_id: String,
    pub equity_usd: f64,
    pub available_balance_usd: f64,
    pub unrealized_pnl_usd: f64,
    pub synced_at: Option<DateTime<Utc>>,
}

/// Performance metrics snapshot for analytics caches.
#[derive(Debug, Clone, Default)]
pub struct AnalyticsSnapshot {
    pub trader_id: String,
    pub total_pnl_usd: f64,
    pub total_pnl_pct: f64,
    pub sharpe_ratio: f64,
    pub win_rate: f64,
    pub total_trades: u64,
    pub max_drawdown_pct: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Runtime state mirror row.
#[derive(Debug, Clone, Default)]
pub struct RuntimeStateEvent {
    pub trader_id: String,
    pub active_config_version: i64,
    pub is_running: bool,
    pub state: RuntimeState,
}

/// Sink for manager events. The concrete implementation mirrors journal
/// cycles and position lifecycle to the database and refreshes caches.
/// Failures are logged by callers and never fail a cycle.
#[async_trait]
pub trait PersistenceService: Send + Sync {
    async fn record_position_event(&self, event: PositionEvent) -> Result<(), FleetError>;

    async fn record_decision_cycle(&self, record: DecisionCycleEvent) -> Result<(), FleetError>;

    async fn record_account_snapshot(
        &self,
        snapshot: AccountSyncSnapshot,
    ) -> Result<(), FleetError>;

    async fn record_analytics(&self, snapshot: AnalyticsSnapshot) -> Result<(), FleetError>;

    async fn upsert_runtime_state(&self, event: RuntimeStateEvent) -> Result<(), FleetError>;

    async fn record_cooldown(&self, cooldown: SymbolCooldown) -> Result<(), FleetError>;

    /// Active cooldown windows for one trader, keyed by symbol.
    async fn load_cooldowns(
        &self,
        trader_id: &str,
    ) -> Result<HashMap<String, DateTime<Utc>>, FleetError>;

    /// Reloads per-trader cache state on start.
    async fn hydrate_caches(&self, trader_ids: &[String]) -> Result<(), FleetError>;
}

/// Normalises, dedupes and sorts trader ids for hydration.
pub fn normalize_ids(ids: &[String]) -> Vec<String> {
    let mut set: Vec<String> = ids
        .iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect();
    set.sort();
    set.dedup();
    set
}

/// Symbol -> virtual position book for one trader.
pub type PositionBook = HashMap<String, VirtualPosition>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_normalisation() {
        assert_eq!(normalize_symbol("btc "), "BTC");
        assert_eq!(normalize_symbol("BTC"), "BTC");
    }

    #[test]
    fn allocation_budget_enforced() {
        let trader = |id: &str, pct: f64| TraderConfig {
            id: id.into(),
            name: String::new(),
            exchange_provider: "sim".into(),
            market_provider: "sim".into(),
            allocation_pct: pct,
            decision_interval_secs: 60,
            prompt_template: "prompt.tmpl".into(),
            auto_start: true,
            version: 1,
            risk_params: RiskParameters::default(),
        };
        let mut cfg = ManagerConfig {
            reserve_equity_pct: 20.0,
            max_concurrent_decisions: 0,
            traders: vec![trader("a", 40.0), trader("b", 40.0)],
        };
        assert!(cfg.validate().is_ok());
        cfg.traders.push(trader("c", 10.0));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn duplicate_ids_rejected() {
        let trader = TraderConfig {
            id: "a".into(),
            name: String::new(),
            exchange_provider: "sim".into(),
            market_provider: "sim".into(),
            allocation_pct: 10.0,
            decision_interval_secs: 60,
            prompt_template: "prompt.tmpl".into(),
            auto_start: true,
            version: 1,
            risk_params: RiskParameters::default(),
        };
        let cfg = ManagerConfig {
            reserve_equity_pct: 0.0,
            max_concurrent_decisions: 0,
            traders: vec![trader.clone(), trader],
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn id_normalisation_dedupes() {
        let ids = vec![" t1 ".to_string(), "t1".to_string(), String::new(), "a".to_string()];
        assert_eq!(normalize_ids(&ids), vec!["a".to_string(), "t1".to_string()]);
    }
}
