use crate::exchange::AssetMeta;
use crate::market::Snapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Normalized view of an open position as shown to the LLM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    pub side: String,
    pub entry_price: f64,
    pub mark_price: f64,
    pub quantity: f64,
    pub leverage: u32,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
    pub liquidation_price: f64,
    pub margin_used: f64,
}

/// Account-level state summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountInfo {
    pub total_equity: f64,
    pub available_balance: f64,
    pub total_pnl: f64,
    pub total_pnl_pct: f64,
    pub margin_used: f64,
    pub margin_used_pct: f64,
    pub position_count: usize,
}

/// Pre-filtered candidate symbol with provenance labels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandidateCoin {
    pub symbol: String,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// Read-only performance summary provided by the manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceView {
    pub sharpe_ratio: f64,
    pub win_rate: f64,
    pub total_trades: u64,
    pub recent_trades_rate: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Aggregates all inputs required to form a decision.
#[derive(Debug, Clone, Default)]
pub struct DecisionContext {
    pub current_time: String,
    pub runtime_minutes: i64,
    pub call_count: u64,
    pub account: AccountInfo,
    pub positions: Vec<PositionInfo>,
    pub candidate_coins: Vec<CandidateCoin>,
    pub market_data: HashMap<String, Snapshot>,
    pub performance: Option<PerformanceView>,
    pub major_coin_leverage: u32,
    pub altcoin_leverage: u32,
    pub asset_meta: HashMap<String, AssetMeta>,
    // Per-trader risk guards injected by the manager.
    pub max_risk_pct: f64,
    pub max_position_size_usd: f64,
    // Primary guards, disabled when zero.
    pub liquidity_threshold_usd: f64,
    pub max_margin_usage_pct: f64,
    pub btc_eth_position_value_min_multiple: f64,
    pub btc_eth_position_value_max_multiple: f64,
    pub alt_position_value_min_multiple: f64,
    pub alt_position_value_max_multiple: f64,
    /// Last close time per symbol; opens inside the cooldown window are
    /// filtered out of the candidate set.
    pub recently_closed: HashMap<String, DateTime<Utc>>,
    pub cooldown_after_close: Duration,
}

/// Raw decision object as returned by the LLM under the structured-output
/// contract. `signal` is present in live output; replayed payloads may
/// carry a pre-normalised `action` instead.
#[derive(Debug, Clone, Deserialize)]
pub struct RawDecision {
    #[serde(default)]
    pub signal: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    pub symbol: String,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub leverage: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub position_size_usd: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub entry_price: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub stop_loss: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub take_profit: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub risk_usd: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub confidence: f64,
    #[serde(default)]
    pub invalidation_condition: String,
    #[serde(default)]
    pub reasoning: String,
}

/// A single normalised trading action.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub symbol: String,
    pub action: String,
    pub leverage: u32,
    pub position_size_usd: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub confidence: i32,
    pub risk_usd: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub invalidation_condition: String,
}

impl Decision {
    pub fn is_open(&self) -> bool {
        matches!(self.action.as_str(), "open_long" | "open_short")
    }

    pub fn is_close(&self) -> bool {
        matches!(self.action.as_str(), "close_long" | "close_short")
    }

    pub fn is_hold(&self) -> bool {
        self.action == "hold"
    }
}

/// The full response produced by the executor for one cycle.
#[derive(Debug, Clone)]
pub struct FullDecision {
    pub user_prompt: String,
    pub cot_trace: String,
    pub decisions: Vec<Decision>,
    /// The LLM's decisions JSON exactly as received, journaled for replay.
    pub raw_payload: String,
    pub timestamp: DateTime<Utc>,
}

/// Accepts numbers or numeric strings; nulls become zero.
fn flexible_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(coerce_f64(&value))
}

/// Best-effort numeric coercion used for replay of loosely typed payloads.
pub fn coerce_f64(value: &serde_json::Value) -> f64 {
    match value {
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        serde_json::Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_decision_accepts_numeric_strings() {
        let raw: RawDecision = serde_json::from_str(
            r#"{"signal":"buy_to_enter","symbol":"BTC","leverage":"5","position_size_usd":200,"entry_price":"100.5","confidence":90}"#,
        )
        .unwrap();
        assert_eq!(raw.leverage, 5.0);
        assert_eq!(raw.entry_price, 100.5);
        assert_eq!(raw.confidence, 90.0);
    }
}
