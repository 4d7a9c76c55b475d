//! Typed row views and canonical detail JSON structs.
//!
//! Detail columns always marshal through these fixed structs so the
//! on-disk JSON stays byte-stable; payloads never round-trip through an
//! untyped map. Nullable numeric columns surface as `Option<f64>`: a zero
//! becomes "absent" only at this boundary, never inside business logic.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionEntryDetail {
    pub price: f64,
    pub quantity: f64,
    pub time_ms: i64,
    pub leverage: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionExchangeDetail {
    pub provider: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionRiskDetail {
    pub confidence: f64,
    pub risk_usd: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionCloseDetail {
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub time_ms: i64,
    #[serde(default)]
    pub quantity: f64,
    #[serde(default)]
    pub pnl: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionMetricsDetail {
    #[serde(default)]
    pub unrealized_pnl: f64,
}

/// Canonical JSON stored in `positions.detail`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionDetail {
    pub entry: PositionEntryDetail,
    pub exchange: PositionExchangeDetail,
    pub risk: PositionRiskDetail,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close: Option<PositionCloseDetail>,
    #[serde(default)]
    pub metrics: PositionMetricsDetail,
}

impl PositionDetail {
    pub fn decode(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self::default();
        }
        serde_json::from_str(raw).unwrap_or_default()
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeTimeDetail {
    pub open_ts_ms: i64,
    pub close_ts_ms: i64,
    pub duration_seconds: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradePricesDetail {
    pub entry: f64,
    pub exit: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeQuantityDetail {
    pub total: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeRiskDetail {
    pub confidence: f64,
    pub leverage: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradePnlDetail {
    pub net: f64,
}

/// Canonical JSON stored in `trades.detail`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeDetail {
    pub time: TradeTimeDetail,
    pub prices: TradePricesDetail,
    pub quantity: TradeQuantityDetail,
    pub risk: TradeRiskDetail,
    pub exchange: PositionExchangeDetail,
    pub pnl: TradePnlDetail,
}

impl TradeDetail {
    pub fn decode(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self::default();
        }
        serde_json::from_str(raw).unwrap_or_default()
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Raw row in the positions table.
#[derive(Debug, Clone, Default)]
pub struct PositionRow {
    pub id: String,
    pub trader_id: String,
    pub symbol: String,
    pub side: String,
    pub status: String,
    pub detail: String,
}

/// Nullable-safe view of a position row with the detail unpacked.
#[derive(Debug, Clone, Default)]
pub struct PositionRecord {
    pub id: String,
    pub trader_id: String,
    pub exchange_provider: String,
    pub symbol: String,
    pub side: String,
    pub status: String,
    pub entry_time_ms: i64,
    pub entry_price: f64,
    pub quantity: f64,
    pub leverage: Option<f64>,
    pub confidence: Option<f64>,
    pub risk_usd: Option<f64>,
    pub unrealized_pnl: Option<f64>,
}

impl PositionRecord {
    pub fn from_row(row: &PositionRow) -> Self {
        let detail = PositionDetail::decode(&row.detail);
        Self {
            id: row.id.clone(),
            trader_id: row.trader_id.clone(),
            exchange_provider: detail.exchange.provider.clone(),
            symbol: row.symbol.clone(),
            side: row.side.clone(),
            status: row.status.clone(),
            entry_time_ms: detail.entry.time_ms,
            entry_price: detail.entry.price,
            quantity: detail.entry.quantity,
            leverage: optional(detail.entry.leverage),
            confidence: optional(detail.risk.confidence),
            risk_usd: optional(detail.risk.risk_usd),
            unrealized_pnl: optional(detail.metrics.unrealized_pnl),
        }
    }
}

/// Raw row in the trades table.
#[derive(Debug, Clone, Default)]
pub struct TradeRow {
    pub id: String,
    pub trader_id: String,
    pub symbol: String,
    pub side: String,
    pub close_ts_ms: i64,
    pub detail: String,
}

/// Nullable-safe view of a trade row.
#[derive(Debug, Clone, Default)]
pub struct TradeRecord {
    pub id: String,
    pub trader_id: String,
    pub exchange_provider: String,
    pub symbol: String,
    pub side: String,
    pub quantity: Option<f64>,
    pub leverage: Option<f64>,
    pub confidence: Option<f64>,
    pub entry_price: Option<f64>,
    pub entry_ts_ms: i64,
    pub exit_price: Option<f64>,
    pub exit_ts_ms: Option<i64>,
    pub realized_net_pnl: Option<f64>,
}

impl TradeRecord {
    pub fn from_row(row: &TradeRow) -> Self {
        let detail = TradeDetail::decode(&row.detail);
        Self {
            id: row.id.clone(),
            trader_id: row.trader_id.clone(),
            exchange_provider: detail.exchange.provider.clone(),
            symbol: row.symbol.clone(),
            side: row.side.clone(),
            quantity: optional(detail.quantity.total),
            leverage: optional(detail.risk.leverage),
            confidence: optional(detail.risk.confidence),
            entry_price: optional(detail.prices.entry),
            entry_ts_ms: detail.time.open_ts_ms,
            exit_price: optional(detail.prices.exit),
            exit_ts_ms: if row.close_ts_ms > 0 { Some(row.close_ts_ms) } else { None },
            realized_net_pnl: optional(detail.pnl.net),
        }
    }
}

/// Row in the trader_config table.
#[derive(Debug, Clone, Default)]
pub struct TraderConfigRow {
    pub id: String,
    pub version: i64,
    pub exchange_provider: String,
    pub market_provider: String,
    pub allocation_pct: f64,
    pub detail: String,
    pub created_by: Option<String>,
}

/// Row in the trader_config_history table.
#[derive(Debug, Clone, Default)]
pub struct TraderConfigHistoryRow {
    pub trader_id: String,
    pub version: i64,
    pub config_snapshot: String,
    pub changed_fields: Vec<String>,
    pub change_reason: Option<String>,
    pub changed_by: Option<String>,
    pub changed_at: String,
}

/// Row in the decision_cycles table.
#[derive(Debug, Clone, Default)]
pub struct DecisionCycleRow {
    pub trader_id: String,
    pub cycle_number: Option<u64>,
    pub config_version: i64,
    pub success: bool,
    pub prompt_digest: Option<String>,
    pub cot_trace: Option<String>,
    pub decisions: Option<String>,
    pub error_message: Option<String>,
    pub executed_at: String,
}

fn optional(value: f64) -> Option<f64> {
    if value == 0.0 {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_detail_round_trip_is_stable() {
        let detail = PositionDetail {
            entry: PositionEntryDetail { price: 100.0, quantity: 2.0, time_ms: 123, leverage: 5.0 },
            exchange: PositionExchangeDetail { provider: "sim".into() },
            risk: PositionRiskDetail { confidence: 90.0, risk_usd: 10.0 },
            close: None,
            metrics: PositionMetricsDetail::default(),
        };
        let encoded = detail.encode();
        let decoded = PositionDetail::decode(&encoded);
        assert_eq!(decoded.encode(), encoded);
    }

    #[test]
    fn record_exposes_risk_and_unrealized_distinctly() {
        let mut detail = PositionDetail::default();
        detail.risk.risk_usd = 10.0;
        detail.metrics.unrealized_pnl = -3.5;
        let row = PositionRow {
            id: "t1|BTC".into(),
            trader_id: "t1".into(),
            symbol: "BTC".into(),
            side: "long".into(),
            status: "open".into(),
            detail: detail.encode(),
        };
        let rec = PositionRecord::from_row(&row);
        assert_eq!(rec.risk_usd, Some(10.0));
        assert_eq!(rec.unrealized_pnl, Some(-3.5));
    }

    #[test]
    fn zero_numeric_columns_become_absent() {
        let row = PositionRow { detail: PositionDetail::default().encode(), ..Default::default() };
        let rec = PositionRecord::from_row(&row);
        assert!(rec.leverage.is_none());
        assert!(rec.confidence.is_none());
    }
}
