//! Exchange-agnostic order and position types plus the provider trait.
//!
//! Prices and sizes travel as strings to avoid precision loss on the wire;
//! parsing happens once at the consumption boundary.

pub mod sim;

pub use sim::SimProvider;

use crate::errors::FleetError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Time-in-force for limit orders. Decision orders always use `Ioc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    #[serde(rename = "Ioc")]
    Ioc,
    #[serde(rename = "Gtc")]
    Gtc,
    #[serde(rename = "Alo")]
    Alo,
}

/// Normalized order request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub symbol: String,
    pub is_buy: bool,
    pub limit_px: String,
    pub sz: String,
    pub reduce_only: bool,
    pub tif: TimeInForce,
}

impl Order {
    pub fn ioc_limit(symbol: &str, is_buy: bool, price: f64, size: f64, reduce_only: bool) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            is_buy,
            limit_px: format_decimal(price),
            sz: format_decimal(size),
            reduce_only,
            tif: TimeInForce::Ioc,
        }
    }

    pub fn price(&self) -> f64 {
        self.limit_px.parse().unwrap_or(0.0)
    }

    pub fn size(&self) -> f64 {
        self.sz.parse().unwrap_or(0.0)
    }
}

/// Fill details for a matched order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub avg_px: String,
    pub total_sz: String,
}

impl OrderFill {
    pub fn avg_price(&self) -> f64 {
        self.avg_px.parse().unwrap_or(0.0)
    }

    pub fn total_size(&self) -> f64 {
        self.total_sz.parse().unwrap_or(0.0)
    }
}

/// Outcome of a single order submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrderStatus {
    Filled(OrderFill),
    Resting { oid: i64 },
    Rejected(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub status: OrderStatus,
}

impl OrderResponse {
    pub fn fill(&self) -> Option<&OrderFill> {
        match &self.status {
            OrderStatus::Filled(fill) => Some(fill),
            _ => None,
        }
    }
}

/// Live position as reported by the exchange.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub leverage: f64,
    pub unrealized_pnl: f64,
    pub liquidation_price: f64,
    pub margin_used: f64,
}

/// Account-level margin summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub total_equity: f64,
    pub available_balance: f64,
    pub margin_used: f64,
    pub unrealized_pnl: f64,
}

/// Per-asset constraints used during decision normalisation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AssetMeta {
    pub max_leverage: f64,
    pub precision: u32,
    pub only_isolated: bool,
}

#[async_trait]
pub trait ExchangeProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn submit_order(&self, order: &Order) -> Result<OrderResponse, FleetError>;

    async fn positions(&self) -> Result<Vec<ExchangePosition>, FleetError>;

    async fn account(&self) -> Result<AccountSnapshot, FleetError>;

    async fn asset_meta(&self, symbol: &str) -> Result<Option<AssetMeta>, FleetError>;
}

pub fn format_decimal(v: f64) -> String {
    format!("{:.8}", v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_round_trips_price_and_size() {
        let order = Order::ioc_limit("btc", true, 100.5, 2.0, false);
        assert_eq!(order.symbol, "BTC");
        assert!((order.price() - 100.5).abs() < 1e-9);
        assert!((order.size() - 2.0).abs() < 1e-9);
        assert_eq!(order.tif, TimeInForce::Ioc);
    }
}
