//! In-memory exchange used by the backtest replay engine and tests.
//!
//! Every IOC limit order fills immediately at its limit price. Position and
//! margin tracking stay simple: one net position per symbol.

use super::{
    AccountSnapshot, AssetMeta, ExchangePosition, ExchangeProvider, Order, OrderFill,
    OrderResponse, OrderStatus,
};
use crate::errors::FleetError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct SimPosition {
    quantity: f64,
    entry_price: f64,
    is_long: bool,
}

#[derive(Debug, Default)]
struct SimState {
    equity: f64,
    positions: HashMap<String, SimPosition>,
    fills: u64,
}

pub struct SimProvider {
    state: Mutex<SimState>,
    default_max_leverage: f64,
}

impl SimProvider {
    pub fn new(initial_equity: f64) -> Self {
        Self {
            state: Mutex::new(SimState {
                equity: initial_equity,
                positions: HashMap::new(),
                fills: 0,
            }),
            default_max_leverage: 50.0,
        }
    }

    pub fn equity(&self) -> f64 {
        self.state.lock().unwrap().equity
    }

    pub fn fill_count(&self) -> u64 {
        self.state.lock().unwrap().fills
    }

    fn apply_fill(&self, order: &Order) -> OrderResponse {
        let price = order.price();
        let size = order.size();
        let mut state = self.state.lock().unwrap();
        state.fills += 1;
        let symbol = order.symbol.clone();

        if order.reduce_only {
            if let Some(pos) = state.positions.remove(&symbol) {
                let closed = pos.quantity.min(size);
                let sign = if pos.is_long { 1.0 } else { -1.0 };
                state.equity += sign * (price - pos.entry_price) * closed;
                let remaining = pos.quantity - closed;
                if remaining > 1e-12 {
                    state
                        .positions
                        .insert(symbol, SimPosition { quantity: remaining, ..pos });
                }
            }
        } else {
            state.positions.insert(
                symbol,
                SimPosition { quantity: size, entry_price: price, is_long: order.is_buy },
            );
        }

        OrderResponse {
            status: OrderStatus::Filled(OrderFill {
                avg_px: order.limit_px.clone(),
                total_sz: order.sz.clone(),
            }),
        }
    }
}

#[async_trait]
impl ExchangeProvider for SimProvider {
    fn name(&self) -> &str {
        "sim"
    }

    async fn submit_order(&self, order: &Order) -> Result<OrderResponse, FleetError> {
        if order.price() <= 0.0 || order.size() <= 0.0 {
            return Ok(OrderResponse {
                status: OrderStatus::Rejected("non-positive price or size".into()),
            });
        }
        Ok(self.apply_fill(order))
    }

    async fn positions(&self) -> Result<Vec<ExchangePosition>, FleetError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .positions
            .iter()
            .map(|(symbol, pos)| ExchangePosition {
                symbol: symbol.clone(),
                side: if pos.is_long { "long".into() } else { "short".into() },
                quantity: pos.quantity,
                entry_price: pos.entry_price,
                mark_price: pos.entry_price,
                ..Default::default()
            })
            .collect())
    }

    async fn account(&self) -> Result<AccountSnapshot, FleetError> {
        let state = self.state.lock().unwrap();
        Ok(AccountSnapshot {
            total_equity: state.equity,
            available_balance: state.equity,
            ..Default::default()
        })
    }

    async fn asset_meta(&self, _symbol: &str) -> Result<Option<AssetMeta>, FleetError> {
        Ok(Some(AssetMeta {
            max_leverage: self.default_max_leverage,
            precision: 8,
            only_isolated: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_then_close_realizes_pnl() {
        let sim = SimProvider::new(1000.0);
        let open = Order::ioc_limit("BTC", true, 100.0, 2.0, false);
        sim.submit_order(&open).await.unwrap();
        assert_eq!(sim.positions().await.unwrap().len(), 1);

        let close = Order::ioc_limit("BTC", false, 110.0, 2.0, true);
        sim.submit_order(&close).await.unwrap();
        assert!(sim.positions().await.unwrap().is_empty());
        assert!((sim.equity() - 1020.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rejects_zero_size() {
        let sim = SimProvider::new(1000.0);
        let order = Order::ioc_limit("BTC", true, 100.0, 0.0, false);
        let resp = sim.submit_order(&order).await.unwrap();
        assert!(matches!(resp.status, OrderStatus::Rejected(_)));
    }
}
