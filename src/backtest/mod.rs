//! Journal-driven backtest replay.
//!
//! Replays recorded cycles for one symbol against the sim exchange:
//! each cycle's market digest supplies the price, its decisions become IOC
//! limit orders, and closes realise PnL at the decided price.

use crate::errors::FleetError;
use crate::exchange::{ExchangeProvider, Order, SimProvider};
use crate::executor::types::coerce_f64;
use crate::journal::{replay::parse_decisions_json, CycleRecord};
use crate::manager::normalize_symbol;

/// Aggregate outcome of one replay run.
#[derive(Debug, Clone, Default)]
pub struct ReplayResult {
    pub trades: u64,
    pub wins: u64,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub final_equity: f64,
}

/// Replays recorded journal cycles for a single symbol.
pub async fn run_journal_replay(
    records: &[CycleRecord],
    symbol: &str,
    initial_equity: f64,
) -> Result<ReplayResult, FleetError> {
    if records.is_empty() {
        return Err(FleetError::Config("no journal cycles provided".into()));
    }
    let symbol = normalize_symbol(symbol);
    if symbol.is_empty() {
        return Err(FleetError::Config("symbol is required for replay".into()));
    }

    let provider = SimProvider::new(initial_equity);
    let mut result = ReplayResult { final_equity: initial_equity, ..Default::default() };

    for record in records {
        let digest_price = record
            .market_digest
            .get(&symbol)
            .and_then(|v| v.as_object())
            .and_then(|m| m.get("price"))
            .map(coerce_f64)
            .unwrap_or(0.0);

        let decisions = parse_decisions_json(&record.decisions_json)?;
        for raw in &decisions {
            if !normalize_symbol(&raw.symbol).eq(&symbol) {
                continue;
            }
            let action = raw
                .action
                .clone()
                .or_else(|| raw.signal.clone().map(map_signal))
                .unwrap_or_default()
                .to_lowercase();
            let Some(order) = decision_to_order(&symbol, &action, raw.entry_price, raw.position_size_usd, digest_price)
            else {
                continue;
            };

            let reduce_only = order.reduce_only;
            let equity_before = provider.equity();
            let response = provider.submit_order(&order).await?;
            if response.fill().is_none() {
                continue;
            }
            if reduce_only {
                let pnl = provider.equity() - equity_before;
                result.trades += 1;
                if pnl > 0.0 {
                    result.wins += 1;
                }
                result.total_pnl += pnl;
            }
        }
    }

    result.final_equity = provider.equity();
    if result.trades > 0 {
        result.win_rate = result.wins as f64 / result.trades as f64;
    }
    Ok(result)
}

fn map_signal(signal: String) -> String {
    match signal.trim().to_lowercase().as_str() {
        "buy_to_enter" => "open_long".into(),
        "sell_to_enter" => "open_short".into(),
        "close" => "close_long".into(),
        other => other.to_string(),
    }
}

fn decision_to_order(
    symbol: &str,
    action: &str,
    entry_price: f64,
    notional: f64,
    fallback_price: f64,
) -> Option<Order> {
    let price = if fallback_price > 0.0 { fallback_price } else { entry_price };
    if price <= 0.0 || notional <= 0.0 {
        return None;
    }
    let qty = notional / price;
    if qty <= 0.0 {
        return None;
    }
    let (is_buy, reduce_only) = match action {
        "open_long" => (true, false),
        "open_short" => (false, false),
        "close_long" => (false, true),
        "close_short" => (true, true),
        _ => return None,
    };
    Some(Order::ioc_limit(symbol, is_buy, price, qty, reduce_only))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn record(price: f64, decisions: serde_json::Value) -> CycleRecord {
        let mut rec = CycleRecord::new("t1", Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        rec.market_digest = json!({"BTC": {"price": price}}).as_object().unwrap().clone();
        rec.decisions_json = decisions.to_string();
        rec
    }

    #[tokio::test]
    async fn open_then_close_counts_one_winning_trade() {
        let records = vec![
            record(
                100.0,
                json!([{"signal":"buy_to_enter","symbol":"BTC","position_size_usd":200.0,"entry_price":100.0}]),
            ),
            record(
                110.0,
                json!([{"signal":"close","symbol":"BTC","position_size_usd":200.0,"entry_price":110.0}]),
            ),
        ];
        let result = run_journal_replay(&records, "btc", 1000.0).await.unwrap();
        assert_eq!(result.trades, 1);
        assert_eq!(result.wins, 1);
        // close size is notional/price, so 200/110 BTC of the 2 BTC book
        let expected = (110.0 - 100.0) * (200.0 / 110.0);
        assert!((result.total_pnl - expected).abs() < 1e-9);
        assert!((result.final_equity - (1000.0 + expected)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn other_symbols_are_ignored() {
        let records = vec![record(
            100.0,
            json!([{"signal":"buy_to_enter","symbol":"ETH","position_size_usd":200.0,"entry_price":100.0}]),
        )];
        let result = run_journal_replay(&records, "BTC", 1000.0).await.unwrap();
        assert_eq!(result.trades, 0);
        assert_eq!(result.final_equity, 1000.0);
    }

    #[tokio::test]
    async fn empty_records_error() {
        assert!(run_journal_replay(&[], "BTC", 1000.0).await.is_err());
    }
}
