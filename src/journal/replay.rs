//! Reconstruction of executor inputs from stored cycle records.

use crate::executor::types::coerce_f64;
use crate::executor::{
    parse_raw_decisions, AccountInfo, CandidateCoin, DecisionContext, ExecutorConfig,
    PositionInfo, RawDecision,
};
use crate::errors::FleetError;
use crate::journal::CycleRecord;
use crate::market::{ChangeInfo, FundingInfo, OpenInterestInfo, PriceInfo, Snapshot};
use chrono::SecondsFormat;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Converts stored decisions JSON back into raw decision objects.
pub fn parse_decisions_json(payload: &str) -> Result<Vec<RawDecision>, FleetError> {
    parse_raw_decisions(payload)
}

/// Rebuilds an executor context from a stored cycle record.
pub fn build_executor_context(cfg: &ExecutorConfig, rec: &CycleRecord) -> DecisionContext {
    let mut ctx = DecisionContext::default();
    ctx.current_time = rec.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true);
    ctx.major_coin_leverage = cfg.major_coin_leverage;
    ctx.altcoin_leverage = cfg.altcoin_leverage;
    ctx.account = map_account_info(&rec.account);
    ctx.positions = map_positions(&rec.positions);
    ctx.account.position_count = ctx.positions.len();
    ctx.candidate_coins = map_candidates(&rec.candidates);
    ctx.market_data = map_market_digest(&rec.market_digest);
    ctx
}

fn map_account_info(data: &Map<String, Value>) -> AccountInfo {
    AccountInfo {
        total_equity: field(data, "equity"),
        available_balance: field(data, "available"),
        margin_used: field(data, "used_margin"),
        margin_used_pct: field(data, "used_pct"),
        position_count: field(data, "positions") as usize,
        ..Default::default()
    }
}

fn map_positions(raw: &[Map<String, Value>]) -> Vec<PositionInfo> {
    raw.iter()
        .map(|item| PositionInfo {
            symbol: str_field(item, "symbol"),
            side: str_field(item, "side").to_lowercase(),
            quantity: field(item, "qty"),
            leverage: field(item, "lev") as u32,
            entry_price: field(item, "entry"),
            mark_price: field(item, "mark"),
            unrealized_pnl: field(item, "upnl"),
            liquidation_price: field(item, "liq"),
            ..Default::default()
        })
        .collect()
}

fn map_candidates(raw: &[String]) -> Vec<CandidateCoin> {
    raw.iter()
        .filter_map(|sym| {
            let sym = sym.trim().to_uppercase();
            if sym.is_empty() {
                None
            } else {
                Some(CandidateCoin { symbol: sym, sources: Vec::new() })
            }
        })
        .collect()
}

fn map_market_digest(raw: &Map<String, Value>) -> HashMap<String, Snapshot> {
    let mut out = HashMap::with_capacity(raw.len());
    for (sym, payload) in raw {
        let sym = sym.to_uppercase();
        let mp = payload.as_object().cloned().unwrap_or_default();
        let mut snap = Snapshot {
            symbol: sym.clone(),
            price: PriceInfo { last: field(&mp, "price") },
            change: ChangeInfo {
                one_hour: field(&mp, "chg1h"),
                four_hour: field(&mp, "chg4h"),
            },
            open_interest: None,
            funding: None,
        };
        let oi = field(&mp, "oi_latest");
        if oi != 0.0 {
            snap.open_interest = Some(OpenInterestInfo { latest: oi, average: 0.0 });
        }
        let funding = field(&mp, "funding");
        if funding != 0.0 {
            snap.funding = Some(FundingInfo { rate: funding });
        }
        out.insert(sym, snap);
    }
    out
}

fn field(data: &Map<String, Value>, key: &str) -> f64 {
    data.get(key).map(coerce_f64).unwrap_or(0.0)
}

fn str_field(data: &Map<String, Value>, key: &str) -> String {
    match data.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn rebuilds_context_from_record() {
        let mut rec = CycleRecord::new("t1", Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        rec.account = json!({"equity": 1000.0, "available": 800.0, "used_margin": 200.0, "used_pct": 20.0})
            .as_object()
            .unwrap()
            .clone();
        rec.positions = vec![json!({"symbol":"BTC","side":"LONG","qty":2.0,"lev":5,"entry":100.0,"mark":101.0,"upnl":2.0})
            .as_object()
            .unwrap()
            .clone()];
        rec.candidates = vec!["eth".into(), "".into()];
        rec.market_digest = json!({"BTC": {"price": 101.0, "chg1h": 0.5, "chg4h": -1.0, "oi_latest": 5000.0}})
            .as_object()
            .unwrap()
            .clone();

        let cfg = ExecutorConfig::default();
        let ctx = build_executor_context(&cfg, &rec);
        assert_eq!(ctx.account.total_equity, 1000.0);
        assert_eq!(ctx.account.position_count, 1);
        assert_eq!(ctx.positions[0].side, "long");
        assert_eq!(ctx.candidate_coins.len(), 1);
        assert_eq!(ctx.candidate_coins[0].symbol, "ETH");
        let snap = &ctx.market_data["BTC"];
        assert_eq!(snap.price.last, 101.0);
        assert!(snap.open_interest.is_some());
        assert!(snap.funding.is_none());
    }
}
