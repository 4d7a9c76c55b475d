//! Secondary risk guards, applied after the LLM returns a decision and
//! before any exchange order.

use super::types::{ResourceAllocation, RiskParameters};
use crate::errors::FleetError;
use crate::executor::Decision;

/// Re-validates one decision against the trader's risk parameters.
///
/// Close and hold decisions always pass: risk guards bound new exposure,
/// never prevent reducing it.
pub fn enforce_secondary_risk(
    decision: &Decision,
    risk: &RiskParameters,
    alloc: &ResourceAllocation,
    open_positions: usize,
) -> Result<(), FleetError> {
    if !decision.is_open() {
        return Ok(());
    }

    if risk.max_position_size_usd > 0.0 && decision.position_size_usd > risk.max_position_size_usd {
        return Err(FleetError::RiskViolation(format!(
            "{}: position size {:.2} exceeds cap {:.2}",
            decision.symbol, decision.position_size_usd, risk.max_position_size_usd
        )));
    }

    if risk.max_margin_usage_pct > 0.0 && decision.leverage > 0 {
        let projected =
            alloc.margin_used_usd + decision.position_size_usd / decision.leverage as f64;
        let limit = alloc.current_equity_usd * risk.max_margin_usage_pct / 100.0;
        if projected > limit {
            return Err(FleetError::RiskViolation(format!(
                "{}: projected margin {:.2} exceeds limit {:.2} ({:.0}% of {:.2})",
                decision.symbol,
                projected,
                limit,
                risk.max_margin_usage_pct,
                alloc.current_equity_usd
            )));
        }
    }

    if risk.max_positions > 0 && open_positions >= risk.max_positions {
        return Err(FleetError::RiskViolation(format!(
            "{}: open position count {} at limit {}",
            decision.symbol, open_positions, risk.max_positions
        )));
    }

    if risk.min_confidence > 0 && decision.confidence < risk.min_confidence {
        return Err(FleetError::RiskViolation(format!(
            "{}: confidence {} below minimum {}",
            decision.symbol, decision.confidence, risk.min_confidence
        )));
    }

    if risk.min_risk_reward_ratio > 0.0 {
        if let Some(rr) = risk_reward_ratio(decision) {
            if rr < risk.min_risk_reward_ratio {
                return Err(FleetError::RiskViolation(format!(
                    "{}: risk/reward {:.2} below minimum {:.2}",
                    decision.symbol, rr, risk.min_risk_reward_ratio
                )));
            }
        }
    }

    Ok(())
}

/// Direction-aware reward/risk ratio. None when stops are absent or the
/// denominator is non-positive.
fn risk_reward_ratio(decision: &Decision) -> Option<f64> {
    if decision.stop_loss <= 0.0 || decision.take_profit <= 0.0 || decision.entry_price <= 0.0 {
        return None;
    }
    let (reward, risk) = if decision.action == "open_short" {
        (
            decision.entry_price - decision.take_profit,
            decision.stop_loss - decision.entry_price,
        )
    } else {
        (
            decision.take_profit - decision.entry_price,
            decision.entry_price - decision.stop_loss,
        )
    };
    if risk <= 0.0 {
        return None;
    }
    Some(reward / risk)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn risk_params() -> RiskParameters {
        RiskParameters {
            max_positions: 4,
            max_position_size_usd: 500.0,
            max_margin_usage_pct: 30.0,
            min_risk_reward_ratio: 0.0,
            min_confidence: 0,
            ..Default::default()
        }
    }

    fn alloc() -> ResourceAllocation {
        ResourceAllocation { current_equity_usd: 1000.0, margin_used_usd: 200.0 }
    }

    fn open(symbol: &str, size: f64, leverage: u32) -> Decision {
        Decision {
            symbol: symbol.into(),
            action: "open_long".into(),
            leverage,
            position_size_usd: size,
            confidence: 90,
            ..Default::default()
        }
    }

    #[test]
    fn blocks_oversize_position() {
        let err = enforce_secondary_risk(&open("BTC", 600.0, 3), &risk_params(), &alloc(), 0)
            .unwrap_err();
        assert!(err.to_string().contains("exceeds cap"));
    }

    #[test]
    fn margin_projection_boundaries() {
        // 200 + 300/2 = 350 > 300 (30% of 1000): reject
        assert!(enforce_secondary_risk(&open("BTC", 300.0, 2), &risk_params(), &alloc(), 0)
            .is_err());
        // 200 + 200/4 = 250 <= 300: accept
        assert!(enforce_secondary_risk(&open("BTC", 200.0, 4), &risk_params(), &alloc(), 0)
            .is_ok());
    }

    #[test]
    fn blocks_position_count_at_limit() {
        assert!(enforce_secondary_risk(&open("BTC", 100.0, 5), &risk_params(), &alloc(), 4)
            .is_err());
    }

    #[test]
    fn blocks_low_confidence_and_poor_rr() {
        let mut params = risk_params();
        params.min_confidence = 75;
        params.min_risk_reward_ratio = 3.0;

        let mut decision = open("BTC", 100.0, 5);
        decision.confidence = 60;
        assert!(enforce_secondary_risk(&decision, &params, &alloc(), 0).is_err());

        decision.confidence = 90;
        decision.entry_price = 100.0;
        decision.stop_loss = 95.0;
        decision.take_profit = 110.0; // rr = 2.0
        assert!(enforce_secondary_risk(&decision, &params, &alloc(), 0).is_err());

        decision.take_profit = 115.0; // rr = 3.0
        assert!(enforce_secondary_risk(&decision, &params, &alloc(), 0).is_ok());
    }

    #[test]
    fn short_rr_is_direction_aware() {
        let mut params = risk_params();
        params.min_risk_reward_ratio = 2.0;
        let decision = Decision {
            symbol: "BTC".into(),
            action: "open_short".into(),
            leverage: 5,
            position_size_usd: 100.0,
            entry_price: 100.0,
            stop_loss: 105.0,
            take_profit: 88.0, // reward 12, risk 5
            confidence: 90,
            ..Default::default()
        };
        assert!(enforce_secondary_risk(&decision, &params, &alloc(), 0).is_ok());
    }

    #[test]
    fn closes_always_pass() {
        let decision = Decision {
            symbol: "BTC".into(),
            action: "close_long".into(),
            position_size_usd: 10_000.0,
            confidence: 0,
            ..Default::default()
        };
        assert!(enforce_secondary_risk(&decision, &risk_params(), &alloc(), 99).is_ok());
    }
}
