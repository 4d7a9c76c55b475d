//! Daily token/cost ceiling for LLM calls.
//!
//! The ledger resets lazily: whichever of `allow_attempt` or `record_usage`
//! first observes a new UTC date zeroes the counters before proceeding.

use crate::clock::{truncate_day, Clock, SystemClock};
use crate::errors::FleetError;
use crate::llm::config::BudgetConfig;
use crate::logger::{self, LogTag};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

/// Point-in-time view of the ledger returned from `record_usage`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BudgetSnapshot {
    pub used_tokens: i64,
    pub limit: i64,
    pub usage_pct: f64,
    pub used_cost_usd: f64,
    pub alert_threshold_pct: u32,
    pub alert_triggered: bool,
}

#[derive(Debug, Default)]
struct Ledger {
    used_tokens: i64,
    used_cost_usd: f64,
    period_start: Option<DateTime<Utc>>,
}

pub struct BudgetGuard {
    cfg: BudgetConfig,
    ledger: Mutex<Ledger>,
    clock: Arc<dyn Clock>,
}

impl BudgetGuard {
    /// Returns None when the budget is disabled (non-positive limit).
    pub fn new(cfg: &BudgetConfig) -> Option<Self> {
        Self::with_clock(cfg, Arc::new(SystemClock))
    }

    pub fn with_clock(cfg: &BudgetConfig, clock: Arc<dyn Clock>) -> Option<Self> {
        if cfg.daily_token_limit <= 0 {
            return None;
        }
        Some(Self {
            cfg: cfg.clone(),
            ledger: Mutex::new(Ledger::default()),
            clock,
        })
    }

    /// Consulted before an LLM call. Refuses only under strict enforcement
    /// once the period's tokens reach the limit.
    pub fn allow_attempt(&self) -> Result<(), FleetError> {
        let mut ledger = self.ledger.lock().unwrap();
        self.reset_if_needed(&mut ledger);
        if ledger.used_tokens >= self.cfg.daily_token_limit {
            if self.cfg.strict_enforcement {
                return Err(FleetError::BudgetExceeded);
            }
            logger::warn(
                LogTag::Budget,
                &format!(
                    "daily token limit reached ({}/{}), enforcement disabled",
                    ledger.used_tokens, self.cfg.daily_token_limit
                ),
            );
        }
        Ok(())
    }

    /// Accumulates tokens and USD cost. The snapshot reflects the ledger
    /// after the write; crossing the ceiling under strict mode returns
    /// `BudgetExceeded` alongside it.
    pub fn record_usage(
        &self,
        model: &str,
        tokens: i64,
    ) -> (BudgetSnapshot, Result<(), FleetError>) {
        if tokens <= 0 {
            return (BudgetSnapshot::default(), Ok(()));
        }
        let mut ledger = self.ledger.lock().unwrap();
        self.reset_if_needed(&mut ledger);

        let limit = self.cfg.daily_token_limit;
        let new_total = ledger.used_tokens + tokens;
        let usage_pct = percentage(new_total, limit);
        ledger.used_tokens = new_total;
        ledger.used_cost_usd += tokens as f64 / 1_000_000.0 * self.cost_rate(model);

        let snapshot = BudgetSnapshot {
            used_tokens: ledger.used_tokens,
            limit,
            usage_pct,
            used_cost_usd: ledger.used_cost_usd,
            alert_threshold_pct: self.cfg.alert_threshold_pct,
            alert_triggered: self.cfg.alert_threshold_pct > 0
                && usage_pct >= self.cfg.alert_threshold_pct as f64,
        };
        if snapshot.alert_triggered {
            logger::warn(
                LogTag::Budget,
                &format!(
                    "token usage at {:.1}% of daily limit ({} / {})",
                    snapshot.usage_pct, snapshot.used_tokens, limit
                ),
            );
        }

        if new_total > limit && self.cfg.strict_enforcement {
            return (snapshot, Err(FleetError::BudgetExceeded));
        }
        (snapshot, Ok(()))
    }

    fn reset_if_needed(&self, ledger: &mut Ledger) {
        let current_period = truncate_day(self.clock.now_utc());
        if ledger.period_start != Some(current_period) {
            ledger.period_start = Some(current_period);
            ledger.used_tokens = 0;
            ledger.used_cost_usd = 0.0;
        }
    }

    fn cost_rate(&self, model: &str) -> f64 {
        if let Some(rate) = self.cfg.cost_per_million_tokens.get(model) {
            return *rate;
        }
        let key = model.trim().to_lowercase();
        self.cfg.cost_per_million_tokens.get(&key).copied().unwrap_or(0.0)
    }
}

fn percentage(value: i64, limit: i64) -> f64 {
    if limit <= 0 {
        return 0.0;
    }
    (value as f64 / limit as f64 * 100.0).min(100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn guard_with_clock(clock: ManualClock) -> BudgetGuard {
        let cfg = BudgetConfig {
            daily_token_limit: 1000,
            alert_threshold_pct: 80,
            strict_enforcement: true,
            cost_per_million_tokens: HashMap::from([("gpt-5".to_string(), 20.0)]),
        };
        BudgetGuard::with_clock(&cfg, Arc::new(clock)).expect("guard enabled")
    }

    #[test]
    fn record_usage_alerts_and_enforces() {
        let start = Utc.with_ymd_and_hms(2025, 11, 8, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let guard = guard_with_clock(clock.clone());

        assert!(guard.allow_attempt().is_ok());

        let (snapshot, res) = guard.record_usage("gpt-5", 600);
        assert!(res.is_ok());
        assert!(!snapshot.alert_triggered);

        let (snapshot, res) = guard.record_usage("gpt-5", 300);
        assert!(res.is_ok());
        assert!(snapshot.alert_triggered);
        assert!((snapshot.usage_pct - 90.0).abs() < 0.001);
        assert!(snapshot.used_cost_usd > 0.0);

        let (snapshot, res) = guard.record_usage("gpt-5", 200);
        assert!(matches!(res, Err(FleetError::BudgetExceeded)));
        assert_eq!(snapshot.used_tokens, 1100);

        assert!(matches!(guard.allow_attempt(), Err(FleetError::BudgetExceeded)));

        // roll clock forward to next day, counters reset
        clock.advance(chrono::Duration::hours(24));
        assert!(guard.allow_attempt().is_ok());
        let (snapshot, res) = guard.record_usage("gpt-5", 100);
        assert!(res.is_ok());
        assert_eq!(snapshot.used_tokens, 100);
    }

    #[test]
    fn exactly_at_limit_refuses_under_strict() {
        let start = Utc.with_ymd_and_hms(2025, 11, 8, 0, 0, 0).unwrap();
        let guard = guard_with_clock(ManualClock::new(start));
        let (_, res) = guard.record_usage("gpt-5", 1000);
        assert!(res.is_ok(), "reaching the limit exactly is not a crossing");
        assert!(matches!(guard.allow_attempt(), Err(FleetError::BudgetExceeded)));
    }

    #[test]
    fn disabled_budget_returns_none() {
        let cfg = BudgetConfig {
            daily_token_limit: 0,
            alert_threshold_pct: 80,
            strict_enforcement: true,
            cost_per_million_tokens: HashMap::new(),
        };
        assert!(BudgetGuard::new(&cfg).is_none());
    }

    #[test]
    fn lenient_mode_logs_only() {
        let start = Utc.with_ymd_and_hms(2025, 11, 8, 0, 0, 0).unwrap();
        let cfg = BudgetConfig {
            daily_token_limit: 100,
            alert_threshold_pct: 80,
            strict_enforcement: false,
            cost_per_million_tokens: HashMap::new(),
        };
        let guard = BudgetGuard::with_clock(&cfg, Arc::new(ManualClock::new(start))).unwrap();
        let (_, res) = guard.record_usage("gpt-5", 150);
        assert!(res.is_ok());
        assert!(guard.allow_attempt().is_ok());
    }
}
