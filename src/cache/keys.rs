//! Cache key layout.
//!
//! Per-aspect hash keys with the trader id as field, so one HGETALL serves
//! a whole leaderboard page. TTLs are configured per aspect and default to
//! one minute.

use serde::{Deserialize, Serialize};
use std::time::Duration;

const KEY_PREFIX: &str = "fleet";

pub const DEFAULT_CACHE_TTL_SECS: u64 = 60;

pub fn trader_positions_hash_key() -> String {
    format!("{}:trader:positions", KEY_PREFIX)
}

pub fn trader_trades_recent_hash_key() -> String {
    format!("{}:trader:trades_recent", KEY_PREFIX)
}

pub fn trader_analytics_hash_key() -> String {
    format!("{}:trader:analytics", KEY_PREFIX)
}

pub fn trader_since_inception_hash_key() -> String {
    format!("{}:trader:since_inception", KEY_PREFIX)
}

pub fn trader_decision_last_hash_key() -> String {
    format!("{}:trader:decision_last", KEY_PREFIX)
}

pub fn leaderboard_zset_key() -> String {
    format!("{}:leaderboard", KEY_PREFIX)
}

pub fn conversations_key(trader_id: &str) -> String {
    format!("{}:trader:conversations:{}", KEY_PREFIX, trader_id.trim())
}

/// Hash field for one trader.
pub fn trader_hash_field(trader_id: &str) -> String {
    trader_id.trim().to_string()
}

/// Per-aspect TTLs, in seconds in the config file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TtlSet {
    #[serde(default = "default_ttl_secs")]
    pub positions_secs: u64,
    #[serde(default = "default_ttl_secs")]
    pub trades_recent_secs: u64,
    #[serde(default = "default_ttl_secs")]
    pub analytics_secs: u64,
    #[serde(default = "default_ttl_secs")]
    pub since_inception_secs: u64,
    #[serde(default = "default_ttl_secs")]
    pub decision_last_secs: u64,
    #[serde(default = "default_ttl_secs")]
    pub conversations_secs: u64,
}

fn default_ttl_secs() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}

impl Default for TtlSet {
    fn default() -> Self {
        Self {
            positions_secs: DEFAULT_CACHE_TTL_SECS,
            trades_recent_secs: DEFAULT_CACHE_TTL_SECS,
            analytics_secs: DEFAULT_CACHE_TTL_SECS,
            since_inception_secs: DEFAULT_CACHE_TTL_SECS,
            decision_last_secs: DEFAULT_CACHE_TTL_SECS,
            conversations_secs: DEFAULT_CACHE_TTL_SECS,
        }
    }
}

impl TtlSet {
    pub fn positions(&self) -> Duration {
        nonzero(self.positions_secs)
    }

    pub fn trades_recent(&self) -> Duration {
        nonzero(self.trades_recent_secs)
    }

    pub fn analytics(&self) -> Duration {
        nonzero(self.analytics_secs)
    }

    pub fn since_inception(&self) -> Duration {
        nonzero(self.since_inception_secs)
    }

    pub fn decision_last(&self) -> Duration {
        nonzero(self.decision_last_secs)
    }

    pub fn conversations(&self) -> Duration {
        nonzero(self.conversations_secs)
    }
}

fn nonzero(secs: u64) -> Duration {
    Duration::from_secs(if secs == 0 { DEFAULT_CACHE_TTL_SECS } else { secs })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_per_aspect() {
        assert_eq!(trader_positions_hash_key(), "fleet:trader:positions");
        assert_eq!(trader_decision_last_hash_key(), "fleet:trader:decision_last");
        assert_eq!(trader_hash_field(" t1 "), "t1");
    }

    #[test]
    fn zero_ttl_falls_back_to_default() {
        let mut ttl = TtlSet::default();
        ttl.positions_secs = 0;
        assert_eq!(ttl.positions(), Duration::from_secs(DEFAULT_CACHE_TTL_SECS));
    }
}
