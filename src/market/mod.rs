//! Market data snapshot types and provider interface.

use crate::errors::FleetError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceInfo {
    pub last: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeInfo {
    pub one_hour: f64,
    pub four_hour: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenInterestInfo {
    pub latest: f64,
    #[serde(default)]
    pub average: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FundingInfo {
    pub rate: f64,
}

/// Point-in-time market view for one symbol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub symbol: String,
    pub price: PriceInfo,
    pub change: ChangeInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_interest: Option<OpenInterestInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funding: Option<FundingInfo>,
}

impl Snapshot {
    /// Notional open interest in USD, used by the liquidity floor guard.
    pub fn open_interest_usd(&self) -> f64 {
        match &self.open_interest {
            Some(oi) => oi.latest * self.price.last,
            None => 0.0,
        }
    }
}

#[async_trait]
pub trait MarketProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn snapshot(&self, symbol: &str) -> Result<Snapshot, FleetError>;

    /// Candidate symbols the provider currently considers tradeable.
    async fn candidates(&self) -> Result<Vec<String>, FleetError>;
}

/// Fixed snapshot set, fed by hand. Used for tests and offline wiring.
#[derive(Default)]
pub struct StaticMarketProvider {
    snapshots: std::sync::RwLock<std::collections::HashMap<String, Snapshot>>,
}

impl StaticMarketProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_snapshot(&self, snapshot: Snapshot) {
        let symbol = snapshot.symbol.to_uppercase();
        self.snapshots.write().unwrap().insert(symbol, snapshot);
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        let symbol = symbol.to_uppercase();
        self.set_snapshot(Snapshot {
            symbol: symbol.clone(),
            price: PriceInfo { last: price },
            ..Default::default()
        });
    }
}

#[async_trait]
impl MarketProvider for StaticMarketProvider {
    fn name(&self) -> &str {
        "static"
    }

    async fn snapshot(&self, symbol: &str) -> Result<Snapshot, FleetError> {
        let symbol = symbol.to_uppercase();
        self.snapshots
            .read()
            .unwrap()
            .get(&symbol)
            .cloned()
            .ok_or_else(|| FleetError::Exchange(format!("no snapshot for {}", symbol)))
    }

    async fn candidates(&self) -> Result<Vec<String>, FleetError> {
        let mut symbols: Vec<String> = self.snapshots.read().unwrap().keys().cloned().collect();
        symbols.sort();
        Ok(symbols)
    }
}
