//! Position ownership registry.
//!
//! One reader-writer lock protects both the symbol -> owner map and every
//! trader's virtual position book, so no two traders can concurrently
//! reference the same symbol.

use super::types::{normalize_symbol, PositionBook, VirtualPosition};
use crate::errors::FleetError;
use crate::exchange::ExchangePosition;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Default)]
struct RegistryState {
    owners: HashMap<String, String>,
    books: HashMap<String, PositionBook>,
}

#[derive(Default)]
pub struct PositionRegistry {
    inner: RwLock<RegistryState>,
}

impl PositionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `position.symbol` for `trader_id` and records the entry in
    /// the trader's book. Claiming a symbol the caller already owns
    /// refreshes the entry; a symbol owned by another trader fails.
    pub fn assign(&self, trader_id: &str, mut position: VirtualPosition) -> Result<(), FleetError> {
        let symbol = normalize_symbol(&position.symbol);
        if symbol.is_empty() {
            return Err(FleetError::RiskViolation("cannot assign empty symbol".into()));
        }
        position.symbol = symbol.clone();
        let mut state = self.inner.write().unwrap();
        if let Some(owner) = state.owners.get(&symbol) {
            if owner != trader_id {
                return Err(FleetError::SymbolOwned { symbol, owner: owner.clone() });
            }
        }
        state.owners.insert(symbol.clone(), trader_id.to_string());
        state
            .books
            .entry(trader_id.to_string())
            .or_default()
            .insert(symbol, position);
        Ok(())
    }

    /// Removes ownership only when the current owner matches; silently a
    /// no-op otherwise.
    pub fn release(&self, trader_id: &str, symbol: &str) {
        let symbol = normalize_symbol(symbol);
        let mut state = self.inner.write().unwrap();
        match state.owners.get(&symbol) {
            Some(owner) if owner == trader_id => {
                state.owners.remove(&symbol);
            }
            _ => return,
        }
        if let Some(book) = state.books.get_mut(trader_id) {
            book.remove(&symbol);
        }
    }

    pub fn owner(&self, symbol: &str) -> Option<String> {
        let symbol = normalize_symbol(symbol);
        self.inner.read().unwrap().owners.get(&symbol).cloned()
    }

    /// The subset of exchange-reported positions either owned by the trader
    /// or ownerless. This is how each trader's LLM sees only its own book
    /// plus unassigned inventory.
    pub fn filter_positions(
        &self,
        trader_id: &str,
        positions: &[ExchangePosition],
    ) -> Vec<ExchangePosition> {
        let state = self.inner.read().unwrap();
        positions
            .iter()
            .filter(|pos| {
                let symbol = normalize_symbol(&pos.symbol);
                match state.owners.get(&symbol) {
                    Some(owner) => owner == trader_id,
                    None => true,
                }
            })
            .cloned()
            .collect()
    }

    /// Snapshot of one trader's book.
    pub fn book(&self, trader_id: &str) -> PositionBook {
        self.inner
            .read()
            .unwrap()
            .books
            .get(trader_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn position(&self, trader_id: &str, symbol: &str) -> Option<VirtualPosition> {
        let symbol = normalize_symbol(symbol);
        self.inner
            .read()
            .unwrap()
            .books
            .get(trader_id)
            .and_then(|book| book.get(&symbol))
            .cloned()
    }

    pub fn position_count(&self, trader_id: &str) -> usize {
        self.inner
            .read()
            .unwrap()
            .books
            .get(trader_id)
            .map(|book| book.len())
            .unwrap_or(0)
    }

    /// Drops a trader's book, releasing every symbol it owned.
    pub fn remove_trader(&self, trader_id: &str) {
        let mut state = self.inner.write().unwrap();
        if let Some(book) = state.books.remove(trader_id) {
            for symbol in book.keys() {
                if state.owners.get(symbol).map(|o| o == trader_id).unwrap_or(false) {
                    state.owners.remove(symbol);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(symbol: &str) -> VirtualPosition {
        VirtualPosition {
            symbol: symbol.into(),
            side: "long".into(),
            quantity: 1.0,
            entry_price: 100.0,
            ..Default::default()
        }
    }

    #[test]
    fn assign_release_round_trip() {
        let registry = PositionRegistry::new();
        registry.assign("t1", position("BTC")).unwrap();
        assert_eq!(registry.owner("BTC"), Some("t1".to_string()));

        registry.release("t1", "BTC");
        assert_eq!(registry.owner("BTC"), None);
        assert!(registry.book("t1").is_empty());
    }

    #[test]
    fn conflicting_assign_fails() {
        let registry = PositionRegistry::new();
        registry.assign("t1", position("BTC")).unwrap();
        let err = registry.assign("t2", position("BTC")).unwrap_err();
        assert!(matches!(err, FleetError::SymbolOwned { .. }));
        // idempotent refresh for the owner
        assert!(registry.assign("t1", position("BTC")).is_ok());
    }

    #[test]
    fn release_by_non_owner_is_noop() {
        let registry = PositionRegistry::new();
        registry.assign("t1", position("BTC")).unwrap();
        registry.release("t2", "BTC");
        assert_eq!(registry.owner("BTC"), Some("t1".to_string()));
    }

    #[test]
    fn symbols_normalise_to_one_key() {
        let registry = PositionRegistry::new();
        registry.assign("t1", position("btc ")).unwrap();
        assert_eq!(registry.owner("BTC"), Some("t1".to_string()));
        let err = registry.assign("t2", position("BTC")).unwrap_err();
        assert!(matches!(err, FleetError::SymbolOwned { .. }));
    }

    #[test]
    fn filter_shows_own_plus_ownerless() {
        let registry = PositionRegistry::new();
        registry.assign("t1", position("BTC")).unwrap();
        let positions = vec![
            ExchangePosition { symbol: "BTC".into(), ..Default::default() },
            ExchangePosition { symbol: "ETH".into(), ..Default::default() },
        ];

        let mine = registry.filter_positions("t1", &positions);
        assert_eq!(mine.len(), 2, "owner sees assigned and unowned positions");

        let other = registry.filter_positions("t2", &positions);
        assert_eq!(other.len(), 1, "other trader does not see BTC");
        assert_eq!(other[0].symbol, "ETH");
    }

    #[test]
    fn remove_trader_releases_symbols() {
        let registry = PositionRegistry::new();
        registry.assign("t1", position("BTC")).unwrap();
        registry.assign("t1", position("ETH")).unwrap();
        registry.remove_trader("t1");
        assert_eq!(registry.owner("BTC"), None);
        assert_eq!(registry.owner("ETH"), None);
    }
}
