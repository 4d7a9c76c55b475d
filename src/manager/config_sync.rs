//! Versioned trader config sync with change history.
//!
//! Each record's detail JSON is canonicalised before comparison so
//! formatting drift never produces a phantom version bump. All per-trader
//! mutations happen inside one database transaction.

use super::types::TraderConfig;
use crate::errors::FleetError;
use crate::persistence::models::{TraderConfigHistoryRow, TraderConfigRow};
use crate::persistence::Database;
use chrono::Utc;
use std::sync::Arc;

/// A single trader configuration payload to persist.
#[derive(Debug, Clone)]
pub struct TraderConfigRecord {
    pub id: String,
    pub exchange_provider: String,
    pub market_provider: String,
    pub allocation_pct: f64,
    pub detail: serde_json::Value,
    pub created_by: String,
    pub change_reason: String,
}

/// Outcome of a sync run, for logging and assertions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigSyncResult {
    pub inserted: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
}

enum SyncAction {
    Inserted,
    Updated,
    Unchanged,
}

pub struct ConfigSync {
    db: Arc<Database>,
}

impl ConfigSync {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn sync(&self, records: &[TraderConfigRecord]) -> Result<ConfigSyncResult, FleetError> {
        let mut summary = ConfigSyncResult::default();
        for rec in records {
            match self.sync_one(rec)? {
                SyncAction::Inserted => summary.inserted.push(rec.id.clone()),
                SyncAction::Updated => summary.updated.push(rec.id.clone()),
                SyncAction::Unchanged => summary.unchanged.push(rec.id.clone()),
            }
        }
        Ok(summary)
    }

    fn sync_one(&self, rec: &TraderConfigRecord) -> Result<SyncAction, FleetError> {
        if rec.id.trim().is_empty() {
            return Err(FleetError::Config("trader config record missing id".into()));
        }
        let detail = normalize_detail(&rec.detail)?;
        let existing = self.db.find_config(&rec.id)?;

        let Some(existing) = existing else {
            let row = build_config_row(rec, &detail, 1);
            let history = build_history_row(
                &row,
                vec![
                    "allocation_pct".into(),
                    "detail".into(),
                    "exchange_provider".into(),
                    "market_provider".into(),
                ],
                rec,
            );
            self.db.insert_config_with_history(&row, &history)?;
            return Ok(SyncAction::Inserted);
        };

        let changes = compute_changed_fields(&existing, rec, &detail);
        if changes.is_empty() {
            return Ok(SyncAction::Unchanged);
        }
        let row = build_config_row(rec, &detail, existing.version + 1);
        let history = build_history_row(&row, changes, rec);
        self.db.update_config_with_history(&row, &history)?;
        Ok(SyncAction::Updated)
    }

    pub fn find_one(&self, trader_id: &str) -> Result<Option<TraderConfigRow>, FleetError> {
        self.db.find_config(trader_id)
    }

    pub fn find_by_version(
        &self,
        trader_id: &str,
        version: i64,
    ) -> Result<Option<TraderConfigRow>, FleetError> {
        self.db.find_config_by_version(trader_id, version)
    }

    pub fn list_all(&self) -> Result<Vec<TraderConfigRow>, FleetError> {
        self.db.list_configs()
    }

    pub fn list_history(
        &self,
        trader_id: &str,
        limit: usize,
    ) -> Result<Vec<TraderConfigHistoryRow>, FleetError> {
        self.db.list_history(trader_id, limit)
    }
}

/// Serialises a TraderConfig into the record format.
pub fn trader_config_to_record(
    cfg: &TraderConfig,
    changed_by: &str,
    reason: &str,
) -> Result<TraderConfigRecord, FleetError> {
    if cfg.id.trim().is_empty() {
        return Err(FleetError::Config("trader config missing id".into()));
    }
    let detail = serde_json::to_value(cfg)
        .map_err(|e| FleetError::Config(format!("marshal trader config {}: {}", cfg.id, e)))?;
    Ok(TraderConfigRecord {
        id: cfg.id.clone(),
        exchange_provider: cfg.exchange_provider.clone(),
        market_provider: cfg.market_provider.clone(),
        allocation_pct: cfg.allocation_pct,
        detail,
        created_by: changed_by.to_string(),
        change_reason: reason.to_string(),
    })
}

/// Hydrates a TraderConfig from a persisted row: detail JSON plus the
/// authoritative column values.
pub fn trader_config_from_row(row: &TraderConfigRow) -> Result<TraderConfig, FleetError> {
    let mut cfg: TraderConfig = serde_json::from_str(&row.detail).map_err(|e| {
        FleetError::Config(format!("unmarshal trader config {} detail: {}", row.id, e))
    })?;
    cfg.id = row.id.clone();
    cfg.exchange_provider = row.exchange_provider.clone();
    cfg.market_provider = row.market_provider.clone();
    cfg.allocation_pct = row.allocation_pct;
    cfg.version = row.version;
    Ok(cfg)
}

fn build_config_row(rec: &TraderConfigRecord, detail: &str, version: i64) -> TraderConfigRow {
    TraderConfigRow {
        id: rec.id.clone(),
        version,
        exchange_provider: rec.exchange_provider.clone(),
        market_provider: rec.market_provider.clone(),
        allocation_pct: rec.allocation_pct,
        detail: detail.to_string(),
        created_by: if rec.created_by.trim().is_empty() {
            None
        } else {
            Some(rec.created_by.clone())
        },
    }
}

fn build_history_row(
    row: &TraderConfigRow,
    changed_fields: Vec<String>,
    rec: &TraderConfigRecord,
) -> TraderConfigHistoryRow {
    TraderConfigHistoryRow {
        trader_id: row.id.clone(),
        version: row.version,
        config_snapshot: row.detail.clone(),
        changed_fields,
        change_reason: if rec.change_reason.trim().is_empty() {
            None
        } else {
            Some(rec.change_reason.clone())
        },
        changed_by: if rec.created_by.trim().is_empty() {
            None
        } else {
            Some(rec.created_by.clone())
        },
        changed_at: Utc::now().to_rfc3339(),
    }
}

/// Sorted, deduplicated set of columns that differ from the stored row.
fn compute_changed_fields(
    existing: &TraderConfigRow,
    rec: &TraderConfigRecord,
    detail: &str,
) -> Vec<String> {
    let mut changed = Vec::new();
    if existing.exchange_provider != rec.exchange_provider {
        changed.push("exchange_provider".to_string());
    }
    if existing.market_provider != rec.market_provider {
        changed.push("market_provider".to_string());
    }
    if existing.allocation_pct != rec.allocation_pct {
        changed.push("allocation_pct".to_string());
    }
    if existing.detail.trim() != detail {
        changed.push("detail".to_string());
    }
    changed.sort();
    changed.dedup();
    changed
}

/// Re-marshals the detail payload to eliminate formatting drift. The JSON
/// object keys come back in a stable order.
fn normalize_detail(raw: &serde_json::Value) -> Result<String, FleetError> {
    if raw.is_null() {
        return Ok("{}".to_string());
    }
    serde_json::to_string(raw).map_err(|e| FleetError::Config(format!("normalize detail: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, pct: f64) -> TraderConfigRecord {
        TraderConfigRecord {
            id: id.into(),
            exchange_provider: "sim".into(),
            market_provider: "sim".into(),
            allocation_pct: pct,
            detail: json!({"b": 2, "a": 1}),
            created_by: "ops".into(),
            change_reason: "seed".into(),
        }
    }

    fn sync() -> ConfigSync {
        ConfigSync::new(Arc::new(Database::in_memory().unwrap()))
    }

    #[test]
    fn insert_then_unchanged() {
        let sync = sync();
        let result = sync.sync(&[record("t1", 40.0)]).unwrap();
        assert_eq!(result.inserted, vec!["t1".to_string()]);

        // identical payload with different key order: no version bump
        let mut again = record("t1", 40.0);
        again.detail = json!({"a": 1, "b": 2});
        let result = sync.sync(&[again]).unwrap();
        assert_eq!(result.unchanged, vec!["t1".to_string()]);

        let history = sync.list_history("t1", 10).unwrap();
        assert_eq!(history.len(), 1);
        let row = sync.find_one("t1").unwrap().unwrap();
        assert_eq!(row.version, 1);
    }

    #[test]
    fn update_bumps_version_and_appends_history() {
        let sync = sync();
        sync.sync(&[record("t1", 40.0)]).unwrap();
        let result = sync.sync(&[record("t1", 50.0)]).unwrap();
        assert_eq!(result.updated, vec!["t1".to_string()]);

        let row = sync.find_one("t1").unwrap().unwrap();
        assert_eq!(row.version, 2);

        let history = sync.list_history("t1", 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version, 2);
        assert_eq!(history[0].changed_fields, vec!["allocation_pct".to_string()]);

        let v1 = sync.find_by_version("t1", 1).unwrap();
        // superseded versions live in history, the config table holds the head
        assert!(v1.is_none());
    }

    #[test]
    fn changed_fields_are_sorted() {
        let sync = sync();
        sync.sync(&[record("t1", 40.0)]).unwrap();
        let mut changed = record("t1", 50.0);
        changed.exchange_provider = "hyperliquid".into();
        changed.detail = json!({"c": 3});
        sync.sync(&[changed]).unwrap();

        let history = sync.list_history("t1", 1).unwrap();
        assert_eq!(
            history[0].changed_fields,
            vec![
                "allocation_pct".to_string(),
                "detail".to_string(),
                "exchange_provider".to_string()
            ]
        );
    }

    #[test]
    fn missing_id_is_rejected() {
        let sync = sync();
        assert!(sync.sync(&[record("", 40.0)]).is_err());
    }
}
