//! Config sync behaviour across repeated runs.

use fleetbot::manager::config_sync::{trader_config_from_row, trader_config_to_record};
use fleetbot::manager::{ConfigSync, RiskParameters, TraderConfig};
use fleetbot::persistence::Database;
use std::sync::Arc;

fn config(id: &str, allocation_pct: f64) -> TraderConfig {
    TraderConfig {
        id: id.into(),
        name: "Aggressive Short".into(),
        exchange_provider: "hyperliquid".into(),
        market_provider: "hl_market".into(),
        allocation_pct,
        decision_interval_secs: 180,
        prompt_template: "etc/prompts/executor/default_prompt.tmpl".into(),
        auto_start: true,
        version: 0,
        risk_params: RiskParameters {
            max_positions: 3,
            max_position_size_usd: 500.0,
            max_margin_usage_pct: 60.0,
            major_coin_leverage: 20,
            altcoin_leverage: 10,
            min_risk_reward_ratio: 3.0,
            min_confidence: 75,
            stop_loss_enabled: true,
            take_profit_enabled: true,
            ..Default::default()
        },
    }
}

#[test]
fn sync_twice_with_identical_records_is_idempotent() {
    let sync = ConfigSync::new(Arc::new(Database::in_memory().unwrap()));
    let record = trader_config_to_record(&config("t1", 40.0), "ops", "initial rollout").unwrap();

    let result = sync.sync(&[record.clone()]).unwrap();
    assert_eq!(result.inserted, vec!["t1".to_string()]);
    assert!(result.updated.is_empty());
    assert!(result.unchanged.is_empty());

    let result = sync.sync(&[record]).unwrap();
    assert!(result.inserted.is_empty());
    assert!(result.updated.is_empty());
    assert_eq!(result.unchanged, vec!["t1".to_string()]);

    // exactly one history row, version untouched
    let history = sync.list_history("t1", 10).unwrap();
    assert_eq!(history.len(), 1);
    let row = sync.find_one("t1").unwrap().unwrap();
    assert_eq!(row.version, 1);
}

#[test]
fn changed_record_bumps_version_and_hydrates_back() {
    let sync = ConfigSync::new(Arc::new(Database::in_memory().unwrap()));
    sync.sync(&[trader_config_to_record(&config("t1", 40.0), "ops", "seed").unwrap()])
        .unwrap();

    let mut updated = config("t1", 55.0);
    updated.risk_params.min_confidence = 80;
    sync.sync(&[trader_config_to_record(&updated, "ops", "raise allocation").unwrap()])
        .unwrap();

    let row = sync.find_one("t1").unwrap().unwrap();
    assert_eq!(row.version, 2);

    let hydrated = trader_config_from_row(&row).unwrap();
    assert_eq!(hydrated.allocation_pct, 55.0);
    assert_eq!(hydrated.risk_params.min_confidence, 80);
    assert_eq!(hydrated.version, 2);

    let history = sync.list_history("t1", 10).unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0]
        .changed_fields
        .contains(&"allocation_pct".to_string()));
}
