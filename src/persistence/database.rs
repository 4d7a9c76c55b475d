//! SQLite-backed storage for manager persistence.

use super::models::{
    DecisionCycleRow, PositionRecord, PositionRow, TradeRecord, TradeRow, TraderConfigHistoryRow,
    TraderConfigRow,
};
use crate::errors::FleetError;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::Mutex;

/// Main database connection wrapper.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Create a new database connection, creating tables as needed.
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path))?;
        let db = Self { conn: Mutex::new(conn) };
        db.initialize_tables()?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        let db = Self { conn: Mutex::new(conn) };
        db.initialize_tables()?;
        Ok(db)
    }

    fn initialize_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        self.create_trader_config_tables(&conn)?;
        self.create_runtime_tables(&conn)?;
        self.create_position_tables(&conn)?;
        self.create_decision_tables(&conn)?;
        self.create_conversation_tables(&conn)?;
        self.create_indexes(&conn)?;

        Ok(())
    }

    fn create_trader_config_tables(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS trader_config (
                id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                exchange_provider TEXT NOT NULL,
                market_provider TEXT NOT NULL,
                allocation_pct REAL NOT NULL,
                detail TEXT NOT NULL,
                created_by TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS trader_config_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trader_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                config_snapshot TEXT NOT NULL,
                changed_fields TEXT NOT NULL,
                change_reason TEXT,
                changed_by TEXT,
                changed_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    fn create_runtime_tables(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS trader_runtime_state (
                trader_id TEXT PRIMARY KEY,
                active_config_version INTEGER NOT NULL,
                is_running INTEGER NOT NULL,
                detail TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS trader_symbol_cooldowns (
                trader_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                cooldown_until_ms INTEGER NOT NULL,
                detail TEXT NOT NULL,
                PRIMARY KEY (trader_id, symbol)
            )",
            [],
        )?;
        Ok(())
    }

    fn create_position_tables(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                trader_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                status TEXT NOT NULL,
                detail TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                trader_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                close_ts_ms INTEGER NOT NULL,
                detail TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS account_equity_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trader_id TEXT NOT NULL,
                ts_ms INTEGER NOT NULL,
                dollar_equity REAL NOT NULL,
                realized_pnl REAL NOT NULL,
                total_unrealized_pnl REAL NOT NULL,
                cum_pnl_pct REAL,
                sharpe_ratio REAL,
                metadata TEXT NOT NULL,
                UNIQUE (trader_id, ts_ms)
            )",
            [],
        )?;
        Ok(())
    }

    fn create_decision_tables(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS decision_cycles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trader_id TEXT NOT NULL,
                cycle_number INTEGER,
                config_version INTEGER NOT NULL,
                success INTEGER NOT NULL,
                prompt_digest TEXT,
                cot_trace TEXT,
                decisions TEXT,
                error_message TEXT,
                executed_at TEXT NOT NULL,
                UNIQUE (trader_id, cycle_number)
            )",
            [],
        )?;
        Ok(())
    }

    fn create_conversation_tables(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trader_id TEXT NOT NULL,
                topic TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS conversation_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                ts_ms INTEGER,
                metadata TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    fn create_indexes(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_positions_trader_status ON positions(trader_id, status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_trader_close ON trades(trader_id, close_ts_ms DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_decision_cycles_trader ON decision_cycles(trader_id, executed_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_history_trader ON trader_config_history(trader_id, version DESC)",
            [],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // positions
    // ------------------------------------------------------------------

    /// Insert-or-refresh an open position row keyed `trader|SYMBOL`.
    pub fn upsert_position_open(&self, row: &PositionRow) -> Result<(), FleetError> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO positions (id, trader_id, symbol, side, status, detail, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'open', ?5, ?6, ?6)
             ON CONFLICT(id) DO UPDATE SET
                side = excluded.side,
                status = 'open',
                detail = excluded.detail,
                updated_at = excluded.updated_at",
            params![row.id, row.trader_id, row.symbol, row.side, row.detail, now],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn find_position(&self, id: &str) -> Result<Option<PositionRow>, FleetError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, trader_id, symbol, side, status, detail FROM positions WHERE id = ?1",
            params![id],
            |r| {
                Ok(PositionRow {
                    id: r.get(0)?,
                    trader_id: r.get(1)?,
                    symbol: r.get(2)?,
                    side: r.get(3)?,
                    status: r.get(4)?,
                    detail: r.get(5)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    pub fn mark_position_closed(&self, id: &str, detail: &str) -> Result<(), FleetError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE positions SET status = 'closed', detail = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, detail, Utc::now().to_rfc3339()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Open positions grouped by trader id. Empty `trader_ids` returns all.
    pub fn active_positions_by_traders(
        &self,
        trader_ids: &[String],
    ) -> Result<HashMap<String, Vec<PositionRecord>>, FleetError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, trader_id, symbol, side, status, detail
                 FROM positions WHERE status = 'open' ORDER BY trader_id, symbol",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |r| {
                Ok(PositionRow {
                    id: r.get(0)?,
                    trader_id: r.get(1)?,
                    symbol: r.get(2)?,
                    side: r.get(3)?,
                    status: r.get(4)?,
                    detail: r.get(5)?,
                })
            })
            .map_err(db_err)?;
        let mut result: HashMap<String, Vec<PositionRecord>> = HashMap::new();
        for row in rows {
            let row = row.map_err(db_err)?;
            if !trader_ids.is_empty() && !trader_ids.contains(&row.trader_id) {
                continue;
            }
            result
                .entry(row.trader_id.clone())
                .or_default()
                .push(PositionRecord::from_row(&row));
        }
        Ok(result)
    }

    // ------------------------------------------------------------------
    // trades
    // ------------------------------------------------------------------

    /// Inserts a trade row. Returns false when a duplicate id was swallowed.
    pub fn insert_trade(&self, row: &TradeRow) -> Result<bool, FleetError> {
        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO trades (id, trader_id, symbol, side, close_ts_ms, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![row.id, row.trader_id, row.symbol, row.side, row.close_ts_ms, row.detail],
        );
        match result {
            Ok(_) => Ok(true),
            Err(err) if is_unique_violation(&err) => Ok(false),
            Err(err) => Err(db_err(err)),
        }
    }

    /// Trades for one trader ordered by close timestamp descending.
    pub fn recent_trades(
        &self,
        trader_id: &str,
        limit: usize,
    ) -> Result<Vec<TradeRecord>, FleetError> {
        let limit = if limit == 0 { 200 } else { limit };
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, trader_id, symbol, side, close_ts_ms, detail
                 FROM trades WHERE trader_id = ?1 ORDER BY close_ts_ms DESC LIMIT ?2",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![trader_id, limit as i64], |r| {
                Ok(TradeRow {
                    id: r.get(0)?,
                    trader_id: r.get(1)?,
                    symbol: r.get(2)?,
                    side: r.get(3)?,
                    close_ts_ms: r.get(4)?,
                    detail: r.get(5)?,
                })
            })
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(TradeRecord::from_row(&row.map_err(db_err)?));
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // decision cycles
    // ------------------------------------------------------------------

    /// Inserts one decision cycle row, swallowing duplicate keys for replay
    /// safety. Returns false when swallowed.
    pub fn insert_decision_cycle(&self, row: &DecisionCycleRow) -> Result<bool, FleetError> {
        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO decision_cycles
                (trader_id, cycle_number, config_version, success, prompt_digest, cot_trace, decisions, error_message, executed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                row.trader_id,
                row.cycle_number.map(|n| n as i64),
                row.config_version,
                row.success,
                row.prompt_digest,
                row.cot_trace,
                row.decisions,
                row.error_message,
                row.executed_at,
            ],
        );
        match result {
            Ok(_) => Ok(true),
            Err(err) if is_unique_violation(&err) => Ok(false),
            Err(err) => Err(db_err(err)),
        }
    }

    pub fn last_decision(&self, trader_id: &str) -> Result<Option<DecisionCycleRow>, FleetError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT trader_id, cycle_number, config_version, success, prompt_digest, cot_trace, decisions, error_message, executed_at
             FROM decision_cycles WHERE trader_id = ?1 ORDER BY executed_at DESC LIMIT 1",
            params![trader_id],
            |r| {
                Ok(DecisionCycleRow {
                    trader_id: r.get(0)?,
                    cycle_number: r.get::<_, Option<i64>>(1)?.map(|n| n as u64),
                    config_version: r.get(2)?,
                    success: r.get(3)?,
                    prompt_digest: r.get(4)?,
                    cot_trace: r.get(5)?,
                    decisions: r.get(6)?,
                    error_message: r.get(7)?,
                    executed_at: r.get(8)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    // ------------------------------------------------------------------
    // account snapshots
    // ------------------------------------------------------------------

    /// Insert-or-update keyed by `(trader_id, ts_ms)`.
    pub fn upsert_account_snapshot(
        &self,
        trader_id: &str,
        ts_ms: i64,
        dollar_equity: f64,
        total_unrealized_pnl: f64,
        cum_pnl_pct: Option<f64>,
        metadata: &str,
    ) -> Result<(), FleetError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO account_equity_snapshots
                (trader_id, ts_ms, dollar_equity, realized_pnl, total_unrealized_pnl, cum_pnl_pct, metadata)
             VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6)
             ON CONFLICT(trader_id, ts_ms) DO UPDATE SET
                dollar_equity = excluded.dollar_equity,
                total_unrealized_pnl = excluded.total_unrealized_pnl,
                cum_pnl_pct = excluded.cum_pnl_pct,
                metadata = excluded.metadata",
            params![trader_id, ts_ms, dollar_equity, total_unrealized_pnl, cum_pnl_pct, metadata],
        )
        .map_err(db_err)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // conversations
    // ------------------------------------------------------------------

    /// Inserts a conversation and its messages in one transaction.
    /// Messages are `(role, content, tokens, metadata_json)` tuples.
    pub fn insert_conversation(
        &self,
        trader_id: &str,
        topic: Option<&str>,
        ts: DateTime<Utc>,
        messages: &[(String, String, u32, String)],
    ) -> Result<i64, FleetError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "INSERT INTO conversations (trader_id, topic, created_at) VALUES (?1, ?2, ?3)",
            params![trader_id, topic, ts.to_rfc3339()],
        )
        .map_err(db_err)?;
        let conversation_id = tx.last_insert_rowid();
        for (role, content, _tokens, metadata) in messages {
            if content.trim().is_empty() {
                continue;
            }
            tx.execute(
                "INSERT INTO conversation_messages (conversation_id, role, content, ts_ms, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    conversation_id,
                    role,
                    content,
                    ts.timestamp_millis(),
                    metadata,
                    ts.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(conversation_id)
    }

    pub fn conversation_message_count(&self, conversation_id: i64) -> Result<u64, FleetError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM conversation_messages WHERE conversation_id = ?1",
            params![conversation_id],
            |r| r.get::<_, i64>(0),
        )
        .map(|n| n as u64)
        .map_err(db_err)
    }

    // ------------------------------------------------------------------
    // runtime state + cooldowns
    // ------------------------------------------------------------------

    pub fn upsert_runtime_state(
        &self,
        trader_id: &str,
        active_config_version: i64,
        is_running: bool,
        detail: &str,
    ) -> Result<(), FleetError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO trader_runtime_state (trader_id, active_config_version, is_running, detail, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(trader_id) DO UPDATE SET
                active_config_version = excluded.active_config_version,
                is_running = excluded.is_running,
                detail = excluded.detail,
                updated_at = excluded.updated_at",
            params![trader_id, active_config_version, is_running, detail, Utc::now().to_rfc3339()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn upsert_cooldown(
        &self,
        trader_id: &str,
        symbol: &str,
        cooldown_until_ms: i64,
        detail: &str,
    ) -> Result<(), FleetError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO trader_symbol_cooldowns (trader_id, symbol, cooldown_until_ms, detail)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(trader_id, symbol) DO UPDATE SET
                cooldown_until_ms = excluded.cooldown_until_ms,
                detail = excluded.detail",
            params![trader_id, symbol, cooldown_until_ms, detail],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// All cooldown rows for one trader as `(symbol, cooldown_until_ms)`.
    pub fn list_cooldowns(&self, trader_id: &str) -> Result<Vec<(String, i64)>, FleetError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT symbol, cooldown_until_ms FROM trader_symbol_cooldowns WHERE trader_id = ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![trader_id], |r| Ok((r.get(0)?, r.get(1)?)))
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(db_err)?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // trader config + history
    // ------------------------------------------------------------------

    pub fn find_config(&self, trader_id: &str) -> Result<Option<TraderConfigRow>, FleetError> {
        let conn = self.conn.lock().unwrap();
        query_config(
            &conn,
            "SELECT id, version, exchange_provider, market_provider, allocation_pct, detail, created_by
             FROM trader_config WHERE id = ?1",
            params![trader_id],
        )
    }

    pub fn find_config_by_version(
        &self,
        trader_id: &str,
        version: i64,
    ) -> Result<Option<TraderConfigRow>, FleetError> {
        let conn = self.conn.lock().unwrap();
        query_config(
            &conn,
            "SELECT id, version, exchange_provider, market_provider, allocation_pct, detail, created_by
             FROM trader_config WHERE id = ?1 AND version = ?2",
            params![trader_id, version],
        )
    }

    pub fn list_configs(&self) -> Result<Vec<TraderConfigRow>, FleetError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, version, exchange_provider, market_provider, allocation_pct, detail, created_by
                 FROM trader_config ORDER BY id",
            )
            .map_err(db_err)?;
        let rows = stmt.query_map([], map_config_row).map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(db_err)?);
        }
        Ok(out)
    }

    /// Inserts a new config row plus its history entry in one transaction.
    pub fn insert_config_with_history(
        &self,
        row: &TraderConfigRow,
        history: &TraderConfigHistoryRow,
    ) -> Result<(), FleetError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db_err)?;
        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO trader_config (id, version, exchange_provider, market_provider, allocation_pct, detail, created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                row.id,
                row.version,
                row.exchange_provider,
                row.market_provider,
                row.allocation_pct,
                row.detail,
                row.created_by,
                now,
            ],
        )
        .map_err(db_err)?;
        insert_history(&tx, history)?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    /// Updates an existing config row plus its history entry in one
    /// transaction.
    pub fn update_config_with_history(
        &self,
        row: &TraderConfigRow,
        history: &TraderConfigHistoryRow,
    ) -> Result<(), FleetError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "UPDATE trader_config SET
                version = ?2,
                exchange_provider = ?3,
                market_provider = ?4,
                allocation_pct = ?5,
                detail = ?6,
                updated_at = ?7
             WHERE id = ?1",
            params![
                row.id,
                row.version,
                row.exchange_provider,
                row.market_provider,
                row.allocation_pct,
                row.detail,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        insert_history(&tx, history)?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    /// History rows for one trader, newest version first.
    pub fn list_history(
        &self,
        trader_id: &str,
        limit: usize,
    ) -> Result<Vec<TraderConfigHistoryRow>, FleetError> {
        let limit = if limit == 0 { 50 } else { limit };
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT trader_id, version, config_snapshot, changed_fields, change_reason, changed_by, changed_at
                 FROM trader_config_history WHERE trader_id = ?1 ORDER BY version DESC LIMIT ?2",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![trader_id, limit as i64], |r| {
                let fields: String = r.get(3)?;
                Ok(TraderConfigHistoryRow {
                    trader_id: r.get(0)?,
                    version: r.get(1)?,
                    config_snapshot: r.get(2)?,
                    changed_fields: serde_json::from_str(&fields).unwrap_or_default(),
                    change_reason: r.get(4)?,
                    changed_by: r.get(5)?,
                    changed_at: r.get(6)?,
                })
            })
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(db_err)?);
        }
        Ok(out)
    }
}

fn insert_history(
    tx: &rusqlite::Transaction<'_>,
    history: &TraderConfigHistoryRow,
) -> Result<(), FleetError> {
    let fields = serde_json::to_string(&history.changed_fields)
        .map_err(|e| FleetError::Db(format!("encode changed_fields: {}", e)))?;
    tx.execute(
        "INSERT INTO trader_config_history (trader_id, version, config_snapshot, changed_fields, change_reason, changed_by, changed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            history.trader_id,
            history.version,
            history.config_snapshot,
            fields,
            history.change_reason,
            history.changed_by,
            history.changed_at,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn query_config(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Option<TraderConfigRow>, FleetError> {
    conn.query_row(sql, params, map_config_row).optional().map_err(db_err)
}

fn map_config_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<TraderConfigRow> {
    Ok(TraderConfigRow {
        id: r.get(0)?,
        version: r.get(1)?,
        exchange_provider: r.get(2)?,
        market_provider: r.get(3)?,
        allocation_pct: r.get(4)?,
        detail: r.get(5)?,
        created_by: r.get(6)?,
    })
}

fn db_err(err: rusqlite::Error) -> FleetError {
    FleetError::Db(err.to_string())
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::models::PositionDetail;

    #[test]
    fn trade_duplicates_are_swallowed() {
        let db = Database::in_memory().unwrap();
        let row = TradeRow {
            id: "t1|BTC|123".into(),
            trader_id: "t1".into(),
            symbol: "BTC".into(),
            side: "long".into(),
            close_ts_ms: 123,
            detail: "{}".into(),
        };
        assert!(db.insert_trade(&row).unwrap());
        assert!(!db.insert_trade(&row).unwrap());
    }

    #[test]
    fn decision_cycle_duplicates_are_swallowed() {
        let db = Database::in_memory().unwrap();
        let row = DecisionCycleRow {
            trader_id: "t1".into(),
            cycle_number: Some(1),
            config_version: 1,
            success: true,
            executed_at: "2025-01-01T00:00:00Z".into(),
            ..Default::default()
        };
        assert!(db.insert_decision_cycle(&row).unwrap());
        assert!(!db.insert_decision_cycle(&row).unwrap());
    }

    #[test]
    fn position_upsert_refreshes_detail() {
        let db = Database::in_memory().unwrap();
        let mut detail = PositionDetail::default();
        detail.entry.price = 100.0;
        let mut row = PositionRow {
            id: "t1|BTC".into(),
            trader_id: "t1".into(),
            symbol: "BTC".into(),
            side: "long".into(),
            status: "open".into(),
            detail: detail.encode(),
        };
        db.upsert_position_open(&row).unwrap();
        detail.entry.price = 105.0;
        row.detail = detail.encode();
        db.upsert_position_open(&row).unwrap();

        let found = db.find_position("t1|BTC").unwrap().unwrap();
        assert_eq!(PositionDetail::decode(&found.detail).entry.price, 105.0);
        assert_eq!(found.status, "open");
    }

    #[test]
    fn account_snapshot_upserts_by_trader_and_ts() {
        let db = Database::in_memory().unwrap();
        db.upsert_account_snapshot("t1", 1000, 500.0, 0.0, None, "{}").unwrap();
        db.upsert_account_snapshot("t1", 1000, 510.0, 1.0, Some(0.2), "{}").unwrap();
        let conn = db.conn.lock().unwrap();
        let (count, equity): (i64, f64) = conn
            .query_row(
                "SELECT COUNT(*), MAX(dollar_equity) FROM account_equity_snapshots WHERE trader_id = 't1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(equity, 510.0);
    }
}
