//! Append-only on-disk record of decision cycles.
//!
//! One JSON file per cycle, named `cycle_<YYYYMMDD_HHMMSS_mmm>_<trader>.json`
//! so lexicographic order is chronological order. Files are fsynced after
//! write and never mutated. The journal is the source of truth for replay.

pub mod replay;

use crate::errors::FleetError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).single().unwrap()
}

/// Everything needed to reconstruct and re-exercise one decision cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    pub trader_id: String,
    #[serde(default)]
    pub config_version: i64,
    #[serde(default)]
    pub cycle_number: u64,
    #[serde(default = "epoch")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub prompt_digest: String,
    #[serde(default)]
    pub cot_trace: String,
    /// Raw decisions JSON exactly as the LLM returned it.
    #[serde(default)]
    pub decisions_json: String,
    #[serde(default)]
    pub error_message: String,
    /// Normalised per-decision summaries: symbol, action, confidence.
    #[serde(default)]
    pub actions: Vec<Map<String, Value>>,
    #[serde(default)]
    pub account: Map<String, Value>,
    #[serde(default)]
    pub positions: Vec<Map<String, Value>>,
    #[serde(default)]
    pub candidates: Vec<String>,
    #[serde(default)]
    pub market_digest: Map<String, Value>,
}

impl CycleRecord {
    pub fn new(trader_id: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            trader_id: trader_id.to_string(),
            config_version: 0,
            cycle_number: 0,
            timestamp,
            success: false,
            prompt_digest: String::new(),
            cot_trace: String::new(),
            decisions_json: String::new(),
            error_message: String::new(),
            actions: Vec::new(),
            account: Map::new(),
            positions: Vec::new(),
            candidates: Vec::new(),
            market_digest: Map::new(),
        }
    }
}

/// Disk-backed journal rooted at one directory.
pub struct Store {
    dir: PathBuf,
}

impl Store {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let dir = if dir.as_os_str().is_empty() { Path::new("journal") } else { dir };
        Self { dir: dir.to_path_buf() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Durably appends one cycle record and returns its path.
    pub fn append(&self, record: &CycleRecord) -> Result<PathBuf, FleetError> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| FleetError::JournalIo(format!("create dir {}: {}", self.dir.display(), e)))?;
        let name = format!(
            "cycle_{}_{}.json",
            record.timestamp.format("%Y%m%d_%H%M%S_%3f"),
            record.trader_id
        );
        let path = self.dir.join(name);
        let data = serde_json::to_vec(record)
            .map_err(|e| FleetError::JournalIo(format!("encode cycle: {}", e)))?;
        let mut file = File::create(&path)
            .map_err(|e| FleetError::JournalIo(format!("create {}: {}", path.display(), e)))?;
        file.write_all(&data)
            .map_err(|e| FleetError::JournalIo(format!("write {}: {}", path.display(), e)))?;
        file.sync_all()
            .map_err(|e| FleetError::JournalIo(format!("fsync {}: {}", path.display(), e)))?;
        Ok(path)
    }

    /// Journal file paths ascending by name. With a positive limit only the
    /// latest N are returned.
    pub fn list(&self, limit: usize) -> Result<Vec<PathBuf>, FleetError> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| FleetError::JournalIo(format!("list dir {}: {}", self.dir.display(), e)))?;
        let mut files: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|e| FleetError::JournalIo(format!("read dir entry: {}", e)))?;
            if entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("cycle_") || !name.ends_with(".json") {
                continue;
            }
            files.push(entry.path());
        }
        files.sort();
        if limit > 0 && files.len() > limit {
            files = files.split_off(files.len() - limit);
        }
        Ok(files)
    }

    /// Reads a single cycle file. Malformed content propagates as an error.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<CycleRecord, FleetError> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .map_err(|e| FleetError::JournalIo(format!("read {}: {}", path.display(), e)))?;
        serde_json::from_str(&data)
            .map_err(|e| FleetError::JournalIo(format!("decode {}: {}", path.display(), e)))
    }

    /// Loads the most recent N cycle records in ascending order.
    pub fn latest(&self, limit: usize) -> Result<Vec<CycleRecord>, FleetError> {
        let files = self.list(limit)?;
        let mut out = Vec::with_capacity(files.len());
        for path in files {
            out.push(self.load(path)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn latest_orders_and_limits() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let t1 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 1).unwrap();
        let t2 = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 1).unwrap();
        store.append(&CycleRecord::new("t1", t1)).unwrap();
        store.append(&CycleRecord::new("t2", t2)).unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let recs = store.latest(1).unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].trader_id, "t2");

        let recs = store.latest(5).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].trader_id, "t1");
    }

    #[test]
    fn same_second_cycles_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 1).unwrap();
        let a = store.append(&CycleRecord::new("t1", base)).unwrap();
        let b = store
            .append(&CycleRecord::new("t1", base + chrono::Duration::milliseconds(3)))
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn malformed_file_propagates_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let path = dir.path().join("cycle_20250101_000001_000_t1.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(store.load(&path).is_err());
        assert!(store.latest(5).is_err());
    }
}
