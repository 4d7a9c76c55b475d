use crate::cache::TtlSet;
use crate::executor::ExecutorConfig;
use crate::llm::LlmConfig;
use crate::manager::ManagerConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level application configuration, loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub manager: ManagerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Inline LLM settings; when absent the client is configured from the
    /// `ZENMUX_*` environment.
    #[serde(default)]
    pub llm: Option<LlmConfig>,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default = "default_journal_dir")]
    pub journal_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Redis connection URL; absent means the in-process cache layer.
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub ttl: TtlSet,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: default_db_path(),
            redis_url: None,
            ttl: TtlSet::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_db_path() -> String {
    "fleetbot.db".to_string()
}

fn default_journal_dir() -> String {
    "journal".to_string()
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg: AppConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.manager.validate()?;
        if let Some(llm) = &self.llm {
            llm.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_minimal_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"{
                "manager": {
                    "reserve_equity_pct": 10.0,
                    "traders": [{
                        "id": "t1",
                        "exchange_provider": "sim",
                        "market_provider": "static",
                        "allocation_pct": 40.0,
                        "prompt_template": "etc/prompts/executor/default_prompt.tmpl",
                        "auto_start": true
                    }]
                }
            }"#,
        )
        .unwrap();
        let cfg = AppConfig::load(file.path()).unwrap();
        assert_eq!(cfg.manager.traders.len(), 1);
        assert_eq!(cfg.journal_dir, "journal");
        assert!(cfg.persistence.enabled);
        assert!(cfg.persistence.redis_url.is_none());
    }

    #[test]
    fn rejects_over_allocation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"{
                "manager": {
                    "reserve_equity_pct": 20.0,
                    "traders": [
                        {"id": "a", "exchange_provider": "sim", "market_provider": "static",
                         "allocation_pct": 50.0, "prompt_template": "p.tmpl"},
                        {"id": "b", "exchange_provider": "sim", "market_provider": "static",
                         "allocation_pct": 40.0, "prompt_template": "p.tmpl"}
                    ]
                }
            }"#,
        )
        .unwrap();
        assert!(AppConfig::load(file.path()).is_err());
    }
}
