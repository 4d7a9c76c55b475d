use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://zenmux.ai/api/v1";
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ALERT_THRESHOLD_PCT: u32 = 80;

const ENV_API_KEY: &str = "ZENMUX_API_KEY";
const ENV_BASE_URL: &str = "ZENMUX_BASE_URL";
const ENV_DEFAULT_MODEL: &str = "ZENMUX_DEFAULT_MODEL";
const ENV_TIMEOUT: &str = "ZENMUX_TIMEOUT";
const ENV_MAX_RETRIES: &str = "ZENMUX_MAX_RETRIES";

static DOTENV_ONCE: Lazy<()> = Lazy::new(|| {
    let _ = dotenv::dotenv();
});

/// Loads `.env` into the process environment exactly once.
pub fn load_dotenv_once() {
    Lazy::force(&DOTENV_ONCE);
}

/// Runtime settings for the LLM client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub default_model: String,
    /// Per-request timeout in seconds.
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub log_level: String,
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
    #[serde(default)]
    pub budget: Option<BudgetConfig>,
}

/// Defaults for a particular model alias.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_name: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_completion_tokens: Option<u32>,
}

/// Token spend controls for LLM usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub daily_token_limit: i64,
    #[serde(default)]
    pub alert_threshold_pct: u32,
    #[serde(default)]
    pub strict_enforcement: bool,
    #[serde(default)]
    pub cost_per_million_tokens: HashMap<String, f64>,
}

impl BudgetConfig {
    fn apply_defaults(&mut self) {
        if self.alert_threshold_pct == 0 {
            self.alert_threshold_pct = DEFAULT_ALERT_THRESHOLD_PCT;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.daily_token_limit <= 0 {
            anyhow::bail!("llm config: budget.daily_token_limit must be positive");
        }
        if self.alert_threshold_pct > 100 {
            anyhow::bail!("llm config: budget.alert_threshold_pct must be between 0 and 100");
        }
        for (name, cost) in &self.cost_per_million_tokens {
            if *cost < 0.0 {
                anyhow::bail!(
                    "llm config: budget cost_per_million_tokens[{}] cannot be negative",
                    name
                );
            }
        }
        Ok(())
    }
}

impl LlmConfig {
    /// Reads configuration from a JSON file, applying defaults and
    /// `ZENMUX_*` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        load_dotenv_once();
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("open llm config: {}", path.display()))?;
        let mut cfg: LlmConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parse llm config: {}", path.display()))?;
        cfg.apply_defaults();
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Configuration assembled purely from environment variables.
    pub fn from_env() -> Result<Self> {
        load_dotenv_once();
        let mut cfg = LlmConfig {
            base_url: String::new(),
            api_key: String::new(),
            default_model: String::new(),
            timeout_secs: 0,
            max_retries: 0,
            log_level: String::new(),
            models: HashMap::new(),
            budget: None,
        };
        cfg.apply_defaults();
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Returns the configuration for a model alias.
    pub fn model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.get(name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            anyhow::bail!("llm config: api_key is required");
        }
        if self.base_url.trim().is_empty() {
            anyhow::bail!("llm config: base_url is required");
        }
        if self.default_model.trim().is_empty() {
            anyhow::bail!("llm config: default_model is required");
        }
        if self.timeout_secs == 0 {
            anyhow::bail!("llm config: timeout must be positive");
        }
        if let Some(budget) = &self.budget {
            budget.validate()?;
        }
        Ok(())
    }

    fn apply_defaults(&mut self) {
        if self.base_url.trim().is_empty() {
            self.base_url = DEFAULT_BASE_URL.to_string();
        }
        if self.log_level.trim().is_empty() {
            self.log_level = DEFAULT_LOG_LEVEL.to_string();
        }
        if self.timeout_secs == 0 {
            self.timeout_secs = DEFAULT_TIMEOUT_SECS;
        }
        if self.max_retries == 0 {
            self.max_retries = DEFAULT_MAX_RETRIES;
        }
        if let Some(budget) = &mut self.budget {
            budget.apply_defaults();
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var(ENV_BASE_URL) {
            if !v.is_empty() {
                self.base_url = v;
            }
        }
        if let Ok(v) = env::var(ENV_API_KEY) {
            if !v.is_empty() {
                self.api_key = v;
            }
        }
        if let Ok(v) = env::var(ENV_DEFAULT_MODEL) {
            if !v.is_empty() {
                self.default_model = v;
            }
        }
        if let Ok(v) = env::var(ENV_TIMEOUT) {
            if let Ok(secs) = v.trim().trim_end_matches('s').parse::<u64>() {
                self.timeout_secs = secs;
            }
        }
        if let Ok(v) = env::var(ENV_MAX_RETRIES) {
            if let Ok(retries) = v.trim().parse::<u32>() {
                self.max_retries = retries;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> LlmConfig {
        LlmConfig {
            base_url: "https://example.test/v1".into(),
            api_key: "key".into(),
            default_model: "gpt-5".into(),
            timeout_secs: 30,
            max_retries: 2,
            log_level: "info".into(),
            models: HashMap::new(),
            budget: None,
        }
    }

    #[test]
    fn validates_required_fields() {
        let mut cfg = base_config();
        assert!(cfg.validate().is_ok());
        cfg.api_key.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn budget_validation() {
        let mut budget = BudgetConfig {
            daily_token_limit: 1000,
            alert_threshold_pct: 80,
            strict_enforcement: true,
            cost_per_million_tokens: HashMap::new(),
        };
        assert!(budget.validate().is_ok());
        budget.daily_token_limit = 0;
        assert!(budget.validate().is_err());
    }
}
