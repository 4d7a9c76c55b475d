//! Error kinds shared across the manager, executor and persistence layers.
//!
//! The propagation policy depends on the kind, not the message: risk
//! violations reject a single decision, budget exhaustion pauses a trader,
//! journal failures skip DB mirroring, and DB/cache failures never fail a
//! cycle.

use std::fmt;

/// Typed error for every failure the orchestrator reacts to.
#[derive(Debug, Clone)]
pub enum FleetError {
    /// Symbol is already owned by another trader.
    SymbolOwned { symbol: String, owner: String },
    /// A secondary risk guard rejected a decision.
    RiskViolation(String),
    /// Daily LLM token budget is exhausted.
    BudgetExceeded,
    /// Prompt template could not be rendered.
    PromptRender(String),
    /// Decision payload failed schema validation.
    Schema(String),
    /// LLM transport or timeout failure.
    Llm(String),
    /// Exchange order submission failure.
    Exchange(String),
    /// Journal append or read failure.
    JournalIo(String),
    /// Database write/read failure.
    Db(String),
    /// Configuration load or validation failure.
    Config(String),
}

impl fmt::Display for FleetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FleetError::SymbolOwned { symbol, owner } => {
                write!(f, "symbol {} already owned by trader {}", symbol, owner)
            }
            FleetError::RiskViolation(reason) => write!(f, "risk violation: {}", reason),
            FleetError::BudgetExceeded => {
                write!(f, "llm budget exhausted for current period")
            }
            FleetError::PromptRender(msg) => write!(f, "prompt render: {}", msg),
            FleetError::Schema(msg) => write!(f, "schema validation: {}", msg),
            FleetError::Llm(msg) => write!(f, "llm: {}", msg),
            FleetError::Exchange(msg) => write!(f, "exchange: {}", msg),
            FleetError::JournalIo(msg) => write!(f, "journal: {}", msg),
            FleetError::Db(msg) => write!(f, "db: {}", msg),
            FleetError::Config(msg) => write!(f, "config: {}", msg),
        }
    }
}

impl std::error::Error for FleetError {}

impl FleetError {
    /// True when the failure should pause the trader until the next UTC day.
    pub fn pauses_trader(&self) -> bool {
        matches!(self, FleetError::BudgetExceeded)
    }

    /// True for failures that must never fail a decision cycle.
    pub fn is_best_effort(&self) -> bool {
        matches!(self, FleetError::Db(_))
    }
}
