//! Decision pipeline: prompt render, budget gate, LLM call, schema
//! validation, normalisation, usage accounting.

pub mod prompt;
pub mod schema;
pub mod types;

pub use prompt::{sha256_hex, PromptTemplate};
pub use schema::SchemaValidator;
pub use types::{
    AccountInfo, CandidateCoin, Decision, DecisionContext, FullDecision, PerformanceView,
    PositionInfo, RawDecision,
};

use crate::clock::{Clock, SystemClock};
use crate::errors::FleetError;
use crate::llm::{BudgetGuard, ChatMessage, ChatRequest, LlmClient, TemplateVersionGuard};
use crate::logger::{self, LogTag};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const MAJOR_COINS: [&str; 2] = ["BTC", "ETH"];

/// Output validation settings for the structured decision payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputValidation {
    pub enabled: bool,
    #[serde(default)]
    pub schema_path: String,
    #[serde(default)]
    pub fail_on_invalid: bool,
}

/// Executor runtime settings, shared by every trader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub major_coin_leverage: u32,
    pub altcoin_leverage: u32,
    pub min_confidence: i32,
    pub min_risk_reward: f64,
    pub max_positions: usize,
    #[serde(default)]
    pub decision_interval_secs: u64,
    #[serde(default)]
    pub decision_timeout_secs: u64,
    #[serde(default)]
    pub max_concurrent_decisions: usize,
    #[serde(default)]
    pub output_validation: OutputValidation,
    #[serde(default)]
    pub prompt_schema_version: String,
    #[serde(default)]
    pub require_version_header: bool,
    #[serde(default)]
    pub strict_mode: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            major_coin_leverage: 20,
            altcoin_leverage: 10,
            min_confidence: 75,
            min_risk_reward: 3.0,
            max_positions: 4,
            decision_interval_secs: 180,
            decision_timeout_secs: 60,
            max_concurrent_decisions: 1,
            output_validation: OutputValidation::default(),
            prompt_schema_version: String::new(),
            require_version_header: false,
            strict_mode: false,
        }
    }
}

impl ExecutorConfig {
    pub fn decision_timeout(&self) -> Duration {
        Duration::from_secs(if self.decision_timeout_secs == 0 {
            60
        } else {
            self.decision_timeout_secs
        })
    }
}

/// Prompt/response pair reported after each successful LLM exchange.
#[derive(Debug, Clone)]
pub struct ConversationRecord {
    pub trader_id: String,
    pub topic: String,
    pub prompt: String,
    pub response: String,
    pub model_name: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub timestamp: DateTime<Utc>,
}

/// Sink for executor conversations. Persistence implements this; recording
/// failures never fail a cycle.
#[async_trait]
pub trait ConversationRecorder: Send + Sync {
    async fn record_conversation(&self, record: ConversationRecord) -> Result<(), FleetError>;
}

pub struct Executor {
    cfg: ExecutorConfig,
    client: Arc<dyn LlmClient>,
    template: PromptTemplate,
    validator: Option<SchemaValidator>,
    budget: Option<Arc<BudgetGuard>>,
    recorder: Option<Arc<dyn ConversationRecorder>>,
    model_alias: String,
    clock: Arc<dyn Clock>,
}

impl Executor {
    pub fn new(
        cfg: ExecutorConfig,
        client: Arc<dyn LlmClient>,
        template_path: &str,
        model_alias: &str,
    ) -> Result<Self, FleetError> {
        let guard = TemplateVersionGuard {
            component: "executor.prompt".into(),
            expected_version: cfg.prompt_schema_version.clone(),
            require_version_header: cfg.require_version_header,
            strict_mode: cfg.strict_mode,
            scan_limit: 0,
        };
        let template = PromptTemplate::load(template_path, Some(&guard))?;
        let validator = if cfg.output_validation.enabled {
            Some(SchemaValidator::new(&cfg.output_validation.schema_path)?)
        } else {
            None
        };
        Ok(Self {
            cfg,
            client,
            template,
            validator,
            budget: None,
            recorder: None,
            model_alias: model_alias.to_string(),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_budget(mut self, budget: Arc<BudgetGuard>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn ConversationRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.cfg
    }

    pub fn template_digest(&self) -> &str {
        self.template.digest()
    }

    /// Runs the full decision pipeline for one cycle.
    pub async fn get_full_decision(
        &self,
        ctx: &DecisionContext,
    ) -> Result<FullDecision, FleetError> {
        self.get_full_decision_for(ctx, "").await
    }

    /// Same as `get_full_decision` with a trader id attached to the
    /// recorded conversation.
    pub async fn get_full_decision_for(
        &self,
        ctx: &DecisionContext,
        trader_id: &str,
    ) -> Result<FullDecision, FleetError> {
        let user_prompt = self.template.render(ctx);

        if let Some(budget) = &self.budget {
            budget.allow_attempt()?;
        }

        let mut request = ChatRequest::new(&self.model_alias);
        request.messages.push(ChatMessage::user(user_prompt.clone()));
        request.json_output = true;

        let response = tokio::time::timeout(
            self.cfg.decision_timeout(),
            self.client.chat_structured(&request),
        )
        .await
        .map_err(|_| {
            FleetError::Llm(format!(
                "decision timed out after {:?}",
                self.cfg.decision_timeout()
            ))
        })??;

        let payload = crate::llm::types::extract_json_body(&response.content).to_string();

        if let Some(validator) = &self.validator {
            if let Err(err) = validator.validate_str(&payload) {
                if self.cfg.output_validation.fail_on_invalid {
                    return Err(err);
                }
                logger::warn(LogTag::Executor, &format!("output validation: {}", err));
            }
        }

        let raw = parse_raw_decisions(&payload)?;
        let mut decisions = Vec::with_capacity(raw.len());
        for item in &raw {
            decisions.push(normalize_decision(item, ctx)?);
        }

        if let Some(budget) = &self.budget {
            let model = if response.model.is_empty() {
                self.model_alias.clone()
            } else {
                response.model.clone()
            };
            let (_, res) = budget.record_usage(&model, response.usage.total_tokens as i64);
            res?;
        }

        if let Some(recorder) = &self.recorder {
            let record = ConversationRecord {
                trader_id: trader_id.to_string(),
                topic: "decision".into(),
                prompt: user_prompt.clone(),
                response: response.content.clone(),
                model_name: response.model.clone(),
                prompt_tokens: response.usage.prompt_tokens,
                completion_tokens: response.usage.completion_tokens,
                total_tokens: response.usage.total_tokens,
                timestamp: self.clock.now_utc(),
            };
            if let Err(err) = recorder.record_conversation(record).await {
                logger::warn(LogTag::Persist, &format!("record conversation: {}", err));
            }
        }

        Ok(FullDecision {
            user_prompt,
            cot_trace: response.reasoning.unwrap_or_default(),
            decisions,
            raw_payload: payload,
            timestamp: self.clock.now_utc(),
        })
    }
}

/// Parses a payload that may be one decision object or an array of them.
pub fn parse_raw_decisions(payload: &str) -> Result<Vec<RawDecision>, FleetError> {
    if payload.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| FleetError::Schema(format!("decision payload decode: {}", e)))?;
    match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| {
                serde_json::from_value(item)
                    .map_err(|e| FleetError::Schema(format!("decision decode: {}", e)))
            })
            .collect(),
        other => Ok(vec![serde_json::from_value(other)
            .map_err(|e| FleetError::Schema(format!("decision decode: {}", e)))?]),
    }
}

/// Normalises one raw decision: uppercases the symbol, maps the signal to an
/// action, clamps leverage to per-asset and major/altcoin caps, clamps
/// confidence into 0..=100.
pub fn normalize_decision(
    raw: &RawDecision,
    ctx: &DecisionContext,
) -> Result<Decision, FleetError> {
    let symbol = raw.symbol.trim().to_uppercase();
    if symbol.is_empty() {
        return Err(FleetError::Schema("normalize: decision missing symbol".into()));
    }

    let action = resolve_action(raw, ctx, &symbol)?;

    let is_major = MAJOR_COINS.contains(&symbol.as_str());
    let default_leverage =
        if is_major { ctx.major_coin_leverage } else { ctx.altcoin_leverage };
    let cap = if is_major { ctx.major_coin_leverage } else { ctx.altcoin_leverage };
    let mut leverage = if raw.leverage <= 0.0 {
        default_leverage
    } else {
        raw.leverage.round() as u32
    };
    if cap > 0 {
        leverage = leverage.min(cap);
    }
    if let Some(meta) = ctx.asset_meta.get(&symbol) {
        if meta.max_leverage > 0.0 {
            leverage = leverage.min(meta.max_leverage.floor() as u32);
        }
    }
    if leverage == 0 {
        leverage = 1;
    }

    let confidence = raw.confidence.round().clamp(0.0, 100.0) as i32;

    Ok(Decision {
        symbol,
        action,
        leverage,
        position_size_usd: raw.position_size_usd,
        entry_price: raw.entry_price,
        stop_loss: raw.stop_loss,
        take_profit: raw.take_profit,
        confidence,
        risk_usd: raw.risk_usd,
        reasoning: raw.reasoning.clone(),
        invalidation_condition: raw.invalidation_condition.clone(),
    })
}

fn resolve_action(
    raw: &RawDecision,
    ctx: &DecisionContext,
    symbol: &str,
) -> Result<String, FleetError> {
    if let Some(signal) = raw.signal.as_deref() {
        let signal = signal.trim().to_lowercase();
        return match signal.as_str() {
            "buy_to_enter" => Ok("open_long".into()),
            "sell_to_enter" => Ok("open_short".into()),
            "hold" => Ok("hold".into()),
            "close" => {
                // A bare close signal resolves against the current book side.
                let side = ctx
                    .positions
                    .iter()
                    .find(|p| p.symbol == symbol)
                    .map(|p| p.side.to_lowercase());
                match side.as_deref() {
                    Some("short") => Ok("close_short".into()),
                    _ => Ok("close_long".into()),
                }
            }
            other => Err(FleetError::Schema(format!("normalize: unknown signal {}", other))),
        };
    }
    if let Some(action) = raw.action.as_deref() {
        let action = action.trim().to_lowercase();
        return match action.as_str() {
            "open_long" | "open_short" | "close_long" | "close_short" | "hold" => Ok(action),
            other => Err(FleetError::Schema(format!("normalize: unknown action {}", other))),
        };
    }
    Err(FleetError::Schema("normalize: decision missing signal".into()))
}

/// Canonical compact form used for replay comparison.
#[derive(Debug, Serialize)]
struct CompactDecision<'a> {
    symbol: &'a str,
    action: &'a str,
    position_size_usd: f64,
    entry_price: f64,
    stop_loss: f64,
    take_profit: f64,
    confidence: i32,
}

/// Serialises decisions into the canonical compact payload. Two decision
/// lists are equivalent iff their normalised payloads match bytewise.
pub fn normalized_payload(decisions: &[Decision]) -> String {
    let compact: Vec<CompactDecision> = decisions
        .iter()
        .map(|d| CompactDecision {
            symbol: &d.symbol,
            action: &d.action,
            position_size_usd: d.position_size_usd,
            entry_price: d.entry_price,
            stop_loss: d.stop_loss,
            take_profit: d.take_profit,
            confidence: d.confidence,
        })
        .collect();
    serde_json::to_string(&compact).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> DecisionContext {
        let mut ctx = DecisionContext::default();
        ctx.major_coin_leverage = 20;
        ctx.altcoin_leverage = 10;
        ctx
    }

    fn raw(json: &str) -> RawDecision {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn maps_signals_to_actions() {
        let c = ctx();
        let d = normalize_decision(
            &raw(r#"{"signal":"buy_to_enter","symbol":"btc ","leverage":5,"confidence":90}"#),
            &c,
        )
        .unwrap();
        assert_eq!(d.symbol, "BTC");
        assert_eq!(d.action, "open_long");
        assert_eq!(d.leverage, 5);

        let d = normalize_decision(
            &raw(r#"{"signal":"sell_to_enter","symbol":"DOGE","confidence":80}"#),
            &c,
        )
        .unwrap();
        assert_eq!(d.action, "open_short");
        assert_eq!(d.leverage, 10, "zero leverage defaults to altcoin cap");
    }

    #[test]
    fn close_resolves_against_book_side() {
        let mut c = ctx();
        c.positions.push(PositionInfo {
            symbol: "SOL".into(),
            side: "short".into(),
            ..Default::default()
        });
        let d = normalize_decision(&raw(r#"{"signal":"close","symbol":"SOL"}"#), &c).unwrap();
        assert_eq!(d.action, "close_short");

        let d = normalize_decision(&raw(r#"{"signal":"close","symbol":"BTC"}"#), &c).unwrap();
        assert_eq!(d.action, "close_long");
    }

    #[test]
    fn clamps_leverage_to_caps() {
        let c = ctx();
        let d = normalize_decision(
            &raw(r#"{"signal":"buy_to_enter","symbol":"BTC","leverage":50}"#),
            &c,
        )
        .unwrap();
        assert_eq!(d.leverage, 20);

        let d = normalize_decision(
            &raw(r#"{"signal":"buy_to_enter","symbol":"PEPE","leverage":50}"#),
            &c,
        )
        .unwrap();
        assert_eq!(d.leverage, 10);
    }

    #[test]
    fn clamps_confidence() {
        let c = ctx();
        let d = normalize_decision(
            &raw(r#"{"signal":"hold","symbol":"BTC","confidence":150}"#),
            &c,
        )
        .unwrap();
        assert_eq!(d.confidence, 100);
    }

    #[test]
    fn rejects_unknown_signal() {
        let c = ctx();
        assert!(normalize_decision(&raw(r#"{"signal":"yolo","symbol":"BTC"}"#), &c).is_err());
    }

    #[test]
    fn accepts_pre_normalised_action() {
        let c = ctx();
        let d = normalize_decision(
            &raw(r#"{"action":"close_long","symbol":"BTC","confidence":70}"#),
            &c,
        )
        .unwrap();
        assert_eq!(d.action, "close_long");
    }

    #[test]
    fn normalized_payload_round_trips() {
        let c = ctx();
        let payload = r#"[{"signal":"buy_to_enter","symbol":"BTC","leverage":5,"position_size_usd":200,"entry_price":100,"stop_loss":95,"take_profit":115,"risk_usd":10,"confidence":90}]"#;
        let first: Vec<Decision> = parse_raw_decisions(payload)
            .unwrap()
            .iter()
            .map(|r| normalize_decision(r, &c).unwrap())
            .collect();
        let second: Vec<Decision> = parse_raw_decisions(payload)
            .unwrap()
            .iter()
            .map(|r| normalize_decision(r, &c).unwrap())
            .collect();
        assert_eq!(normalized_payload(&first), normalized_payload(&second));
    }
}
