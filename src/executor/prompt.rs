//! Prompt template loading and rendering.
//!
//! A template is a plain text file with an optional `{{context}}`
//! placeholder. The rendered context is a sectioned plain-text digest of the
//! decision inputs; when the placeholder is absent the digest is appended.

use crate::errors::FleetError;
use crate::executor::types::DecisionContext;
use crate::llm::TemplateVersionGuard;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

const CONTEXT_PLACEHOLDER: &str = "{{context}}";

pub struct PromptTemplate {
    path: PathBuf,
    content: String,
    digest: String,
    version: String,
}

impl PromptTemplate {
    /// Loads the template, applying the optional version guard.
    pub fn load(
        path: impl AsRef<Path>,
        guard: Option<&TemplateVersionGuard>,
    ) -> Result<Self, FleetError> {
        let path = path.as_ref();
        let version = match guard {
            Some(g) => g.enforce(path)?,
            None => String::new(),
        };
        let content = fs::read_to_string(path).map_err(|e| {
            FleetError::PromptRender(format!("read prompt template {}: {}", path.display(), e))
        })?;
        if content.trim().is_empty() {
            return Err(FleetError::PromptRender(format!(
                "prompt template {} is empty",
                path.display()
            )));
        }
        let digest = sha256_hex(content.as_bytes());
        Ok(Self { path: path.to_path_buf(), content, digest, version })
    }

    /// Renders the user prompt for one decision cycle.
    pub fn render(&self, ctx: &DecisionContext) -> String {
        let digest = render_context_digest(ctx);
        if self.content.contains(CONTEXT_PLACEHOLDER) {
            self.content.replace(CONTEXT_PLACEHOLDER, &digest)
        } else {
            format!("{}\n\n{}", self.content.trim_end(), digest)
        }
    }

    /// Template content digest for version tracking.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Builds the sectioned context digest fed into the template.
fn render_context_digest(ctx: &DecisionContext) -> String {
    let mut out = String::new();
    out.push_str(&format!("Current Time: {}\n", ctx.current_time));
    if ctx.runtime_minutes > 0 {
        out.push_str(&format!("Runtime Minutes: {}\n", ctx.runtime_minutes));
    }
    out.push('\n');

    out.push_str("=== Account ===\n");
    out.push_str(&format!(
        "Equity: {:.2} | Available: {:.2} | Margin Used: {:.2} ({:.1}%) | Positions: {}\n\n",
        ctx.account.total_equity,
        ctx.account.available_balance,
        ctx.account.margin_used,
        ctx.account.margin_used_pct,
        ctx.account.position_count
    ));

    if !ctx.positions.is_empty() {
        out.push_str("=== Open Positions ===\n");
        for pos in &ctx.positions {
            out.push_str(&format!(
                "{} {} qty={:.6} entry={:.4} mark={:.4} lev={}x upnl={:.2}\n",
                pos.symbol,
                pos.side,
                pos.quantity,
                pos.entry_price,
                pos.mark_price,
                pos.leverage,
                pos.unrealized_pnl
            ));
        }
        out.push('\n');
    }

    if !ctx.candidate_coins.is_empty() {
        out.push_str("=== Candidate Symbols ===\n");
        let symbols: Vec<&str> = ctx.candidate_coins.iter().map(|c| c.symbol.as_str()).collect();
        out.push_str(&symbols.join(", "));
        out.push_str("\n\n");
    }

    if !ctx.market_data.is_empty() {
        out.push_str("=== Market Data ===\n");
        let mut symbols: Vec<&String> = ctx.market_data.keys().collect();
        symbols.sort();
        for symbol in symbols {
            let snap = &ctx.market_data[symbol];
            out.push_str(&format!(
                "{}: price={:.6} chg1h={:.2}% chg4h={:.2}%",
                symbol, snap.price.last, snap.change.one_hour, snap.change.four_hour
            ));
            if let Some(oi) = &snap.open_interest {
                out.push_str(&format!(" oi={:.0}", oi.latest));
            }
            if let Some(funding) = &snap.funding {
                out.push_str(&format!(" funding={:.6}", funding.rate));
            }
            out.push('\n');
        }
        out.push('\n');
    }

    if let Some(perf) = &ctx.performance {
        out.push_str("=== Performance ===\n");
        out.push_str(&format!(
            "Sharpe: {:.3} | Win Rate: {:.1}% | Trades: {}\n\n",
            perf.sharpe_ratio,
            perf.win_rate * 100.0,
            perf.total_trades
        ));
    }

    out.push_str("=== Constraints ===\n");
    out.push_str(&format!(
        "Max Position Size USD: {:.2} | Major Leverage: {}x | Altcoin Leverage: {}x\n",
        ctx.max_position_size_usd, ctx.major_coin_leverage, ctx.altcoin_leverage
    ));
    if ctx.max_margin_usage_pct > 0.0 {
        out.push_str(&format!("Max Margin Usage: {:.1}%\n", ctx.max_margin_usage_pct));
    }
    if ctx.max_risk_pct > 0.0 {
        out.push_str(&format!(
            "Max Risk Per Trade: {:.1}% of equity ({:.2} USD)\n",
            ctx.max_risk_pct,
            ctx.account.total_equity * ctx.max_risk_pct / 100.0
        ));
    }
    if ctx.liquidity_threshold_usd > 0.0 {
        out.push_str(&format!(
            "Liquidity Floor: open interest notional >= {:.0} USD\n",
            ctx.liquidity_threshold_usd
        ));
    }
    if let Some(band) = position_value_band(
        ctx.account.total_equity,
        ctx.btc_eth_position_value_min_multiple,
        ctx.btc_eth_position_value_max_multiple,
    ) {
        out.push_str(&format!("BTC/ETH Position Value: {}\n", band));
    }
    if let Some(band) = position_value_band(
        ctx.account.total_equity,
        ctx.alt_position_value_min_multiple,
        ctx.alt_position_value_max_multiple,
    ) {
        out.push_str(&format!("Altcoin Position Value: {}\n", band));
    }
    if !ctx.recently_closed.is_empty() {
        let mut cooled: Vec<&String> = ctx.recently_closed.keys().collect();
        cooled.sort();
        let names: Vec<&str> = cooled.iter().map(|s| s.as_str()).collect();
        out.push_str(&format!("Recently Closed (cooldown): {}\n", names.join(", ")));
    }
    out.push_str("\nAnalyze the data and respond with your decision.");
    out
}

/// Renders a position-value band like `0.50x-2.00x equity (500.00-2000.00
/// USD)`. One-sided bounds render as `at least`/`up to`; None when both
/// multiples are unset.
fn position_value_band(equity: f64, min_multiple: f64, max_multiple: f64) -> Option<String> {
    let usd = |multiple: f64| {
        if equity > 0.0 {
            format!(" ({:.2} USD)", equity * multiple)
        } else {
            String::new()
        }
    };
    match (min_multiple > 0.0, max_multiple > 0.0) {
        (true, true) => {
            let mut band = format!("{:.2}x-{:.2}x equity", min_multiple, max_multiple);
            if equity > 0.0 {
                band.push_str(&format!(
                    " ({:.2}-{:.2} USD)",
                    equity * min_multiple,
                    equity * max_multiple
                ));
            }
            Some(band)
        }
        (true, false) => Some(format!(
            "at least {:.2}x equity{}",
            min_multiple,
            usd(min_multiple)
        )),
        (false, true) => Some(format!(
            "up to {:.2}x equity{}",
            max_multiple,
            usd(max_multiple)
        )),
        (false, false) => None,
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn renders_placeholder_template() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{{/* Version: v1.0.0 */}}\nYou are a trader.\n{{context}}\n").unwrap();
        let template = PromptTemplate::load(file.path(), None).unwrap();

        let mut ctx = DecisionContext::default();
        ctx.current_time = "2025-01-01T00:00:00Z".into();
        ctx.account.total_equity = 1000.0;
        let rendered = template.render(&ctx);
        assert!(rendered.contains("You are a trader."));
        assert!(rendered.contains("Equity: 1000.00"));
        assert!(!rendered.contains(CONTEXT_PLACEHOLDER));
    }

    #[test]
    fn renders_all_primary_guard_constraints() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{{context}}").unwrap();
        let template = PromptTemplate::load(file.path(), None).unwrap();

        let mut ctx = DecisionContext::default();
        ctx.account.total_equity = 1000.0;
        ctx.max_position_size_usd = 500.0;
        ctx.max_margin_usage_pct = 30.0;
        ctx.max_risk_pct = 3.0;
        ctx.liquidity_threshold_usd = 50_000.0;
        ctx.btc_eth_position_value_min_multiple = 0.5;
        ctx.btc_eth_position_value_max_multiple = 2.0;
        ctx.alt_position_value_max_multiple = 1.0;
        ctx.recently_closed
            .insert("DOGE".into(), chrono::Utc::now());

        let rendered = template.render(&ctx);
        assert!(rendered.contains("Max Position Size USD: 500.00"));
        assert!(rendered.contains("Max Margin Usage: 30.0%"));
        assert!(rendered.contains("Max Risk Per Trade: 3.0% of equity (30.00 USD)"));
        assert!(rendered.contains("Liquidity Floor: open interest notional >= 50000 USD"));
        assert!(rendered.contains("BTC/ETH Position Value: 0.50x-2.00x equity (500.00-2000.00 USD)"));
        assert!(rendered.contains("Altcoin Position Value: up to 1.00x equity (1000.00 USD)"));
        assert!(rendered.contains("Recently Closed (cooldown): DOGE"));
    }

    #[test]
    fn digest_is_stable() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"body").unwrap();
        let a = PromptTemplate::load(file.path(), None).unwrap();
        let b = PromptTemplate::load(file.path(), None).unwrap();
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);
    }
}
