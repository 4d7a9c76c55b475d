//! Manager coordinator: lifecycle, allocation, config reload and fan-out
//! of one trader loop per virtual trader.

pub mod config_sync;
pub mod registry;
pub mod risk;
pub mod trader_loop;
pub mod types;

pub use config_sync::{ConfigSync, ConfigSyncResult, TraderConfigRecord};
pub use registry::PositionRegistry;
pub use risk::enforce_secondary_risk;
pub use trader_loop::{CycleOutcome, LoopDeps, TraderLoop};
pub use types::{
    normalize_symbol, AccountSyncSnapshot, AnalyticsSnapshot, DecisionCycleEvent, ManagerConfig,
    PersistenceService, PositionEvent, PositionEventKind, ResourceAllocation, RiskParameters,
    RuntimeState, RuntimeStateEvent, SymbolCooldown, TraderConfig, VirtualPosition, VirtualTrader,
};

use crate::clock::Clock;
use crate::errors::FleetError;
use crate::exchange::ExchangeProvider;
use crate::executor::{ConversationRecorder, Executor, ExecutorConfig};
use crate::journal::Store;
use crate::llm::{BudgetGuard, LlmClient};
use crate::logger::{self, LogTag};
use crate::market::MarketProvider;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock, Semaphore};
use tokio::task::JoinHandle;

/// External collaborators handed to the manager at construction.
pub struct ManagerDeps {
    pub executor_cfg: ExecutorConfig,
    pub llm: Arc<dyn LlmClient>,
    pub budget: Option<Arc<BudgetGuard>>,
    pub recorder: Option<Arc<dyn ConversationRecorder>>,
    pub exchange: Arc<dyn ExchangeProvider>,
    pub market: Arc<dyn MarketProvider>,
    pub journal: Arc<Store>,
    pub persistence: Option<Arc<dyn PersistenceService>>,
    pub clock: Arc<dyn Clock>,
}

struct TraderEntry {
    trader: Arc<VirtualTrader>,
    loop_deps: Arc<LoopDeps>,
    cancel_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

/// Outcome of a reload diff.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReloadSummary {
    pub inserted: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
}

pub struct Manager {
    cfg: RwLock<ManagerConfig>,
    deps: ManagerDeps,
    registry: Arc<PositionRegistry>,
    traders: RwLock<HashMap<String, TraderEntry>>,
    semaphore: Option<Arc<Semaphore>>,
}

impl Manager {
    pub fn new(cfg: ManagerConfig, deps: ManagerDeps) -> Result<Self, FleetError> {
        cfg.validate()?;
        let semaphore = if cfg.max_concurrent_decisions > 0 {
            Some(Arc::new(Semaphore::new(cfg.max_concurrent_decisions)))
        } else {
            None
        };
        Ok(Self {
            cfg: RwLock::new(cfg),
            deps,
            registry: Arc::new(PositionRegistry::new()),
            traders: RwLock::new(HashMap::new()),
            semaphore,
        })
    }

    pub fn registry(&self) -> Arc<PositionRegistry> {
        Arc::clone(&self.registry)
    }

    pub async fn trader(&self, trader_id: &str) -> Option<Arc<VirtualTrader>> {
        self.traders
            .read()
            .await
            .get(trader_id)
            .map(|entry| Arc::clone(&entry.trader))
    }

    /// Loads configs, hydrates caches, reconciles exchange positions and
    /// spawns one loop per auto-start trader.
    pub async fn start(&self) -> Result<(), FleetError> {
        let configs = self.cfg.read().await.traders.clone();
        let ids: Vec<String> = configs.iter().map(|c| c.id.clone()).collect();

        if let Some(persistence) = &self.deps.persistence {
            if let Err(err) = persistence.hydrate_caches(&ids).await {
                logger::error(LogTag::Manager, &format!("cache hydration: {}", err));
            }
        }

        for config in configs {
            self.install_trader(config).await?;
        }

        match self.deps.exchange.account().await {
            Ok(account) => self.allocate(account.total_equity).await,
            Err(err) => {
                logger::warn(LogTag::Manager, &format!("equity snapshot unavailable: {}", err))
            }
        }

        if let Err(err) = self.reconcile_positions().await {
            logger::error(LogTag::Manager, &format!("position reconcile: {}", err));
        }

        logger::info(
            LogTag::Manager,
            &format!("started with {} traders", self.traders.read().await.len()),
        );
        Ok(())
    }

    /// Builds the trader runtime and spawns its loop when auto-start is set.
    async fn install_trader(&self, config: TraderConfig) -> Result<(), FleetError> {
        let executor = Executor::new(
            self.deps.executor_cfg.clone(),
            Arc::clone(&self.deps.llm),
            &config.prompt_template,
            "",
        )?;
        let mut executor = executor.with_clock(Arc::clone(&self.deps.clock));
        if let Some(budget) = &self.deps.budget {
            executor = executor.with_budget(Arc::clone(budget));
        }
        if let Some(recorder) = &self.deps.recorder {
            executor = executor.with_recorder(Arc::clone(recorder));
        }

        let auto_start = config.auto_start;
        let trader = Arc::new(VirtualTrader::new(config));
        let loop_deps = Arc::new(LoopDeps::new(
            Arc::clone(&trader),
            Arc::clone(&self.registry),
            Arc::new(executor),
            Arc::clone(&self.deps.exchange),
            Arc::clone(&self.deps.market),
            Arc::clone(&self.deps.journal),
            self.deps.persistence.clone(),
            Arc::clone(&self.deps.clock),
            self.semaphore.clone(),
        ));

        if let Some(persistence) = &self.deps.persistence {
            match persistence.load_cooldowns(&trader.id).await {
                Ok(cooldowns) => loop_deps.set_cooldowns(cooldowns),
                Err(err) => logger::warn(
                    LogTag::Manager,
                    &format!("{}: cooldown load: {}", trader.id, err),
                ),
            }
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = if auto_start {
            Some(TraderLoop::spawn(Arc::clone(&loop_deps), cancel_rx))
        } else {
            None
        };

        let id = trader.id.clone();
        self.traders.write().await.insert(
            id,
            TraderEntry { trader, loop_deps, cancel_tx, handle },
        );
        Ok(())
    }

    /// Recomputes each trader's virtual equity from the account total.
    pub async fn allocate(&self, total_equity: f64) {
        let entries = self.traders.read().await;
        for entry in entries.values() {
            let pct = entry.trader.config.read().await.allocation_pct;
            let equity = total_equity * pct / 100.0;
            {
                let mut alloc = entry.trader.resource_alloc.write().await;
                alloc.current_equity_usd = equity;
            }
            if let Some(persistence) = &self.deps.persistence {
                let snapshot = AccountSyncSnapshot {
                    trader_id: entry.trader.id.clone(),
                    equity_usd: equity,
                    available_balance_usd: equity,
                    unrealized_pnl_usd: 0.0,
                    synced_at: Some(self.deps.clock.now_utc()),
                };
                if let Err(err) = persistence.record_account_snapshot(snapshot).await {
                    logger::error(
                        LogTag::Persist,
                        &format!("{}: account snapshot: {}", entry.trader.id, err),
                    );
                }
            }
        }
    }

    /// Assigns ownerless exchange positions to the first eligible
    /// auto-start trader; positions nobody can take stay ownerless.
    async fn reconcile_positions(&self) -> Result<(), FleetError> {
        let positions = self.deps.exchange.positions().await?;
        let entries = self.traders.read().await;
        let mut ids: Vec<&String> = entries.keys().collect();
        ids.sort();

        for position in &positions {
            let symbol = normalize_symbol(&position.symbol);
            if self.registry.owner(&symbol).is_some() {
                continue;
            }
            let now = self.deps.clock.now_utc();
            for id in &ids {
                let entry = &entries[*id];
                let config = entry.trader.config.read().await.clone();
                if !config.auto_start {
                    continue;
                }
                let cooled = entry
                    .loop_deps
                    .cooldowns
                    .lock()
                    .unwrap()
                    .get(&symbol)
                    .map(|until| now < *until)
                    .unwrap_or(false);
                if cooled {
                    continue;
                }
                if config.risk_params.max_positions > 0
                    && self.registry.position_count(id) >= config.risk_params.max_positions
                {
                    continue;
                }
                let assigned = self.registry.assign(
                    id,
                    VirtualPosition {
                        symbol: symbol.clone(),
                        side: position.side.to_lowercase(),
                        quantity: position.quantity,
                        entry_price: position.entry_price,
                        leverage: position.leverage.round().max(1.0) as u32,
                        confidence: 0,
                        risk_usd: 0.0,
                        opened_at_ms: now.timestamp_millis(),
                        exchange: config.exchange_provider.clone(),
                    },
                );
                if assigned.is_ok() {
                    logger::info(
                        LogTag::Manager,
                        &format!("reconciled {} to trader {}", symbol, id),
                    );
                    break;
                }
            }
        }
        Ok(())
    }

    /// Diffs the new roster against live traders. For each change the old
    /// loop stops, the config swaps and a fresh loop starts; virtual
    /// positions survive the swap because the registry book is keyed by
    /// trader id. A validation failure rejects the whole roster and the
    /// live traders keep their prior configs.
    pub async fn reload(&self, new_configs: Vec<TraderConfig>) -> Result<ReloadSummary, FleetError> {
        let candidate = {
            let current = self.cfg.read().await;
            ManagerConfig {
                reserve_equity_pct: current.reserve_equity_pct,
                max_concurrent_decisions: current.max_concurrent_decisions,
                traders: new_configs.clone(),
            }
        };
        candidate.validate()?;

        let mut summary = ReloadSummary::default();
        let existing_ids: Vec<String> = self.traders.read().await.keys().cloned().collect();

        for config in &new_configs {
            let current = match self.trader(&config.id).await {
                Some(trader) => Some(trader.config.read().await.clone()),
                None => None,
            };
            match current {
                None => {
                    self.install_trader(config.clone()).await?;
                    summary.inserted.push(config.id.clone());
                }
                Some(old) if config_changed(&old, config) => {
                    // Cycle numbering stays monotonic across the swap; the
                    // registry book is keyed by trader id and survives too.
                    let prior_cycles = match self.trader(&config.id).await {
                        Some(trader) => trader.runtime.read().await.cycle_number,
                        None => 0,
                    };
                    self.stop_trader(&config.id, false).await;
                    self.install_trader(config.clone()).await?;
                    if let Some(trader) = self.trader(&config.id).await {
                        trader.runtime.write().await.cycle_number = prior_cycles;
                    }
                    summary.updated.push(config.id.clone());
                }
                Some(_) => summary.unchanged.push(config.id.clone()),
            }
        }

        for id in existing_ids {
            if !new_configs.iter().any(|c| c.id == id) {
                self.stop_trader(&id, true).await;
                summary.removed.push(id);
            }
        }

        *self.cfg.write().await = candidate;
        logger::info(
            LogTag::Manager,
            &format!(
                "reload: {} inserted, {} updated, {} removed, {} unchanged",
                summary.inserted.len(),
                summary.updated.len(),
                summary.removed.len(),
                summary.unchanged.len()
            ),
        );
        Ok(summary)
    }

    async fn stop_trader(&self, trader_id: &str, drop_book: bool) {
        let entry = self.traders.write().await.remove(trader_id);
        if let Some(entry) = entry {
            let _ = entry.cancel_tx.send(true);
            if let Some(handle) = entry.handle {
                let _ = handle.await;
            }
            if drop_book {
                self.registry.remove_trader(trader_id);
            }
        }
    }

    /// Cancels all loops and flushes state. In-flight cycles finish their
    /// journal write before the loop observes the cancellation.
    pub async fn stop(&self) {
        let ids: Vec<String> = self.traders.read().await.keys().cloned().collect();
        for id in ids {
            let entry = self.traders.write().await.remove(&id);
            if let Some(entry) = entry {
                let _ = entry.cancel_tx.send(true);
                if let Some(handle) = entry.handle {
                    let _ = handle.await;
                }
                if let Some(persistence) = &self.deps.persistence {
                    let config_version = entry.trader.config.read().await.version;
                    let mut state = entry.trader.runtime.read().await.clone();
                    state.running = false;
                    let event = RuntimeStateEvent {
                        trader_id: entry.trader.id.clone(),
                        active_config_version: config_version,
                        is_running: false,
                        state,
                    };
                    if let Err(err) = persistence.upsert_runtime_state(event).await {
                        logger::error(
                            LogTag::Persist,
                            &format!("{}: final runtime state: {}", id, err),
                        );
                    }
                }
            }
        }
        logger::info(LogTag::Manager, "stopped");
    }

    /// Runs one cycle for a trader outside its schedule. Used by tooling
    /// and tests; respects the same in-flight guard as the loop.
    pub async fn run_cycle_for(&self, trader_id: &str) -> Option<CycleOutcome> {
        let deps = self
            .traders
            .read()
            .await
            .get(trader_id)
            .map(|entry| Arc::clone(&entry.loop_deps))?;
        Some(TraderLoop::run_cycle(&deps).await)
    }
}

fn config_changed(old: &TraderConfig, new: &TraderConfig) -> bool {
    serde_json::to_string(old).ok() != serde_json::to_string(new).ok()
}
