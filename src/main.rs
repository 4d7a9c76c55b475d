use clap::Parser;
use fleetbot::cache::CacheStore;
use fleetbot::clock::SystemClock;
use fleetbot::config::AppConfig;
use fleetbot::exchange::SimProvider;
use fleetbot::journal::Store;
use fleetbot::llm::{config::load_dotenv_once, BudgetGuard, LlmConfig, ZenmuxClient};
use fleetbot::logger::{self, LogTag};
use fleetbot::manager::{Manager, ManagerDeps};
use fleetbot::market::StaticMarketProvider;
use fleetbot::persistence::{Database, Service};
use std::sync::Arc;

/// Multi-tenant LLM trading orchestrator.
#[derive(Debug, Parser)]
#[command(name = "fleetbot", version)]
struct Args {
    /// Path to the application config file.
    #[arg(long, default_value = "etc/fleetbot.json")]
    config: String,

    /// Emit full prompts/responses to logs.
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    logger::init();
    load_dotenv_once();

    let args = Args::parse();
    logger::set_verbose_logging(args.verbose);
    logger::info(LogTag::System, "fleetbot starting up");

    let config = match AppConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            logger::error(LogTag::System, &format!("config load failed: {:#}", err));
            std::process::exit(1);
        }
    };

    let llm_cfg = match &config.llm {
        Some(cfg) => cfg.clone(),
        None => match LlmConfig::from_env() {
            Ok(cfg) => cfg,
            Err(err) => {
                logger::error(LogTag::System, &format!("llm config: {:#}", err));
                std::process::exit(1);
            }
        },
    };
    let budget = llm_cfg
        .budget
        .as_ref()
        .and_then(BudgetGuard::new)
        .map(Arc::new);
    let llm = match ZenmuxClient::new(llm_cfg) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            logger::error(LogTag::System, &format!("llm client: {}", err));
            std::process::exit(1);
        }
    };

    let (persistence, recorder) = if config.persistence.enabled {
        let db = match Database::new(&config.persistence.db_path) {
            Ok(db) => Arc::new(db),
            Err(err) => {
                logger::error(LogTag::System, &format!("database: {:#}", err));
                std::process::exit(1);
            }
        };
        let cache = match &config.persistence.redis_url {
            Some(url) => match CacheStore::redis(url) {
                Ok(store) => {
                    logger::info(LogTag::System, "redis cache configured");
                    Arc::new(store)
                }
                Err(err) => {
                    logger::error(LogTag::System, &format!("redis: {}", err));
                    std::process::exit(1);
                }
            },
            None => Arc::new(CacheStore::memory()),
        };
        let service = Arc::new(Service::new(db, cache, config.persistence.ttl));
        (
            Some(service.clone() as Arc<dyn fleetbot::manager::PersistenceService>),
            Some(service as Arc<dyn fleetbot::executor::ConversationRecorder>),
        )
    } else {
        (None, None)
    };

    // Exchange and market adapters are wired behind their interfaces; the
    // sim pair stands in until a live venue adapter is configured.
    let exchange = Arc::new(SimProvider::new(0.0));
    let market = Arc::new(StaticMarketProvider::new());

    let deps = ManagerDeps {
        executor_cfg: config.executor.clone(),
        llm,
        budget,
        recorder,
        exchange,
        market,
        journal: Arc::new(Store::new(&config.journal_dir)),
        persistence,
        clock: Arc::new(SystemClock),
    };

    let manager = match Manager::new(config.manager.clone(), deps) {
        Ok(manager) => manager,
        Err(err) => {
            logger::error(LogTag::System, &format!("manager init: {}", err));
            std::process::exit(1);
        }
    };

    if let Err(err) = manager.start().await {
        logger::error(LogTag::System, &format!("manager start: {}", err));
        std::process::exit(1);
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        logger::error(LogTag::System, &format!("signal wait: {}", err));
    }
    logger::info(LogTag::System, "shutdown requested");
    manager.stop().await;
    logger::info(LogTag::System, "fleetbot stopped");
}
