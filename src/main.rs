use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};

use rsibot::api::BybitClient;
use rsibot::config::{AppConfig, ExchangeKind, StorageSettings};
use rsibot::db::PostgresTradeHistory;
use rsibot::exchange::{ExchangeClient, PaperExchange};
use rsibot::notify::TracingNotifier;
use rsibot::persistence::{
    FileMaturityStore, JsonFileStore, JsonlTradeHistory, LoadedState, MaturityStore,
    PersistedState, RedisMaturityStore, StateStore, TradeHistory,
};
use rsibot::strategy::{generate_signal, MarketContext};
use rsibot::{CoreDeps, TradingCore, Workers};

/// RSI mean-reversion bots for perpetual futures.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Extra configuration file layered over config/default
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trading engine until Ctrl+C
    Run {
        /// Simulate fills locally, whatever the configured exchange
        #[arg(long)]
        paper: bool,
    },
    /// List the bots in the state file
    Bots,
    /// Compute the current signal for one symbol
    Signal {
        /// e.g. "BTCUSDT"
        symbol: String,
    },
    /// Show recent completed trades
    Trades {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Discard a quarantined bot entry so the symbol can trade again
    Resolve { symbol: String },
    /// Print the effective configuration (secrets redacted)
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Run { paper } => run(config, paper).await,
        Commands::Bots => list_bots(&config.storage).await,
        Commands::Signal { symbol } => show_signal(&config, &symbol.to_uppercase()).await,
        Commands::Trades { limit } => show_trades(&config.storage, limit).await,
        Commands::Resolve { symbol } => resolve(&config.storage, &symbol.to_uppercase()).await,
        Commands::Config => {
            let mut redacted = config.clone();
            if !redacted.exchange.api_secret.is_empty() {
                redacted.exchange.api_secret = "***".to_string();
            }
            println!("{}", serde_json::to_string_pretty(&redacted)?);
            Ok(())
        }
    }
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rsibot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// ============================================================================
// Wiring
// ============================================================================

fn build_exchange(config: &AppConfig, force_paper: bool) -> anyhow::Result<Arc<dyn ExchangeClient>> {
    let timeout = Duration::from_secs(config.engine.exchange_timeout_secs);
    let leverage = config.autobot.leverage;
    let balance = config.exchange.paper_initial_balance;

    let exchange: Arc<dyn ExchangeClient> = match (config.exchange.kind, force_paper) {
        (ExchangeKind::Bybit, false) => Arc::new(BybitClient::new(&config.exchange, timeout)?),
        (ExchangeKind::Bybit, true) => {
            // Live market data, simulated orders
            let source: Arc<dyn ExchangeClient> =
                Arc::new(BybitClient::new(&config.exchange, timeout)?);
            Arc::new(PaperExchange::with_market_data(source, balance, leverage))
        }
        (ExchangeKind::Paper, _) => {
            let mut public = config.exchange.clone();
            public.api_key.clear();
            public.api_secret.clear();
            let source: Arc<dyn ExchangeClient> = Arc::new(BybitClient::new(&public, timeout)?);
            Arc::new(PaperExchange::with_market_data(source, balance, leverage))
        }
    };
    Ok(exchange)
}

async fn build_maturity(storage: &StorageSettings) -> anyhow::Result<Arc<dyn MaturityStore>> {
    if let Some(url) = &storage.redis_url {
        match RedisMaturityStore::new(url).await {
            Ok(store) => return Ok(Arc::new(store)),
            Err(e) => tracing::warn!("Redis unavailable ({}), using maturity file", e),
        }
    }
    Ok(Arc::new(FileMaturityStore::open(&storage.maturity_path).await?))
}

async fn build_history(storage: &StorageSettings) -> anyhow::Result<Arc<dyn TradeHistory>> {
    if let Some(url) = &storage.database_url {
        match PostgresTradeHistory::new(url).await {
            Ok(history) => return Ok(Arc::new(history)),
            Err(e) => tracing::warn!("Postgres unavailable ({}), using trade history file", e),
        }
    }
    Ok(Arc::new(JsonlTradeHistory::open(&storage.history_path).await?))
}

// ============================================================================
// Commands
// ============================================================================

async fn run(config: AppConfig, paper: bool) -> anyhow::Result<()> {
    tracing::info!("🚀 rsibot starting");
    tracing::info!(
        "  Exchange: {:?}{}",
        config.exchange.kind,
        if paper { " (paper)" } else { "" }
    );
    tracing::info!("  Timeframe: {}", config.autobot.timeframe);
    tracing::info!(
        "  RSI {} / {} (exit {} / {})",
        config.autobot.rsi_oversold,
        config.autobot.rsi_overbought,
        config.autobot.rsi_exit_long,
        config.autobot.rsi_exit_short
    );
    tracing::info!(
        "  Max bots: {}, risk cap {}%, leverage {}x",
        config.autobot.max_concurrent_bots,
        config.autobot.risk_cap_percent,
        config.autobot.leverage
    );

    let deps = CoreDeps {
        exchange: build_exchange(&config, paper)?,
        store: Arc::new(JsonFileStore::new(&config.storage.state_path)),
        maturity: build_maturity(&config.storage).await?,
        history: build_history(&config.storage).await?,
        notifier: Arc::new(TracingNotifier),
    };

    let core = TradingCore::start(
        deps,
        config.engine.clone(),
        config.autobot.clone(),
        config.exchange.symbols.clone(),
    )
    .await
    .context("starting trading core")?;

    tracing::info!(
        "✅ Core ready: {} bots, {} symbols watched",
        core.list_bots().len(),
        core.watchlist().len()
    );
    for q in core.quarantined() {
        tracing::warn!("  ⚠️  {} quarantined: {}", q.symbol, q.reason);
    }

    let workers = Workers::spawn(Arc::clone(&core));
    tracing::info!("Press Ctrl+C to stop...");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl+C, shutting down...");

    workers.shutdown().await;
    core.persist().await?;
    tracing::info!("👋 rsibot stopped");
    Ok(())
}

async fn load_state(storage: &StorageSettings) -> anyhow::Result<Option<LoadedState>> {
    let store = JsonFileStore::new(&storage.state_path);
    Ok(store
        .load()
        .await?
        .map(|state| LoadedState::decode(state, Utc::now())))
}

async fn list_bots(storage: &StorageSettings) -> anyhow::Result<()> {
    let Some(state) = load_state(storage).await? else {
        println!("No state file at {}", storage.state_path.display());
        return Ok(());
    };

    println!(
        "{:<14} {:<18} {:>12} {:>12} {:>9} {:>9}  auto",
        "symbol", "status", "entry", "last", "pnl%", "max%"
    );
    for bot in &state.bots {
        println!(
            "{:<14} {:<18} {:>12} {:>12} {:>9.2} {:>9.2}  {}",
            bot.symbol,
            format!("{:?}", bot.status),
            bot.entry_price.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            bot.last_price.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            bot.unrealized_pnl_percent,
            bot.max_profit_seen,
            bot.opened_by_autobot
        );
    }
    for q in &state.quarantined {
        println!("{:<14} QUARANTINED        {}", q.symbol, q.reason);
    }

    let stats = &state.stats;
    println!(
        "\n{} trades, {:.1}% win rate, realized {:+.2} USDT",
        stats.total_trades,
        stats.win_rate(),
        stats.total_realized_pnl
    );
    Ok(())
}

async fn show_signal(config: &AppConfig, symbol: &str) -> anyhow::Result<()> {
    let exchange = build_exchange(config, true)?;
    let maturity = build_maturity(&config.storage).await?;
    let autobot = &config.autobot;

    let candles = exchange
        .get_candles(symbol, autobot.timeframe, config.engine.candle_lookback)
        .await?;
    let record = generate_signal(
        &MarketContext {
            symbol,
            candles: &candles,
            now: Utc::now(),
            position: None,
            marked_mature: maturity.is_mature(symbol).await?,
        },
        autobot,
    );
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

async fn show_trades(storage: &StorageSettings, limit: usize) -> anyhow::Result<()> {
    let history = build_history(storage).await?;
    for trade in history.recent(limit).await? {
        println!(
            "{}  {:<12} {:<5} {:>12} -> {:<12} {:>+9.2} USDT ({:+.1}%)  {:?}",
            trade.exit_time.format("%Y-%m-%d %H:%M"),
            trade.symbol,
            trade.side,
            trade.entry_price,
            trade.exit_price,
            trade.realized_pnl,
            trade.realized_pnl_percent,
            trade.reason
        );
    }
    Ok(())
}

/// Offline counterpart of `TradingCore::resolve_corrupted`; run with the engine stopped
async fn resolve(storage: &StorageSettings, symbol: &str) -> anyhow::Result<()> {
    let store = JsonFileStore::new(&storage.state_path);
    let Some(state) = store.load().await? else {
        anyhow::bail!("no state file at {}", storage.state_path.display());
    };
    let loaded = LoadedState::decode(state, Utc::now());

    let before = loaded.quarantined.len();
    let quarantined: Vec<_> = loaded
        .quarantined
        .into_iter()
        .filter(|q| q.symbol != symbol)
        .collect();
    if quarantined.len() == before {
        anyhow::bail!("{} is not quarantined", symbol);
    }

    let state = PersistedState::capture(
        &loaded.bots,
        &quarantined,
        &loaded.autobot,
        &loaded.stats,
        Utc::now(),
    )?
    .with_pending_trades(loaded.pending_trades);
    store.save(&state).await?;
    println!("{} released from quarantine", symbol);
    Ok(())
}
