use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::bots::{
    stop_loss_price, Bot, BotRegistry, BotSettings, BotStatus, ExitReason, QuarantinedBot, SymbolLocks,
    TradeRecord,
};
use crate::config::{AutoBotConfig, EngineSettings};
use crate::error::TradingError;
use crate::exchange::{ExchangeClient, RetryPolicy};
use crate::execution::{CandleBuffer, Executor, FillOutcome};
use crate::models::{Side, SignalRecord};
use crate::notify::{NotificationEvent, Notifier};
use crate::persistence::{LoadedState, MaturityStore, PersistedState, StateStore, TradeHistory};
use crate::risk::GlobalStats;
use crate::Result;

/// Collaborators the core talks to
#[derive(Clone)]
pub struct CoreDeps {
    pub exchange: Arc<dyn ExchangeClient>,
    pub store: Arc<dyn StateStore>,
    pub maturity: Arc<dyn MaturityStore>,
    pub history: Arc<dyn TradeHistory>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Debug, Default)]
pub(crate) struct ReconcileHealth {
    pub consecutive_failures: u32,
    /// Orphaned positions already alerted, until they disappear
    pub orphans_alerted: HashSet<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Owner of all bot, signal and config state
///
/// Workers and API handlers share one `Arc<TradingCore>`. Anything touching
/// a symbol's bot holds that symbol's lock from `locks`.
pub struct TradingCore {
    pub(crate) registry: BotRegistry,
    pub(crate) locks: SymbolLocks,
    pub(crate) signals: RwLock<HashMap<String, SignalRecord>>,
    pub(crate) candles: CandleBuffer,
    pub(crate) watchlist: RwLock<Vec<String>>,
    config: RwLock<Arc<AutoBotConfig>>,
    stats: Mutex<GlobalStats>,
    /// Closed trades the history store rejected; retried by reconciliation
    pending_trades: Mutex<Vec<TradeRecord>>,
    pub(crate) settings: EngineSettings,
    pub(crate) executor: Executor,
    store: Arc<dyn StateStore>,
    pub(crate) maturity: Arc<dyn MaturityStore>,
    history: Arc<dyn TradeHistory>,
    pub(crate) notifier: Arc<dyn Notifier>,
    save_lock: tokio::sync::Mutex<()>,
    pub(crate) health: Mutex<ReconcileHealth>,
    /// Set once a reconciliation pass has succeeded since startup
    pub(crate) reconciled: AtomicBool,
}

impl TradingCore {
    /// Load persisted state, then reconcile once against the exchange
    ///
    /// A corrupted state file aborts startup. The persisted auto-bot config
    /// wins over `autobot`, which only seeds a first start. An empty
    /// `watchlist` means every symbol the exchange lists.
    pub async fn start(
        deps: CoreDeps,
        settings: EngineSettings,
        autobot: AutoBotConfig,
        watchlist: Vec<String>,
    ) -> Result<Arc<Self>> {
        let now = Utc::now();
        let persisted = deps.store.load().await?;
        let first_start = persisted.is_none();

        let loaded = match persisted {
            Some(state) => LoadedState::decode(state, now),
            None => LoadedState {
                bots: Vec::new(),
                quarantined: Vec::new(),
                autobot,
                stats: GlobalStats::default(),
                pending_trades: Vec::new(),
            },
        };
        loaded.autobot.validate()?;

        for q in &loaded.quarantined {
            deps.notifier.notify(NotificationEvent::StateQuarantined {
                symbol: q.symbol.clone(),
                reason: q.reason.clone(),
            });
        }
        tracing::info!(
            "Restored {} bots ({} quarantined)",
            loaded.bots.len(),
            loaded.quarantined.len()
        );

        let policy = RetryPolicy::from_settings(&settings);
        let core = Arc::new(Self {
            registry: BotRegistry::from_parts(loaded.bots, loaded.quarantined),
            locks: SymbolLocks::new(Duration::from_millis(settings.lock_timeout_ms)),
            signals: RwLock::new(HashMap::new()),
            candles: CandleBuffer::new(settings.candle_lookback),
            watchlist: RwLock::new(watchlist),
            config: RwLock::new(Arc::new(loaded.autobot)),
            stats: Mutex::new(loaded.stats),
            pending_trades: Mutex::new(loaded.pending_trades),
            executor: Executor::new(deps.exchange, policy),
            store: deps.store,
            maturity: deps.maturity,
            history: deps.history,
            notifier: deps.notifier,
            save_lock: tokio::sync::Mutex::new(()),
            health: Mutex::new(ReconcileHealth::default()),
            reconciled: AtomicBool::new(false),
            settings,
        });

        if core.watchlist().is_empty() {
            match core.executor.symbols().await {
                Ok(symbols) => {
                    tracing::info!("Watching {} exchange symbols", symbols.len());
                    *core.watchlist.write().unwrap_or_else(|p| p.into_inner()) = symbols;
                }
                Err(e) => tracing::warn!("Could not list exchange symbols: {}", e),
            }
        }

        if first_start {
            core.persist().await?;
        }

        if let Err(e) = core.reconcile_once().await {
            tracing::warn!("Startup reconciliation failed, trading held until it succeeds: {}", e);
        }

        Ok(core)
    }

    // ------------------------------------------------------------------
    // API surface
    // ------------------------------------------------------------------

    pub fn list_bots(&self) -> Vec<Bot> {
        self.registry.list()
    }

    pub fn get_bot(&self, symbol: &str) -> Option<Bot> {
        self.registry.get(symbol)
    }

    /// Create an IDLE bot; the first of two racing creates wins
    pub async fn create_bot(&self, symbol: &str, settings: Option<BotSettings>) -> Result<Bot> {
        let symbol = normalize_symbol(symbol)?;
        let config = self.auto_bot_config();
        let settings = settings.unwrap_or_else(|| BotSettings::from_defaults(&config));
        if !(settings.volume_value > 0.0 && settings.volume_value.is_finite()) {
            return Err(TradingError::InvalidConfig(format!(
                "volume_value must be positive, got {}",
                settings.volume_value
            )));
        }

        let guard = self.locks.acquire(&symbol).await;
        if !guard.acquired() {
            return Err(TradingError::LockTimeout(symbol));
        }
        let bot = self
            .registry
            .insert_new(Bot::new(symbol.clone(), settings, false, Utc::now()), |_| Ok(()))?;
        drop(guard);

        tracing::info!("{}: bot created ({:?} {})", symbol, bot.volume_mode, bot.volume_value);
        self.notifier.notify(NotificationEvent::BotCreated {
            symbol: symbol.clone(),
            opened_by_autobot: false,
        });
        self.persist().await?;
        Ok(bot)
    }

    /// Stop and remove a bot, closing its position first
    ///
    /// Fails without removing the bot if the close order fails.
    pub async fn stop_bot(&self, symbol: &str) -> Result<Option<TradeRecord>> {
        let symbol = normalize_symbol(symbol)?;
        let guard = self.locks.acquire(&symbol).await;
        if !guard.acquired() {
            return Err(TradingError::LockTimeout(symbol));
        }
        let trade = self.stop_locked(&symbol, ExitReason::Manual, "manual stop").await?;
        drop(guard);

        self.persist().await?;
        Ok(trade)
    }

    /// Caller holds the symbol lock
    pub(crate) async fn stop_locked(
        &self,
        symbol: &str,
        reason: ExitReason,
        description: &str,
    ) -> Result<Option<TradeRecord>> {
        let bot = self
            .registry
            .get(symbol)
            .ok_or_else(|| TradingError::BotNotFound(symbol.to_string()))?;
        let config = self.auto_bot_config();
        let now = Utc::now();

        let mut trade = None;
        if bot.is_in_position() || bot.status == BotStatus::Closing {
            if bot.is_in_position() {
                self.registry.update(symbol, |b| b.begin_close(reason, now));
            }
            let (Some(side), Some(qty)) = (bot.position_side, bot.quantity) else {
                return Err(TradingError::StateCorrupted {
                    scope: symbol.to_string(),
                    reason: "open bot without side or quantity".to_string(),
                });
            };
            self.registry.update(symbol, |b| b.record_close_attempt(now));
            match self.executor.close_position(symbol, side, qty).await? {
                FillOutcome::Filled { price, .. } => {
                    trade = self.finalize_close(symbol, price, reason, &config).await;
                }
                FillOutcome::Pending { order_id } => {
                    return Err(TradingError::OrderSubmissionFailed {
                        symbol: symbol.to_string(),
                        reason: format!("close order {} not filled yet", order_id),
                    });
                }
            }
        } else if let (BotStatus::PendingEntry, Some(order_id)) =
            (bot.status, bot.order_id.as_deref())
        {
            if let Err(e) = self.executor.cancel_order(symbol, order_id).await {
                tracing::warn!("{}: could not cancel pending entry {}: {}", symbol, order_id, e);
            }
        }

        if let Some(stop_id) = bot.stop_loss_order_id.as_deref() {
            if trade.is_none() {
                let _ = self.executor.cancel_order(symbol, stop_id).await;
            }
        }

        // Auto-bots are already gone once their close is finalized
        if let Some(mut removed) = self.registry.remove(symbol) {
            removed.stop(now);
            tracing::info!("{}: bot stopped ({})", symbol, description);
            self.notifier.notify(NotificationEvent::BotStopped {
                symbol: symbol.to_string(),
                reason: description.to_string(),
            });
        }
        Ok(trade)
    }

    /// Cached signal, or a fresh computation when none is cached
    pub async fn get_signal(&self, symbol: &str) -> Result<SignalRecord> {
        let symbol = normalize_symbol(symbol)?;
        if let Some(record) = self.cached_signal(&symbol) {
            return Ok(record);
        }
        self.refresh_symbol(&symbol).await
    }

    pub fn auto_bot_config(&self) -> Arc<AutoBotConfig> {
        self.config
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Validate, swap in and persist a new auto-bot config
    pub async fn update_auto_bot_config(&self, config: AutoBotConfig) -> Result<()> {
        config.validate()?;
        *self.config.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(config);
        tracing::info!("Auto-bot config updated");
        self.persist().await
    }

    pub fn stats(&self) -> GlobalStats {
        lock(&self.stats).clone()
    }

    pub fn quarantined(&self) -> Vec<QuarantinedBot> {
        self.registry.quarantined()
    }

    /// Drop a quarantined entry so the symbol can trade again
    pub async fn resolve_corrupted(&self, symbol: &str) -> Result<QuarantinedBot> {
        let symbol = normalize_symbol(symbol)?;
        let resolved = self
            .registry
            .resolve_quarantine(&symbol)
            .ok_or_else(|| TradingError::BotNotFound(symbol.clone()))?;
        tracing::warn!("{}: quarantined entry discarded by operator", symbol);
        self.persist().await?;
        Ok(resolved)
    }

    pub async fn recent_trades(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        self.history.recent(limit).await
    }

    pub fn watchlist(&self) -> Vec<String> {
        self.watchlist
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn is_reconciled(&self) -> bool {
        self.reconciled.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Shared internals
    // ------------------------------------------------------------------

    pub(crate) fn cached_signal(&self, symbol: &str) -> Option<SignalRecord> {
        self.signals
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(symbol)
            .cloned()
    }

    /// Cached signal no older than three refresh periods
    pub(crate) fn fresh_signal(&self, symbol: &str, now: DateTime<Utc>) -> Option<SignalRecord> {
        let max_age = chrono::Duration::seconds(self.settings.signal_refresh_secs as i64 * 3);
        self.cached_signal(symbol)
            .filter(|record| now - record.computed_at <= max_age)
    }

    /// Full snapshot to the store; saves never interleave
    pub async fn persist(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        let (bots, quarantined) = self.registry.snapshot();
        let config = self.auto_bot_config();
        let stats = self.stats();
        let pending = lock(&self.pending_trades).clone();
        let state = PersistedState::capture(&bots, &quarantined, &config, &stats, Utc::now())?
            .with_pending_trades(pending);
        self.store.save(&state).await
    }

    /// Persist, logging instead of failing; used by the background workers
    pub(crate) async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            tracing::error!("Failed to persist state: {}", e);
        }
    }

    /// Arm the exchange-side stop for a freshly opened position
    pub(crate) async fn arm_protective_stop(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        entry_price: f64,
        config: &AutoBotConfig,
    ) {
        let trigger = stop_loss_price(side, entry_price, config);
        match self.executor.arm_stop_loss(symbol, side, qty, trigger).await {
            Ok(order_id) => {
                self.registry
                    .update(symbol, |b| b.stop_loss_order_id = Some(order_id));
                self.notifier.notify(NotificationEvent::StopLossArmed {
                    symbol: symbol.to_string(),
                    trigger_price: trigger,
                });
            }
            Err(e) => tracing::warn!("{}: protective stop not armed: {}", symbol, e),
        }
    }

    /// Close the round trip, record it and drop auto-bots
    ///
    /// Caller holds the symbol lock. Returns None if the bot had nothing to close.
    pub(crate) async fn finalize_close(
        &self,
        symbol: &str,
        exit_price: f64,
        reason: ExitReason,
        config: &AutoBotConfig,
    ) -> Option<TradeRecord> {
        let now = Utc::now();
        let closed = self.registry.update(symbol, |bot| {
            let stop_id = bot.stop_loss_order_id.clone();
            let auto = bot.opened_by_autobot;
            bot.complete_close(exit_price, reason, config.leverage, now)
                .map(|trade| (trade, stop_id, auto))
        });

        let (trade, stop_id, auto) = match closed {
            Some(Ok(closed)) => closed,
            Some(Err(e)) => {
                tracing::error!("{}", e);
                return None;
            }
            None => return None,
        };

        if let Some(stop_id) = stop_id {
            if let Err(e) = self.executor.cancel_order(symbol, &stop_id).await {
                tracing::debug!("{}: stop order {} not cancelled: {}", symbol, stop_id, e);
            }
        }

        self.record_trade(&trade).await;
        tracing::info!(
            "{}: closed {} ({:?}) P&L {:+.2} USDT ({:+.1}%)",
            symbol,
            trade.side,
            trade.reason,
            trade.realized_pnl,
            trade.realized_pnl_percent
        );
        self.notifier.notify(NotificationEvent::PositionClosed {
            trade: trade.clone(),
        });

        if auto {
            self.registry.remove(symbol);
            self.notifier.notify(NotificationEvent::BotStopped {
                symbol: symbol.to_string(),
                reason: "auto-bot position closed".to_string(),
            });
        }
        Some(trade)
    }

    /// Append to history; stats only move for records the history accepted
    ///
    /// A failed write parks the trade until `flush_pending_trades` lands it.
    async fn record_trade(&self, trade: &TradeRecord) {
        match self.history.append(trade).await {
            Ok(true) => lock(&self.stats).record(trade),
            Ok(false) => tracing::debug!("{}: trade {} already in history", trade.symbol, trade.id),
            Err(e) => {
                tracing::error!(
                    "{}: failed to write trade history, keeping {} for retry: {}",
                    trade.symbol,
                    trade.id,
                    e
                );
                let mut pending = lock(&self.pending_trades);
                if !pending.iter().any(|t| t.id == trade.id) {
                    pending.push(trade.clone());
                }
            }
        }
    }

    /// Retry parked trades; returns how many reached the history
    pub(crate) async fn flush_pending_trades(&self) -> usize {
        let parked = std::mem::take(&mut *lock(&self.pending_trades));
        if parked.is_empty() {
            return 0;
        }

        let mut recovered = 0;
        let mut still_pending = Vec::new();
        for trade in parked {
            match self.history.append(&trade).await {
                Ok(appended) => {
                    if appended {
                        lock(&self.stats).record(&trade);
                    }
                    recovered += 1;
                }
                Err(e) => {
                    tracing::warn!("{}: trade {} still not written: {}", trade.symbol, trade.id, e);
                    still_pending.push(trade);
                }
            }
        }

        if !still_pending.is_empty() {
            let mut pending = lock(&self.pending_trades);
            for trade in still_pending {
                if !pending.iter().any(|t| t.id == trade.id) {
                    pending.push(trade);
                }
            }
        }
        if recovered > 0 {
            tracing::info!("Wrote {} parked trades to history", recovered);
        }
        recovered
    }
}

/// Upper-case, non-empty, alphanumeric
pub fn normalize_symbol(symbol: &str) -> Result<String> {
    let symbol = symbol.trim().to_uppercase();
    if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(TradingError::InvalidConfig(format!("invalid symbol {:?}", symbol)));
    }
    Ok(symbol)
}
