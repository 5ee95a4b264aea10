use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::trading_core::TradingCore;
use crate::bots::{Bot, ExitReason};
use crate::config::AutoBotConfig;
use crate::execution::{decide, ExecutionAction, FillOutcome};
use crate::models::{Side, Timeframe};
use crate::notify::NotificationEvent;
use crate::risk::{order_quantity, position_margin, EntryLimits, Exposure};
use crate::Result;

/// What a single tick did to a bot
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Lock busy or no bot
    Skipped,
    Held,
    EntryPlaced,
    Entered { side: Side, price: f64 },
    EntryBlocked(String),
    EntryFailed(String),
    Closed { reason: ExitReason },
    CloseFailed,
}

impl TradingCore {
    /// Run one state-machine step for a symbol's bot
    ///
    /// Holds the symbol lock for the whole step, then persists after
    /// releasing it.
    pub async fn tick_bot(&self, symbol: &str) -> Result<TickOutcome> {
        let guard = self.locks.acquire(symbol).await;
        if !guard.acquired() {
            tracing::debug!("{}: busy, tick skipped", symbol);
            return Ok(TickOutcome::Skipped);
        }
        let outcome = self.tick_locked(symbol).await;
        drop(guard);

        // Price updates move max_profit_seen, so holding bots are saved too
        if matches!(outcome, Ok(ref o) if *o != TickOutcome::Skipped) {
            self.persist_logged().await;
        }
        outcome
    }

    async fn tick_locked(&self, symbol: &str) -> Result<TickOutcome> {
        let Some(bot) = self.registry.get(symbol) else {
            return Ok(TickOutcome::Skipped);
        };
        let config = self.auto_bot_config();
        let now = Utc::now();

        // Open positions are priced from the exchange, not the last signal refresh
        let live_price = if bot.is_in_position() {
            self.fetch_last_price(symbol, config.timeframe).await
        } else {
            None
        };
        let price = live_price
            .or_else(|| self.candles.last_price(symbol))
            .or_else(|| self.cached_signal(symbol).and_then(|s| s.last_price));

        let protection_exit = match price {
            Some(price) if bot.is_in_position() => self
                .registry
                .update(symbol, |b| b.update_price(price, now, &config))
                .flatten(),
            _ => None,
        };
        let Some(bot) = self.registry.get(symbol) else {
            return Ok(TickOutcome::Skipped);
        };

        let signal = self.fresh_signal(symbol, now);
        let decision = decide(&bot, signal.as_ref(), protection_exit);
        tracing::debug!("{}: {:?} ({})", symbol, decision.action, decision.reason);

        match decision.action {
            ExecutionAction::Skip => Ok(TickOutcome::Held),
            ExecutionAction::Enter { side } => match price {
                Some(price) => self.enter(&bot, side, price, &config).await,
                None => Ok(TickOutcome::Held),
            },
            ExecutionAction::Close { reason } => {
                if let Some(Err(e)) = self.registry.update(symbol, |b| b.begin_close(reason, now)) {
                    tracing::error!("{}: {}", symbol, e);
                    return Ok(TickOutcome::Held);
                }
                tracing::info!(
                    "{}: exit triggered ({:?}) at {:?}, P&L {:+.1}%",
                    symbol,
                    reason,
                    price,
                    bot.unrealized_pnl_percent
                );
                self.notifier.notify(NotificationEvent::ExitTriggered {
                    symbol: symbol.to_string(),
                    reason,
                    price: price.unwrap_or(0.0),
                });
                self.attempt_close(symbol, &config).await
            }
            ExecutionAction::RetryClose => self.attempt_close(symbol, &config).await,
        }
    }

    async fn enter(
        &self,
        bot: &Bot,
        side: Side,
        price: f64,
        config: &AutoBotConfig,
    ) -> Result<TickOutcome> {
        let symbol = bot.symbol.as_str();
        let Some(qty) = order_quantity(bot.volume_mode, bot.volume_value, price, config.leverage)
        else {
            return Ok(TickOutcome::EntryBlocked(format!("no valid quantity at {}", price)));
        };
        let margin = position_margin(bot.volume_mode, bot.volume_value, price, config.leverage);

        let balance = match self.executor.balance().await {
            Ok(balance) => Some(balance.total),
            Err(e) => {
                tracing::warn!("{}: balance unknown, risk cap not applied: {}", symbol, e);
                None
            }
        };

        let limits = EntryLimits::from_config(config);
        let now = Utc::now();
        let reserved = self.registry.reserve_entry(symbol, side, now, |others| {
            let exposure = Exposure::of(others.iter().copied(), Some(symbol), config.leverage);
            limits.check(&exposure, margin, balance).map_err(Into::into)
        });
        if let Err(e) = reserved {
            tracing::info!("{}: entry not taken: {}", symbol, e);
            return Ok(TickOutcome::EntryBlocked(e.to_string()));
        }
        // Reservation is durable before the order goes out
        self.persist_logged().await;

        match self.executor.open_position(symbol, side, qty).await {
            Ok(FillOutcome::Filled {
                order_id,
                price: fill_price,
                qty: fill_qty,
            }) => {
                let now = Utc::now();
                let confirmed = self
                    .registry
                    .update(symbol, |b| b.confirm_entry(order_id, fill_price, fill_qty, now));
                if let Some(Err(e)) = confirmed {
                    tracing::error!("{}: {}", symbol, e);
                }
                tracing::info!("{}: opened {} {:.6} @ {}", symbol, side, fill_qty, fill_price);
                self.notifier.notify(NotificationEvent::PositionOpened {
                    symbol: symbol.to_string(),
                    side,
                    entry_price: fill_price,
                    quantity: fill_qty,
                });
                self.arm_protective_stop(symbol, side, fill_qty, fill_price, config)
                    .await;
                Ok(TickOutcome::Entered {
                    side,
                    price: fill_price,
                })
            }
            Ok(FillOutcome::Pending { order_id }) => {
                self.registry
                    .update(symbol, |b| b.record_pending_order(order_id.clone(), Utc::now()));
                self.notifier.notify(NotificationEvent::EntryPlaced {
                    symbol: symbol.to_string(),
                    side,
                    order_id,
                });
                Ok(TickOutcome::EntryPlaced)
            }
            Err(e) => {
                tracing::warn!("{}: entry failed: {}", symbol, e);
                if let Some(Err(e)) = self.registry.update(symbol, |b| b.fail_entry(Utc::now())) {
                    tracing::error!("{}: {}", symbol, e);
                }
                self.notifier.notify(NotificationEvent::EntryFailed {
                    symbol: symbol.to_string(),
                    reason: e.to_string(),
                });
                Ok(TickOutcome::EntryFailed(e.to_string()))
            }
        }
    }

    /// Close of the newest candle straight from the exchange
    ///
    /// Not merged into the buffer, which only takes full refreshes.
    async fn fetch_last_price(&self, symbol: &str, timeframe: Timeframe) -> Option<f64> {
        match self.executor.candles(symbol, timeframe, 1).await {
            Ok(candles) => candles.last().map(|c| c.close),
            Err(e) => {
                tracing::debug!("{}: live price unavailable, using buffered: {}", symbol, e);
                None
            }
        }
    }

    /// One close attempt for a CLOSING bot
    async fn attempt_close(&self, symbol: &str, config: &AutoBotConfig) -> Result<TickOutcome> {
        let Some(bot) = self.registry.get(symbol) else {
            return Ok(TickOutcome::Skipped);
        };
        let (Some(side), Some(qty)) = (bot.position_side, bot.quantity) else {
            return Ok(TickOutcome::Skipped);
        };
        let reason = bot.exit_reason.unwrap_or(ExitReason::Signal);
        let attempts = self
            .registry
            .update(symbol, |b| b.record_close_attempt(Utc::now()))
            .unwrap_or(1);

        match self.executor.close_position(symbol, side, qty).await {
            Ok(FillOutcome::Filled { price, .. }) => {
                self.finalize_close(symbol, price, reason, config).await;
                Ok(TickOutcome::Closed { reason })
            }
            Ok(FillOutcome::Pending { order_id }) => {
                tracing::info!("{}: close order {} resting", symbol, order_id);
                Ok(TickOutcome::CloseFailed)
            }
            Err(e) => {
                tracing::warn!("{}: close attempt {} failed: {}", symbol, attempts, e);
                if attempts >= config.max_close_attempts {
                    self.notifier.notify(NotificationEvent::CloseFailed {
                        symbol: symbol.to_string(),
                        attempts,
                        reason: e.to_string(),
                    });
                }
                Ok(TickOutcome::CloseFailed)
            }
        }
    }

    /// Tick every bot, symbols in parallel up to the worker pool size
    pub async fn tick_all(self: &Arc<Self>) {
        if !self.is_reconciled() {
            tracing::debug!("Waiting for first reconciliation before ticking bots");
            return;
        }

        let semaphore = Arc::new(Semaphore::new(self.settings.worker_pool_size.max(1)));
        let mut tasks = JoinSet::new();
        for symbol in self.registry.symbols() {
            let core = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                if let Err(e) = core.tick_bot(&symbol).await {
                    tracing::error!("{}: tick failed: {}", symbol, e);
                }
                Some(())
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Bot tick task panicked: {}", e);
            }
        }
    }
}
