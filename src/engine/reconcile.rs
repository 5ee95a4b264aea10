use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::Ordering;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::trading_core::TradingCore;
use crate::bots::{Bot, BotStatus, ExitReason};
use crate::config::AutoBotConfig;
use crate::models::{ExchangeOrder, ExchangePosition, OrderKind};
use crate::notify::NotificationEvent;
use crate::risk::{EntryLimits, Exposure};
use crate::Result;

/// Counts of what one reconciliation pass changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub adopted: usize,
    pub orphaned: usize,
    pub external_closes: usize,
    pub closes_confirmed: usize,
    pub entries_confirmed: usize,
    pub entries_failed: usize,
    pub stops_rearmed: usize,
    pub side_mismatches: usize,
    /// Symbols skipped because the lock was busy or the bot moved after the fetch
    pub skipped: usize,
    /// Parked trades that finally reached the history
    pub trades_recovered: usize,
}

/// Exchange view taken at `fetched_at`, grouped by symbol
#[derive(Debug, Clone)]
pub(crate) struct ExchangeSnapshot {
    pub fetched_at: DateTime<Utc>,
    pub positions: HashMap<String, ExchangePosition>,
    pub orders: HashMap<String, Vec<ExchangeOrder>>,
}

enum Diff {
    Unchanged,
    Adopted,
    Orphaned,
    ExternalClose,
    CloseConfirmed,
    EntryConfirmed,
    EntryFailed,
    StopRearmed,
    SideMismatch,
}

impl ReconcileReport {
    fn count(&mut self, diff: Diff) {
        match diff {
            Diff::Unchanged => {}
            Diff::Adopted => self.adopted += 1,
            Diff::Orphaned => self.orphaned += 1,
            Diff::ExternalClose => self.external_closes += 1,
            Diff::CloseConfirmed => self.closes_confirmed += 1,
            Diff::EntryConfirmed => self.entries_confirmed += 1,
            Diff::EntryFailed => self.entries_failed += 1,
            Diff::StopRearmed => self.stops_rearmed += 1,
            Diff::SideMismatch => self.side_mismatches += 1,
        }
    }

    pub fn changed(&self) -> bool {
        self.adopted
            + self.external_closes
            + self.closes_confirmed
            + self.entries_confirmed
            + self.entries_failed
            + self.stops_rearmed
            + self.trades_recovered
            > 0
    }
}

impl TradingCore {
    /// Diff exchange positions and orders against the bots and repair drift
    ///
    /// A failed fetch changes nothing; repeated failures raise an alert.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        let snapshot = match self.fetch_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.record_reconcile_failure(&e.to_string());
                return Err(e);
            }
        };
        self.record_reconcile_success();

        let mut report = self.apply_snapshot(&snapshot).await;

        // Forget orphan alerts for positions that have gone away
        if let Ok(mut health) = self.health.lock() {
            health
                .orphans_alerted
                .retain(|s| snapshot.positions.contains_key(s));
        }

        report.trades_recovered = self.flush_pending_trades().await;
        self.reconciled.store(true, Ordering::SeqCst);
        if report.changed() {
            tracing::info!("Reconciliation applied changes: {:?}", report);
            self.persist().await?;
        }
        Ok(report)
    }

    pub(crate) async fn fetch_snapshot(&self) -> Result<ExchangeSnapshot> {
        let fetched_at = Utc::now();
        let (positions, orders) =
            tokio::join!(self.executor.positions(), self.executor.open_orders());
        let (positions, orders) = (positions?, orders?);

        let positions = positions
            .into_iter()
            .map(|p| (p.symbol.clone(), p))
            .collect();
        let mut by_symbol: HashMap<String, Vec<ExchangeOrder>> = HashMap::new();
        for order in orders {
            by_symbol.entry(order.symbol.clone()).or_default().push(order);
        }
        Ok(ExchangeSnapshot {
            fetched_at,
            positions,
            orders: by_symbol,
        })
    }

    /// Walk every symbol known to either side under its lock
    pub(crate) async fn apply_snapshot(&self, snapshot: &ExchangeSnapshot) -> ReconcileReport {
        let mut symbols: BTreeSet<String> = snapshot.positions.keys().cloned().collect();
        symbols.extend(self.registry.symbols());

        let config = self.auto_bot_config();
        let mut report = ReconcileReport::default();
        for symbol in &symbols {
            let guard = self.locks.acquire(symbol).await;
            if !guard.acquired() {
                report.skipped += 1;
                continue;
            }
            let position = snapshot.positions.get(symbol);
            let orders = snapshot.orders.get(symbol).map(Vec::as_slice).unwrap_or(&[]);
            match self
                .reconcile_symbol(symbol, position, orders, snapshot.fetched_at, &config)
                .await
            {
                Some(diff) => report.count(diff),
                None => report.skipped += 1,
            }
        }
        report
    }

    fn record_reconcile_failure(&self, error: &str) {
        let failures = match self.health.lock() {
            Ok(mut health) => {
                health.consecutive_failures += 1;
                health.consecutive_failures
            }
            Err(poisoned) => {
                let mut health = poisoned.into_inner();
                health.consecutive_failures += 1;
                health.consecutive_failures
            }
        };
        tracing::warn!("Reconciliation failed ({} in a row): {}", failures, error);

        let alert_after = self.settings.reconcile_alert_after.max(1);
        if failures % alert_after == 0 {
            self.notifier.notify(NotificationEvent::ExchangeAlert {
                consecutive_failures: failures,
                error: error.to_string(),
            });
        }
    }

    fn record_reconcile_success(&self) {
        if let Ok(mut health) = self.health.lock() {
            if health.consecutive_failures > 0 {
                tracing::info!(
                    "Exchange reachable again after {} failed passes",
                    health.consecutive_failures
                );
            }
            health.consecutive_failures = 0;
        }
    }

    fn alert_orphan_once(&self, position: &ExchangePosition) -> bool {
        let first = match self.health.lock() {
            Ok(mut health) => health.orphans_alerted.insert(position.symbol.clone()),
            Err(poisoned) => poisoned.into_inner().orphans_alerted.insert(position.symbol.clone()),
        };
        if first {
            tracing::warn!(
                "{}: untracked {} position of {} on the exchange",
                position.symbol,
                position.side,
                position.size
            );
            self.notifier.notify(NotificationEvent::OrphanedPosition {
                symbol: position.symbol.clone(),
                side: position.side,
                size: position.size,
            });
        }
        first
    }

    /// Caller holds the symbol lock. None means skipped.
    async fn reconcile_symbol(
        &self,
        symbol: &str,
        position: Option<&ExchangePosition>,
        orders: &[ExchangeOrder],
        fetched_at: DateTime<Utc>,
        config: &AutoBotConfig,
    ) -> Option<Diff> {
        let bot = self.registry.get(symbol);

        // The bot moved after the snapshot was taken; it is newer than our data
        if let Some(bot) = &bot {
            if bot.last_activity > fetched_at {
                tracing::debug!("{}: changed since exchange fetch, skipping", symbol);
                return None;
            }
        }

        let diff = match (bot, position) {
            (None, None) => Diff::Unchanged,
            (None, Some(position)) => {
                if self.registry.is_quarantined(symbol) {
                    self.alert_orphan_once(position);
                    Diff::Orphaned
                } else {
                    self.adopt_or_flag(position, config).await
                }
            }
            (Some(bot), position) => match bot.status {
                BotStatus::InPositionLong | BotStatus::InPositionShort => {
                    self.reconcile_open(&bot, position, orders, config).await
                }
                BotStatus::Closing => match position {
                    None => {
                        let price = bot.last_price.or(bot.entry_price).unwrap_or(0.0);
                        let reason = bot.exit_reason.unwrap_or(ExitReason::ExternalClose);
                        self.finalize_close(symbol, price, reason, config).await;
                        Diff::CloseConfirmed
                    }
                    Some(_) => Diff::Unchanged,
                },
                BotStatus::PendingEntry => {
                    self.reconcile_pending(&bot, position, orders, config).await
                }
                BotStatus::Idle => match position {
                    Some(position) => self.take_over_idle(&bot, position, config).await,
                    None => Diff::Unchanged,
                },
                BotStatus::Stopped => Diff::Unchanged,
            },
        };
        Some(diff)
    }

    async fn adopt_or_flag(&self, position: &ExchangePosition, config: &AutoBotConfig) -> Diff {
        if !config.adopt_external_positions {
            self.alert_orphan_once(position);
            return Diff::Orphaned;
        }

        let now = Utc::now();
        let limits = EntryLimits::from_config(config);
        let adopted = self.registry.insert_new(Bot::adopted(position, now), |bots| {
            let exposure = Exposure::of(bots.iter().copied(), None, config.leverage);
            limits.check(&exposure, 0.0, None).map_err(Into::into)
        });

        match adopted {
            Ok(bot) => {
                tracing::info!(
                    "{}: adopted external {} position of {} @ {}",
                    bot.symbol,
                    position.side,
                    position.size,
                    position.entry_price
                );
                self.notifier.notify(NotificationEvent::PositionAdopted {
                    symbol: bot.symbol.clone(),
                    side: position.side,
                    size: position.size,
                });
                if position.stop_loss.is_none() {
                    self.arm_protective_stop(
                        &bot.symbol,
                        position.side,
                        position.size,
                        position.entry_price,
                        config,
                    )
                    .await;
                }
                Diff::Adopted
            }
            Err(e) => {
                tracing::warn!("{}: not adopting: {}", position.symbol, e);
                self.alert_orphan_once(position);
                Diff::Orphaned
            }
        }
    }

    async fn reconcile_open(
        &self,
        bot: &Bot,
        position: Option<&ExchangePosition>,
        orders: &[ExchangeOrder],
        config: &AutoBotConfig,
    ) -> Diff {
        let symbol = bot.symbol.as_str();
        let Some(position) = position else {
            let price = bot.last_price.or(bot.entry_price).unwrap_or(0.0);
            tracing::warn!("{}: position closed outside the bot, recording at {}", symbol, price);
            self.finalize_close(symbol, price, ExitReason::ExternalClose, config)
                .await;
            return Diff::ExternalClose;
        };

        let Some(bot_side) = bot.open_side() else {
            return Diff::Unchanged;
        };
        if bot_side != position.side {
            tracing::error!(
                "{}: bot holds {} but exchange reports {}",
                symbol,
                bot_side,
                position.side
            );
            self.notifier.notify(NotificationEvent::SideMismatch {
                symbol: symbol.to_string(),
                bot_side,
                exchange_side: position.side,
            });
            return Diff::SideMismatch;
        }

        let has_stop_order = orders.iter().any(|o| {
            o.kind == OrderKind::StopLoss
                && bot.stop_loss_order_id.as_deref().map_or(true, |id| id == o.order_id)
        });
        if !has_stop_order && position.stop_loss.is_none() {
            let entry_price = bot.entry_price.unwrap_or(position.entry_price);
            let qty = bot.quantity.unwrap_or(position.size);
            tracing::warn!("{}: protective stop missing, re-arming", symbol);
            self.registry.update(symbol, |b| b.stop_loss_order_id = None);
            self.arm_protective_stop(symbol, bot_side, qty, entry_price, config)
                .await;
            return Diff::StopRearmed;
        }
        Diff::Unchanged
    }

    async fn reconcile_pending(
        &self,
        bot: &Bot,
        position: Option<&ExchangePosition>,
        orders: &[ExchangeOrder],
        config: &AutoBotConfig,
    ) -> Diff {
        let symbol = bot.symbol.as_str();
        let now = Utc::now();

        if let Some(position) = position {
            if bot.position_side.is_some_and(|side| side != position.side) {
                self.notifier.notify(NotificationEvent::SideMismatch {
                    symbol: symbol.to_string(),
                    bot_side: bot.position_side.unwrap_or(position.side),
                    exchange_side: position.side,
                });
                return Diff::SideMismatch;
            }
            let order_id = bot
                .order_id
                .clone()
                .unwrap_or_else(|| format!("recovered-{}", Uuid::new_v4()));
            let confirmed = self.registry.update(symbol, |b| {
                b.confirm_entry(order_id, position.entry_price, position.size, now)
            });
            if let Some(Err(e)) = confirmed {
                tracing::error!("{}", e);
                return Diff::Unchanged;
            }
            tracing::info!(
                "{}: entry confirmed by exchange @ {}",
                symbol,
                position.entry_price
            );
            self.notifier.notify(NotificationEvent::PositionOpened {
                symbol: symbol.to_string(),
                side: position.side,
                entry_price: position.entry_price,
                quantity: position.size,
            });
            let has_stop = orders.iter().any(|o| o.kind == OrderKind::StopLoss);
            if !has_stop && position.stop_loss.is_none() {
                self.arm_protective_stop(
                    symbol,
                    position.side,
                    position.size,
                    position.entry_price,
                    config,
                )
                .await;
            }
            return Diff::EntryConfirmed;
        }

        let order_live = bot
            .order_id
            .as_deref()
            .is_some_and(|id| orders.iter().any(|o| o.order_id == id));
        let grace = Duration::seconds(self.settings.pending_entry_grace_secs);
        let pending_since = bot.pending_since.unwrap_or(bot.last_activity);
        if !order_live && now - pending_since > grace {
            tracing::warn!("{}: entry never filled, back to idle", symbol);
            if let Some(Err(e)) = self.registry.update(symbol, |b| b.fail_entry(now)) {
                tracing::error!("{}: {}", symbol, e);
                return Diff::Unchanged;
            }
            self.notifier.notify(NotificationEvent::EntryFailed {
                symbol: symbol.to_string(),
                reason: "entry order not found on the exchange".to_string(),
            });
            return Diff::EntryFailed;
        }
        Diff::Unchanged
    }

    /// An IDLE bot whose symbol has a position it did not open
    async fn take_over_idle(
        &self,
        bot: &Bot,
        position: &ExchangePosition,
        config: &AutoBotConfig,
    ) -> Diff {
        if !config.adopt_external_positions {
            self.alert_orphan_once(position);
            return Diff::Orphaned;
        }
        let now = Utc::now();
        let limits = EntryLimits::from_config(config);
        let taken = self.registry.update_admitted(
            &bot.symbol,
            |others| {
                let exposure =
                    Exposure::of(others.iter().copied(), Some(bot.symbol.as_str()), config.leverage);
                limits.check(&exposure, 0.0, None).map_err(Into::into)
            },
            |b| {
                b.begin_entry(position.side, now)?;
                b.confirm_entry(
                    format!("adopted-{}", Uuid::new_v4()),
                    position.entry_price,
                    position.size,
                    now,
                )
            },
        );
        match taken {
            Ok(Ok(side)) => {
                tracing::info!("{}: idle bot took over external {} position", bot.symbol, side);
                self.notifier.notify(NotificationEvent::PositionAdopted {
                    symbol: bot.symbol.clone(),
                    side,
                    size: position.size,
                });
                if position.stop_loss.is_none() {
                    self.arm_protective_stop(
                        &bot.symbol,
                        side,
                        position.size,
                        position.entry_price,
                        config,
                    )
                    .await;
                }
                Diff::Adopted
            }
            Ok(Err(e)) => {
                tracing::error!("{}: {}", bot.symbol, e);
                Diff::Unchanged
            }
            Err(e) => {
                tracing::warn!("{}: not taking over: {}", bot.symbol, e);
                self.alert_orphan_once(position);
                Diff::Orphaned
            }
        }
    }
}
