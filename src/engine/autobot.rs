use chrono::{Duration, Utc};

use super::trading_core::TradingCore;
use super::runner::TickOutcome;
use crate::bots::{Bot, BotSettings, BotStatus, ExitReason};
use crate::notify::NotificationEvent;
use crate::risk::{position_margin, EntryLimits, Exposure};

/// Result of one orchestrator pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AutoBotReport {
    pub created: Vec<String>,
    pub entered: Vec<String>,
    /// Candidates turned away by a cap, with the reason
    pub rejected: Vec<(String, String)>,
    pub cleaned_up: Vec<String>,
}

impl TradingCore {
    /// Create bots for fresh entry signals, then drop stale auto-bots
    pub async fn run_autobot(&self) -> AutoBotReport {
        let mut report = AutoBotReport::default();
        if !self.is_reconciled() {
            tracing::debug!("Auto-bot waiting for first reconciliation");
            return report;
        }

        let config = self.auto_bot_config();
        if config.enabled {
            self.spawn_auto_bots(&mut report).await;
        }
        self.cleanup_inactive(&mut report).await;

        if !report.created.is_empty() || !report.cleaned_up.is_empty() {
            self.persist_logged().await;
        }
        report
    }

    async fn spawn_auto_bots(&self, report: &mut AutoBotReport) {
        let config = self.auto_bot_config();
        let now = Utc::now();

        let mut candidates: Vec<_> = self
            .signals
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|record| record.signal.entry_side().is_some())
            .filter(|record| {
                record
                    .maturity_info
                    .as_ref()
                    .map_or(false, |outcome| outcome.allowed)
            })
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let balance = match self.executor.balance().await {
            Ok(balance) => Some(balance.total),
            Err(e) => {
                tracing::warn!("Auto-bot: balance unknown, risk cap not applied: {}", e);
                None
            }
        };
        let limits = EntryLimits::from_config(&config);
        let settings = BotSettings::from_defaults(&config);

        for record in candidates {
            let symbol = record.symbol.clone();
            if self.fresh_signal(&symbol, now).is_none()
                || self.registry.contains(&symbol)
                || self.registry.is_quarantined(&symbol)
            {
                continue;
            }
            let Some(price) = record.last_price else {
                continue;
            };
            let margin = position_margin(settings.volume_mode, settings.volume_value, price, config.leverage);

            let guard = self.locks.acquire(&symbol).await;
            if !guard.acquired() {
                continue;
            }
            let created = self
                .registry
                .insert_new(Bot::new(symbol.clone(), settings.clone(), true, Utc::now()), |bots| {
                    let exposure = Exposure::of(bots.iter().copied(), None, config.leverage);
                    limits.check(&exposure, margin, balance).map_err(Into::into)
                });
            drop(guard);

            match created {
                Ok(_) => {
                    tracing::info!("{}: auto-bot created on {:?}", symbol, record.signal);
                    self.notifier.notify(NotificationEvent::BotCreated {
                        symbol: symbol.clone(),
                        opened_by_autobot: true,
                    });
                    report.created.push(symbol.clone());

                    match self.tick_bot(&symbol).await {
                        Ok(TickOutcome::Entered { .. }) | Ok(TickOutcome::EntryPlaced) => {
                            report.entered.push(symbol)
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!("{}: first tick failed: {}", symbol, e),
                    }
                }
                Err(e) => {
                    tracing::info!("{}: auto-bot not created: {}", symbol, e);
                    report.rejected.push((symbol, e.to_string()));
                }
            }
        }
    }

    /// Stop auto-bots idle or pending longer than the inactivity timeout
    async fn cleanup_inactive(&self, report: &mut AutoBotReport) {
        let config = self.auto_bot_config();
        let timeout = Duration::minutes(config.inactive_bot_timeout_minutes);
        let now = Utc::now();

        let stale: Vec<String> = self
            .registry
            .list()
            .into_iter()
            .filter(|bot| bot.opened_by_autobot)
            .filter(|bot| matches!(bot.status, BotStatus::Idle | BotStatus::PendingEntry))
            .filter(|bot| now - bot.last_activity > timeout)
            .map(|bot| bot.symbol)
            .collect();

        for symbol in stale {
            let guard = self.locks.acquire(&symbol).await;
            if !guard.acquired() {
                continue;
            }
            // Re-check under the lock
            let still_stale = self.registry.get(&symbol).is_some_and(|bot| {
                matches!(bot.status, BotStatus::Idle | BotStatus::PendingEntry)
                    && now - bot.last_activity > timeout
            });
            if !still_stale {
                continue;
            }
            match self
                .stop_locked(&symbol, ExitReason::Inactivity, "inactive auto-bot")
                .await
            {
                Ok(_) => report.cleaned_up.push(symbol),
                Err(e) => tracing::warn!("{}: inactivity cleanup failed: {}", symbol, e),
            }
        }
    }
}
