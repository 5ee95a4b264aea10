use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::trading_core::TradingCore;
use crate::indicators::closed_candles;
use crate::models::SignalRecord;
use crate::strategy::{generate_signal, MarketContext};
use crate::Result;

/// Outcome of one refresh pass over every watched symbol
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshSummary {
    pub refreshed: usize,
    pub failed: usize,
    pub entry_signals: usize,
}

impl TradingCore {
    /// Watchlist plus every symbol that has a bot
    pub(crate) fn tracked_symbols(&self) -> Vec<String> {
        let mut symbols: BTreeSet<String> = self.watchlist().into_iter().collect();
        symbols.extend(self.registry.symbols());
        symbols.into_iter().collect()
    }

    /// Fetch candles for one symbol and recompute its signal
    pub async fn refresh_symbol(&self, symbol: &str) -> Result<SignalRecord> {
        let config = self.auto_bot_config();
        let fetched = self
            .executor
            .candles(symbol, config.timeframe, self.settings.candle_lookback)
            .await?;
        self.candles.merge(symbol, &fetched);

        let now = Utc::now();
        let candles = self.candles.get_candles(symbol);
        let closed = closed_candles(&candles, config.timeframe, now).len();
        if closed >= config.min_candles_for_maturity {
            if let Err(e) = self.maturity.mark_mature(symbol).await {
                tracing::warn!("{}: could not mark mature: {}", symbol, e);
            }
        }
        let marked_mature = match self.maturity.is_mature(symbol).await {
            Ok(mature) => mature,
            Err(e) => {
                tracing::warn!("{}: maturity lookup failed: {}", symbol, e);
                false
            }
        };

        let position = self.registry.get(symbol).and_then(|bot| bot.open_side());
        let record = generate_signal(
            &MarketContext {
                symbol,
                candles: &candles,
                now,
                position,
                marked_mature,
            },
            &config,
        );

        tracing::debug!(
            "{}: RSI {:?} trend {:?} -> {:?}",
            symbol,
            record.rsi,
            record.trend,
            record.signal
        );
        self.signals
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(symbol.to_string(), record.clone());
        Ok(record)
    }

    /// Recompute every tracked symbol with bounded parallelism
    ///
    /// A failing symbol keeps its previous signal; staleness then keeps the
    /// runner from acting on it.
    pub async fn refresh_signals(self: &Arc<Self>) -> RefreshSummary {
        let semaphore = Arc::new(Semaphore::new(self.settings.worker_pool_size.max(1)));
        let mut tasks = JoinSet::new();

        for symbol in self.tracked_symbols() {
            let core = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                match core.refresh_symbol(&symbol).await {
                    Ok(record) => Some(record.signal.entry_side().is_some()),
                    Err(e) => {
                        tracing::warn!("{}: signal refresh failed: {}", symbol, e);
                        None
                    }
                }
            });
        }

        let mut summary = RefreshSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(entry)) => {
                    summary.refreshed += 1;
                    if entry {
                        summary.entry_signals += 1;
                    }
                }
                Ok(None) => summary.failed += 1,
                Err(e) => {
                    tracing::error!("Signal task panicked: {}", e);
                    summary.failed += 1;
                }
            }
        }

        tracing::info!(
            "Signals refreshed: {} ok, {} failed, {} entry candidates",
            summary.refreshed,
            summary.failed,
            summary.entry_signals
        );
        summary
    }
}
