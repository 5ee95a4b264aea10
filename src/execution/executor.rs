use std::sync::Arc;

use crate::bots::{Bot, BotStatus, ExitReason};
use crate::error::TradingError;
use crate::exchange::{with_retry, Balance, ExchangeClient, OrderRequest, OrderStatus, RetryPolicy};
use crate::models::{Candle, ExchangeOrder, ExchangePosition, SignalRecord, Side, Timeframe};
use crate::Result;

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionAction {
    Enter { side: Side },
    Close { reason: ExitReason },
    /// Bot is CLOSING and the previous close attempt did not confirm
    RetryClose,
    Skip,
}

#[derive(Debug, Clone)]
pub struct ExecutionDecision {
    pub action: ExecutionAction,
    pub reason: String,
}

impl ExecutionDecision {
    fn skip(reason: impl Into<String>) -> Self {
        Self {
            action: ExecutionAction::Skip,
            reason: reason.into(),
        }
    }
}

/// Decide what a bot should do this tick
///
/// `protection_exit` comes from the price update and wins over signal exits.
pub fn decide(
    bot: &Bot,
    signal: Option<&SignalRecord>,
    protection_exit: Option<ExitReason>,
) -> ExecutionDecision {
    match bot.status {
        BotStatus::Stopped => ExecutionDecision::skip("bot stopped"),
        BotStatus::PendingEntry => ExecutionDecision::skip("awaiting entry fill"),
        BotStatus::Closing => ExecutionDecision {
            action: ExecutionAction::RetryClose,
            reason: format!("close not confirmed ({} attempts)", bot.close_attempts),
        },
        BotStatus::Idle => match signal.and_then(|s| s.signal.entry_side()) {
            Some(side) => ExecutionDecision {
                action: ExecutionAction::Enter { side },
                reason: format!("{:?} signal", signal.map(|s| s.signal)),
            },
            None => ExecutionDecision::skip("no entry signal"),
        },
        BotStatus::InPositionLong | BotStatus::InPositionShort => {
            if let Some(reason) = protection_exit {
                return ExecutionDecision {
                    action: ExecutionAction::Close { reason },
                    reason: format!("{:?} triggered", reason),
                };
            }
            match (signal, bot.open_side()) {
                (Some(record), Some(side)) if record.signal.exits(side) => ExecutionDecision {
                    action: ExecutionAction::Close {
                        reason: ExitReason::Signal,
                    },
                    reason: format!("{:?} signal", record.signal),
                },
                _ => ExecutionDecision::skip("holding"),
            }
        }
    }
}

/// Result of a market order
#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    Filled {
        order_id: String,
        price: f64,
        qty: f64,
    },
    /// Accepted; confirmation comes later through reconciliation
    Pending { order_id: String },
}

/// Exchange calls the bots make, each bounded by the retry policy
///
/// Order placement is attempted once: a timed out order may still have been
/// accepted, and reconciliation sorts that out instead of a blind resend.
#[derive(Clone)]
pub struct Executor {
    exchange: Arc<dyn ExchangeClient>,
    policy: RetryPolicy,
}

impl Executor {
    pub fn new(exchange: Arc<dyn ExchangeClient>, policy: RetryPolicy) -> Self {
        Self { exchange, policy }
    }

    async fn submit(&self, request: OrderRequest) -> Result<FillOutcome> {
        let ack = with_retry("place_order", self.policy.once(), || {
            self.exchange.place_order(&request)
        })
        .await?;

        match ack.status {
            OrderStatus::Filled { avg_price, qty } => Ok(FillOutcome::Filled {
                order_id: ack.order_id,
                price: avg_price,
                qty,
            }),
            OrderStatus::Accepted => Ok(FillOutcome::Pending {
                order_id: ack.order_id,
            }),
            OrderStatus::Rejected { reason } => Err(TradingError::OrderSubmissionFailed {
                symbol: request.symbol,
                reason,
            }),
        }
    }

    pub async fn open_position(&self, symbol: &str, side: Side, qty: f64) -> Result<FillOutcome> {
        tracing::info!("{}: opening {} {:.6}", symbol, side, qty);
        self.submit(OrderRequest::market_entry(symbol, side, qty)).await
    }

    pub async fn close_position(&self, symbol: &str, side: Side, qty: f64) -> Result<FillOutcome> {
        tracing::info!("{}: closing {} {:.6}", symbol, side, qty);
        self.submit(OrderRequest::market_close(symbol, side, qty)).await
    }

    /// Returns the stop order id
    pub async fn arm_stop_loss(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        trigger_price: f64,
    ) -> Result<String> {
        let ack = with_retry("place_stop_loss", self.policy.once(), || {
            self.exchange.place_stop_loss(symbol, side, qty, trigger_price)
        })
        .await?;
        match ack.status {
            OrderStatus::Rejected { reason } => Err(TradingError::OrderSubmissionFailed {
                symbol: symbol.to_string(),
                reason,
            }),
            _ => Ok(ack.order_id),
        }
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        with_retry("cancel_order", self.policy, || {
            self.exchange.cancel_order(symbol, order_id)
        })
        .await
    }

    pub async fn candles(&self, symbol: &str, timeframe: Timeframe, lookback: usize) -> Result<Vec<Candle>> {
        with_retry("get_candles", self.policy, || {
            self.exchange.get_candles(symbol, timeframe, lookback)
        })
        .await
    }

    pub async fn positions(&self) -> Result<Vec<ExchangePosition>> {
        with_retry("get_positions", self.policy, || self.exchange.get_positions()).await
    }

    pub async fn open_orders(&self) -> Result<Vec<ExchangeOrder>> {
        with_retry("get_open_orders", self.policy, || self.exchange.get_open_orders()).await
    }

    pub async fn balance(&self) -> Result<Balance> {
        with_retry("get_balance", self.policy, || self.exchange.get_balance()).await
    }

    pub async fn symbols(&self) -> Result<Vec<String>> {
        with_retry("get_symbols", self.policy, || self.exchange.get_symbols()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bots::BotSettings;
    use crate::config::VolumeMode;
    use crate::exchange::PaperExchange;
    use crate::models::{Signal, Timeframe};
    use chrono::Utc;

    fn bot() -> Bot {
        Bot::new(
            "BTCUSDT",
            BotSettings {
                volume_mode: VolumeMode::Usdt,
                volume_value: 10.0,
            },
            false,
            Utc::now(),
        )
    }

    fn record(signal: Signal) -> SignalRecord {
        let mut record = SignalRecord::insufficient("BTCUSDT", Timeframe::H6, 500, Some(100.0), Utc::now());
        record.rsi = Some(50.0);
        record.signal = signal;
        record
    }

    #[test]
    fn test_idle_enters_on_signal() {
        let decision = decide(&bot(), Some(&record(Signal::EnterShort)), None);
        assert_eq!(decision.action, ExecutionAction::Enter { side: Side::Short });

        let decision = decide(&bot(), Some(&record(Signal::NoSignal)), None);
        assert_eq!(decision.action, ExecutionAction::Skip);
    }

    #[test]
    fn test_protection_beats_signal_exit() {
        let now = Utc::now();
        let mut bot = bot();
        bot.begin_entry(Side::Long, now).unwrap();
        bot.confirm_entry("o", 100.0, 0.1, now).unwrap();

        let decision = decide(&bot, Some(&record(Signal::ExitLong)), Some(ExitReason::StopLoss));
        assert_eq!(
            decision.action,
            ExecutionAction::Close {
                reason: ExitReason::StopLoss
            }
        );

        let decision = decide(&bot, Some(&record(Signal::ExitLong)), None);
        assert_eq!(
            decision.action,
            ExecutionAction::Close {
                reason: ExitReason::Signal
            }
        );

        // Exit for the other side is ignored
        let decision = decide(&bot, Some(&record(Signal::ExitShort)), None);
        assert_eq!(decision.action, ExecutionAction::Skip);
    }

    #[test]
    fn test_pending_and_closing() {
        let now = Utc::now();
        let mut bot = bot();
        bot.begin_entry(Side::Long, now).unwrap();
        assert_eq!(
            decide(&bot, Some(&record(Signal::EnterLong)), None).action,
            ExecutionAction::Skip
        );

        bot.confirm_entry("o", 100.0, 0.1, now).unwrap();
        bot.begin_close(ExitReason::Manual, now).unwrap();
        assert_eq!(decide(&bot, None, None).action, ExecutionAction::RetryClose);
    }

    #[tokio::test]
    async fn test_rejected_order_is_submission_failure() {
        let exchange = Arc::new(PaperExchange::new(1000.0, 1.0));
        let executor = Executor::new(exchange, RetryPolicy::default());

        let err = executor
            .open_position("NOPRICEUSDT", Side::Long, 1.0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ORDER_SUBMISSION_FAILED");
    }

    #[tokio::test]
    async fn test_open_and_close_fill() {
        let exchange = Arc::new(PaperExchange::new(1000.0, 1.0));
        exchange.set_price("BTCUSDT", 100.0);
        let executor = Executor::new(exchange.clone(), RetryPolicy::default());

        let outcome = executor.open_position("BTCUSDT", Side::Long, 1.0).await.unwrap();
        assert!(matches!(outcome, FillOutcome::Filled { price, .. } if price == 100.0));

        let stop_id = executor
            .arm_stop_loss("BTCUSDT", Side::Long, 1.0, 85.0)
            .await
            .unwrap();
        assert!(!stop_id.is_empty());

        executor.close_position("BTCUSDT", Side::Long, 1.0).await.unwrap();
        assert!(executor.positions().await.unwrap().is_empty());
    }
}
