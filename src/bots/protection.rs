use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AutoBotConfig;
use crate::models::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    TrailingStop,
    TimeStop,
    /// EXIT_LONG / EXIT_SHORT from the classifier
    Signal,
    Manual,
    /// Position vanished from the exchange without our close order
    ExternalClose,
    Inactivity,
}

/// Unrealized P&L in percent of margin: price move scaled by leverage, signed by side
pub fn pnl_percent(side: Side, entry_price: f64, price: f64, leverage: f64) -> f64 {
    if entry_price <= 0.0 {
        return 0.0;
    }
    (price - entry_price) * 100.0 / entry_price * side.sign() * leverage
}

/// Outcome of one protection pass over an open position
#[derive(Debug, Clone, PartialEq)]
pub struct ProtectionCheck {
    pub pnl_percent: f64,
    /// Never lower than the previous peak
    pub max_profit_seen: f64,
    pub exit: Option<ExitReason>,
}

/// Evaluate stop-loss, trailing stop and time stop for an open position
///
/// Stop-loss wins when it fires together with the trailing stop.
pub fn evaluate_protections(
    side: Side,
    entry_price: f64,
    price: f64,
    previous_max_profit: f64,
    entry_time: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    config: &AutoBotConfig,
) -> ProtectionCheck {
    let pnl = pnl_percent(side, entry_price, price, config.leverage);
    let max_profit_seen = previous_max_profit.max(pnl);

    let stop_loss = -pnl >= config.max_loss_percent;
    let trailing = max_profit_seen >= config.trailing_stop_activation
        && max_profit_seen - pnl >= config.trailing_stop_distance;
    let time_stop = config.max_position_hours > 0
        && entry_time
            .map(|t| (now - t).num_hours() >= config.max_position_hours as i64)
            .unwrap_or(false);

    let exit = if stop_loss {
        Some(ExitReason::StopLoss)
    } else if trailing {
        Some(ExitReason::TrailingStop)
    } else if time_stop {
        Some(ExitReason::TimeStop)
    } else {
        None
    };

    ProtectionCheck {
        pnl_percent: pnl,
        max_profit_seen,
        exit,
    }
}

/// Trigger price for the exchange-side protective stop
pub fn stop_loss_price(side: Side, entry_price: f64, config: &AutoBotConfig) -> f64 {
    let price_move = config.max_loss_percent / 100.0 / config.leverage;
    match side {
        Side::Long => entry_price * (1.0 - price_move),
        Side::Short => entry_price * (1.0 + price_move),
    }
}
