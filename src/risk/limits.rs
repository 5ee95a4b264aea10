use serde::{Deserialize, Serialize};

use crate::bots::Bot;
use crate::config::{AutoBotConfig, VolumeMode};
use crate::error::TradingError;

/// Entry gates applied before a bot reserves a slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryLimits {
    pub max_concurrent_bots: usize,
    pub risk_cap_percent: f64,
}

impl EntryLimits {
    pub fn from_config(config: &AutoBotConfig) -> Self {
        Self {
            max_concurrent_bots: config.max_concurrent_bots,
            risk_cap_percent: config.risk_cap_percent,
        }
    }
}

/// Exposure of the bots already holding or reserving a position
#[derive(Debug, Clone, Default)]
pub struct Exposure {
    pub active_bots: usize,
    pub committed_margin: f64,
}

impl Exposure {
    /// Sum over active bots, skipping `exclude` (the bot asking for a slot)
    pub fn of<'a>(
        bots: impl IntoIterator<Item = &'a Bot>,
        exclude: Option<&str>,
        leverage: f64,
    ) -> Self {
        bots.into_iter()
            .filter(|b| b.is_active() && Some(b.symbol.as_str()) != exclude)
            .fold(Self::default(), |mut acc, bot| {
                acc.active_bots += 1;
                acc.committed_margin += bot_margin(bot, leverage);
                acc
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LimitTrip {
    ConcurrencyLimit { active: usize, max: usize },
    RiskCap { required: f64, available: f64 },
}

impl From<LimitTrip> for TradingError {
    fn from(trip: LimitTrip) -> Self {
        match trip {
            LimitTrip::ConcurrencyLimit { active, max } => {
                TradingError::ConcurrencyLimitReached { active, max }
            }
            LimitTrip::RiskCap {
                required,
                available,
            } => TradingError::RiskCapExceeded {
                required,
                available,
            },
        }
    }
}

impl EntryLimits {
    /// Can one more position with `new_margin` be opened?
    ///
    /// `balance` is None when the exchange balance is unknown; the risk cap is
    /// then skipped and only the concurrency cap applies.
    pub fn check(
        &self,
        exposure: &Exposure,
        new_margin: f64,
        balance: Option<f64>,
    ) -> Result<(), LimitTrip> {
        if exposure.active_bots >= self.max_concurrent_bots {
            return Err(LimitTrip::ConcurrencyLimit {
                active: exposure.active_bots,
                max: self.max_concurrent_bots,
            });
        }

        if let Some(balance) = balance {
            let cap = balance * self.risk_cap_percent / 100.0;
            let available = (cap - exposure.committed_margin).max(0.0);
            if exposure.committed_margin + new_margin > cap {
                return Err(LimitTrip::RiskCap {
                    required: new_margin,
                    available,
                });
            }
        }

        Ok(())
    }
}

/// Order quantity for a fixed USDT margin or a fixed coin amount
pub fn order_quantity(mode: VolumeMode, value: f64, price: f64, leverage: f64) -> Option<f64> {
    if price <= 0.0 || !price.is_finite() {
        return None;
    }
    let qty = match mode {
        VolumeMode::Usdt => value * leverage / price,
        VolumeMode::Coins => value,
    };
    (qty > 0.0 && qty.is_finite()).then_some(qty)
}

/// Margin a position of this size ties up
pub fn position_margin(mode: VolumeMode, value: f64, price: f64, leverage: f64) -> f64 {
    match mode {
        VolumeMode::Usdt => value,
        VolumeMode::Coins => value * price / leverage.max(1.0),
    }
}

/// Margin currently committed by a bot, from its fill when known
pub fn bot_margin(bot: &Bot, leverage: f64) -> f64 {
    match (bot.quantity, bot.entry_price) {
        (Some(qty), Some(price)) => qty * price / leverage.max(1.0),
        _ => {
            let price = bot.last_price.unwrap_or(0.0);
            position_margin(bot.volume_mode, bot.volume_value, price, leverage)
        }
    }
}
