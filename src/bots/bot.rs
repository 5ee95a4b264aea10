use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::protection::{evaluate_protections, pnl_percent, ExitReason};
use super::trade::TradeRecord;
use crate::config::{AutoBotConfig, VolumeMode};
use crate::models::{ExchangePosition, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BotStatus {
    Idle,
    PendingEntry,
    InPositionLong,
    InPositionShort,
    Closing,
    Stopped,
}

impl BotStatus {
    pub fn in_position(side: Side) -> Self {
        match side {
            Side::Long => BotStatus::InPositionLong,
            Side::Short => BotStatus::InPositionShort,
        }
    }

    pub fn is_in_position(&self) -> bool {
        matches!(self, BotStatus::InPositionLong | BotStatus::InPositionShort)
    }

    /// Holds a position or a reservation for one; counted against the concurrency cap
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            BotStatus::PendingEntry
                | BotStatus::InPositionLong
                | BotStatus::InPositionShort
                | BotStatus::Closing
        )
    }
}

/// How a bot sizes its entry order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotSettings {
    pub volume_mode: VolumeMode,
    pub volume_value: f64,
}

impl BotSettings {
    pub fn from_defaults(config: &AutoBotConfig) -> Self {
        Self {
            volume_mode: config.default_volume_mode,
            volume_value: config.default_volume_value,
        }
    }
}

/// Illegal move in the bot state machine
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{symbol}: cannot {action} while {status:?}")]
pub struct InvalidTransition {
    pub symbol: String,
    pub action: &'static str,
    pub status: BotStatus,
}

/// One trading bot, bound to a single symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bot {
    pub symbol: String,
    pub status: BotStatus,
    pub position_side: Option<Side>,
    pub entry_price: Option<f64>,
    pub order_id: Option<String>,
    pub quantity: Option<f64>,
    pub volume_mode: VolumeMode,
    pub volume_value: f64,
    /// Peak unrealized P&L in percent, only ever increases while in position
    pub max_profit_seen: f64,
    pub unrealized_pnl_percent: f64,
    pub last_price: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub entry_time: Option<DateTime<Utc>>,
    pub pending_since: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub opened_by_autobot: bool,
    pub stop_loss_order_id: Option<String>,
    pub exit_reason: Option<ExitReason>,
    #[serde(default)]
    pub close_attempts: u32,
}

impl Bot {
    pub fn new(
        symbol: impl Into<String>,
        settings: BotSettings,
        opened_by_autobot: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            status: BotStatus::Idle,
            position_side: None,
            entry_price: None,
            order_id: None,
            quantity: None,
            volume_mode: settings.volume_mode,
            volume_value: settings.volume_value,
            max_profit_seen: 0.0,
            unrealized_pnl_percent: 0.0,
            last_price: None,
            created_at: now,
            entry_time: None,
            pending_since: None,
            last_activity: now,
            opened_by_autobot,
            stop_loss_order_id: None,
            exit_reason: None,
            close_attempts: 0,
        }
    }

    /// Bot for a position found on the exchange that nothing here opened
    pub fn adopted(position: &ExchangePosition, now: DateTime<Utc>) -> Self {
        let mut bot = Self::new(
            position.symbol.clone(),
            BotSettings {
                volume_mode: VolumeMode::Coins,
                volume_value: position.size,
            },
            false,
            now,
        );
        bot.status = BotStatus::in_position(position.side);
        bot.position_side = Some(position.side);
        bot.entry_price = Some(position.entry_price);
        bot.order_id = Some(format!("adopted-{}", Uuid::new_v4()));
        bot.quantity = Some(position.size);
        bot.entry_time = Some(now);
        bot.last_price = position.mark_price;
        bot
    }

    pub fn settings(&self) -> BotSettings {
        BotSettings {
            volume_mode: self.volume_mode,
            volume_value: self.volume_value,
        }
    }

    pub fn is_in_position(&self) -> bool {
        self.status.is_in_position()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Side of the held position, for the exit rules of the classifier
    pub fn open_side(&self) -> Option<Side> {
        match self.status {
            BotStatus::InPositionLong => Some(Side::Long),
            BotStatus::InPositionShort => Some(Side::Short),
            _ => None,
        }
    }

    fn invalid(&self, action: &'static str) -> InvalidTransition {
        InvalidTransition {
            symbol: self.symbol.clone(),
            action,
            status: self.status,
        }
    }

    /// IDLE -> PENDING_ENTRY, reserving a slot before the order goes out
    pub fn begin_entry(&mut self, side: Side, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if self.status != BotStatus::Idle {
            return Err(self.invalid("begin entry"));
        }
        self.status = BotStatus::PendingEntry;
        self.position_side = Some(side);
        self.pending_since = Some(now);
        self.order_id = None;
        self.exit_reason = None;
        self.last_activity = now;
        Ok(())
    }

    /// Order accepted but not filled yet
    pub fn record_pending_order(&mut self, order_id: impl Into<String>, now: DateTime<Utc>) {
        self.order_id = Some(order_id.into());
        self.last_activity = now;
    }

    /// PENDING_ENTRY -> IN_POSITION_* on fill
    pub fn confirm_entry(
        &mut self,
        order_id: impl Into<String>,
        entry_price: f64,
        quantity: f64,
        now: DateTime<Utc>,
    ) -> Result<Side, InvalidTransition> {
        let side = match (self.status, self.position_side) {
            (BotStatus::PendingEntry, Some(side)) => side,
            _ => return Err(self.invalid("confirm entry")),
        };
        self.status = BotStatus::in_position(side);
        self.entry_price = Some(entry_price);
        self.order_id = Some(order_id.into());
        self.quantity = Some(quantity);
        self.entry_time = Some(now);
        self.pending_since = None;
        self.max_profit_seen = 0.0;
        self.unrealized_pnl_percent = 0.0;
        self.last_price = Some(entry_price);
        self.close_attempts = 0;
        self.last_activity = now;
        Ok(side)
    }

    /// PENDING_ENTRY -> IDLE after a rejected or timed out order
    pub fn fail_entry(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if self.status != BotStatus::PendingEntry {
            return Err(self.invalid("fail entry"));
        }
        self.reset_to_idle(now);
        Ok(())
    }

    /// Feed the latest price to an open position
    ///
    /// Updates P&L and the profit high-water mark, returning the protection
    /// exit that fired, if any.
    pub fn update_price(
        &mut self,
        price: f64,
        now: DateTime<Utc>,
        config: &AutoBotConfig,
    ) -> Option<ExitReason> {
        let (Some(side), Some(entry_price)) = (self.open_side(), self.entry_price) else {
            return None;
        };
        let check = evaluate_protections(
            side,
            entry_price,
            price,
            self.max_profit_seen,
            self.entry_time,
            now,
            config,
        );
        self.last_price = Some(price);
        self.unrealized_pnl_percent = check.pnl_percent;
        self.max_profit_seen = check.max_profit_seen;
        check.exit
    }

    /// IN_POSITION_* -> CLOSING
    pub fn begin_close(
        &mut self,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if !self.is_in_position() {
            return Err(self.invalid("begin close"));
        }
        self.status = BotStatus::Closing;
        self.exit_reason = Some(reason);
        self.close_attempts = 0;
        self.last_activity = now;
        Ok(())
    }

    pub fn record_close_attempt(&mut self, now: DateTime<Utc>) -> u32 {
        self.close_attempts += 1;
        self.last_activity = now;
        self.close_attempts
    }

    /// Close the round trip and go back to IDLE
    ///
    /// Valid from CLOSING, or straight from IN_POSITION_* when the position was
    /// closed outside of this bot. Returns the trade to record.
    pub fn complete_close(
        &mut self,
        exit_price: f64,
        reason: ExitReason,
        leverage: f64,
        now: DateTime<Utc>,
    ) -> Result<TradeRecord, InvalidTransition> {
        if !(self.is_in_position() || self.status == BotStatus::Closing) {
            return Err(self.invalid("complete close"));
        }
        let (Some(side), Some(entry_price), Some(order_id)) =
            (self.position_side, self.entry_price, self.order_id.clone())
        else {
            return Err(self.invalid("complete close without entry data"));
        };
        let quantity = self.quantity.unwrap_or(0.0);
        let reason = self.exit_reason.unwrap_or(reason);

        let record = TradeRecord {
            id: TradeRecord::derive_id(&self.symbol, &order_id),
            symbol: self.symbol.clone(),
            side,
            entry_price,
            exit_price,
            quantity,
            entry_time: self.entry_time.unwrap_or(self.created_at),
            exit_time: now,
            reason,
            realized_pnl: (exit_price - entry_price) * quantity * side.sign(),
            realized_pnl_percent: pnl_percent(side, entry_price, exit_price, leverage),
            opened_by_autobot: self.opened_by_autobot,
        };

        self.reset_to_idle(now);
        self.exit_reason = Some(reason);
        Ok(record)
    }

    /// Terminal state, from anywhere
    pub fn stop(&mut self, now: DateTime<Utc>) {
        self.status = BotStatus::Stopped;
        self.last_activity = now;
    }

    fn reset_to_idle(&mut self, now: DateTime<Utc>) {
        self.status = BotStatus::Idle;
        self.position_side = None;
        self.entry_price = None;
        self.order_id = None;
        self.quantity = None;
        self.entry_time = None;
        self.pending_since = None;
        self.max_profit_seen = 0.0;
        self.unrealized_pnl_percent = 0.0;
        self.stop_loss_order_id = None;
        self.close_attempts = 0;
        self.last_activity = now;
    }

    /// Check the persisted shape is one the state machine can produce
    pub fn validate(&self) -> Result<(), String> {
        if self.symbol.trim().is_empty() {
            return Err("empty symbol".to_string());
        }
        if !self.volume_value.is_finite() || self.volume_value <= 0.0 {
            return Err(format!("invalid volume_value {}", self.volume_value));
        }
        if !self.max_profit_seen.is_finite() {
            return Err("max_profit_seen is not finite".to_string());
        }
        match self.status {
            BotStatus::InPositionLong | BotStatus::InPositionShort | BotStatus::Closing => {
                match self.entry_price {
                    Some(p) if p.is_finite() && p > 0.0 => {}
                    _ => return Err(format!("{:?} without a valid entry_price", self.status)),
                }
                if self.order_id.as_deref().map_or(true, str::is_empty) {
                    return Err(format!("{:?} without an order_id", self.status));
                }
                if self.position_side.is_none() {
                    return Err(format!("{:?} without a position_side", self.status));
                }
                if let Some(open) = self.open_side() {
                    if self.position_side != Some(open) {
                        return Err(format!(
                            "status {:?} disagrees with side {:?}",
                            self.status, self.position_side
                        ));
                    }
                }
            }
            BotStatus::PendingEntry => {
                if self.position_side.is_none() {
                    return Err("PENDING_ENTRY without a position_side".to_string());
                }
            }
            BotStatus::Idle | BotStatus::Stopped => {}
        }
        Ok(())
    }
}
