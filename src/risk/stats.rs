use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bots::TradeRecord;

/// Running totals over every completed trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalStats {
    pub total_trades: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
    pub total_realized_pnl: f64,
    pub consecutive_losses: u32,
    pub updated_at: DateTime<Utc>,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            total_realized_pnl: 0.0,
            consecutive_losses: 0,
            updated_at: Utc::now(),
        }
    }
}

impl GlobalStats {
    pub fn record(&mut self, trade: &TradeRecord) {
        self.total_trades += 1;
        self.total_realized_pnl += trade.realized_pnl;
        if trade.is_win() {
            self.winning_trades += 1;
            self.consecutive_losses = 0;
        } else {
            self.losing_trades += 1;
            self.consecutive_losses += 1;
        }
        self.updated_at = trade.exit_time;
    }

    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 {
            return 0.0;
        }
        self.winning_trades as f64 / self.total_trades as f64 * 100.0
    }
}
