use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::protection::ExitReason;
use crate::models::Side;

/// One completed round trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub reason: ExitReason,
    /// Quote currency (USDT)
    pub realized_pnl: f64,
    pub realized_pnl_percent: f64,
    pub opened_by_autobot: bool,
}

impl TradeRecord {
    /// Same symbol and entry order always give the same id, so writers can dedupe
    pub fn derive_id(symbol: &str, entry_order_id: &str) -> Uuid {
        Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("{}:{}", symbol, entry_order_id).as_bytes(),
        )
    }

    pub fn is_win(&self) -> bool {
        self.realized_pnl > 0.0
    }
}
