//! Exchange abstraction used by the trading core.
//!
//! `BybitClient` (in `api`) talks to the real venue; `PaperExchange` fills
//! orders in memory for dry runs and tests.

pub mod paper;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{Candle, ExchangeOrder, ExchangePosition, OrderKind, OrderSide, Side, Timeframe};
use crate::Result;

pub use paper::PaperExchange;
pub use retry::{with_retry, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub qty: f64,
    pub price: Option<f64>,
    pub reduce_only: bool,
    /// Idempotency key echoed back by the exchange
    pub client_order_id: String,
}

impl OrderRequest {
    /// Market order opening a position on `side`
    pub fn market_entry(symbol: &str, side: Side, qty: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: side.entry_order_side(),
            kind: OrderKind::Market,
            qty,
            price: None,
            reduce_only: false,
            client_order_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Reduce-only market order closing a `side` position
    pub fn market_close(symbol: &str, side: Side, qty: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: side.exit_order_side(),
            kind: OrderKind::Market,
            qty,
            price: None,
            reduce_only: true,
            client_order_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderStatus {
    Filled { avg_price: f64, qty: f64 },
    /// Accepted but not (yet) filled
    Accepted,
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    /// Total equity in USDT
    pub total: f64,
    pub available: f64,
}

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Most recent `lookback` candles, oldest first; the last one may still be forming
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        lookback: usize,
    ) -> Result<Vec<Candle>>;

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck>;

    /// Every open position on the account
    async fn get_positions(&self) -> Result<Vec<ExchangePosition>>;

    async fn get_open_orders(&self) -> Result<Vec<ExchangeOrder>>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()>;

    async fn get_balance(&self) -> Result<Balance>;

    /// Reduce-only conditional order that closes a `side` position at `trigger_price`
    async fn place_stop_loss(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        trigger_price: f64,
    ) -> Result<OrderAck>;

    /// Tradable USDT perpetual symbols
    async fn get_symbols(&self) -> Result<Vec<String>>;
}
