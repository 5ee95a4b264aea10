use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::{Balance, ExchangeClient, OrderAck, OrderRequest, OrderStatus};
use crate::error::TradingError;
use crate::models::{Candle, ExchangeOrder, ExchangePosition, OrderKind, OrderSide, Side, Timeframe};
use crate::Result;

#[derive(Debug, Default)]
struct PaperState {
    candles: HashMap<String, Vec<Candle>>,
    prices: HashMap<String, f64>,
    positions: HashMap<String, ExchangePosition>,
    orders: HashMap<String, ExchangeOrder>,
    balance: f64,
    next_id: u64,
    hold_entries: bool,
    fail_orders: bool,
    fail_positions: bool,
    placed_orders: usize,
}

impl PaperState {
    fn next_order_id(&mut self) -> String {
        self.next_id += 1;
        format!("paper-{}", self.next_id)
    }

    fn apply_fill(&mut self, symbol: &str, side: OrderSide, qty: f64, price: f64, reduce_only: bool, leverage: f64) {
        let incoming = match side {
            OrderSide::Buy => Side::Long,
            OrderSide::Sell => Side::Short,
        };

        match self.positions.get_mut(symbol) {
            Some(position) if position.side != incoming => {
                let closed = qty.min(position.size);
                self.balance += (price - position.entry_price) * closed * position.side.sign();
                position.size -= closed;
                if position.size <= f64::EPSILON {
                    self.positions.remove(symbol);
                    self.orders.retain(|_, o| o.symbol != symbol || o.kind != OrderKind::StopLoss);
                }
            }
            Some(position) if !reduce_only => {
                let total = position.size + qty;
                position.entry_price = (position.entry_price * position.size + price * qty) / total;
                position.size = total;
            }
            Some(_) => {}
            None if !reduce_only => {
                self.positions.insert(
                    symbol.to_string(),
                    ExchangePosition {
                        symbol: symbol.to_string(),
                        side: incoming,
                        size: qty,
                        entry_price: price,
                        mark_price: Some(price),
                        leverage: Some(leverage),
                        stop_loss: None,
                    },
                );
            }
            None => {}
        }
    }
}

/// In-memory exchange with immediate market fills
///
/// Market data comes from injected candles/prices, or from another client
/// when built with [`PaperExchange::with_market_data`]. Test hooks can fail
/// calls, hold entries unfilled and close positions behind the bot's back.
pub struct PaperExchange {
    state: Mutex<PaperState>,
    market_data: Option<Arc<dyn ExchangeClient>>,
    leverage: f64,
}

impl PaperExchange {
    pub fn new(initial_balance: f64, leverage: f64) -> Self {
        Self {
            state: Mutex::new(PaperState {
                balance: initial_balance,
                ..Default::default()
            }),
            market_data: None,
            leverage,
        }
    }

    /// Candles come from `source`; orders stay local
    pub fn with_market_data(source: Arc<dyn ExchangeClient>, initial_balance: f64, leverage: f64) -> Self {
        Self {
            market_data: Some(source),
            ..Self::new(initial_balance, leverage)
        }
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_candles(&self, symbol: &str, candles: Vec<Candle>) {
        let mut state = self.lock();
        if let Some(last) = candles.last() {
            state.prices.insert(symbol.to_string(), last.close);
        }
        state.candles.insert(symbol.to_string(), candles);
    }

    /// Move the price; positions are marked and resting stops may trigger
    pub fn set_price(&self, symbol: &str, price: f64) {
        let mut state = self.lock();
        state.prices.insert(symbol.to_string(), price);
        if let Some(candle) = state.candles.get_mut(symbol).and_then(|c| c.last_mut()) {
            candle.close = price;
            candle.high = candle.high.max(price);
            candle.low = candle.low.min(price);
        }
        if let Some(position) = state.positions.get_mut(symbol) {
            position.mark_price = Some(price);
        }

        let triggered: Vec<ExchangeOrder> = state
            .orders
            .values()
            .filter(|o| o.symbol == symbol && o.kind == OrderKind::StopLoss)
            .filter(|o| match (o.side, o.trigger_price) {
                (OrderSide::Sell, Some(trigger)) => price <= trigger,
                (OrderSide::Buy, Some(trigger)) => price >= trigger,
                _ => false,
            })
            .cloned()
            .collect();
        for order in triggered {
            state.orders.remove(&order.order_id);
            state.apply_fill(symbol, order.side, order.qty, price, true, self.leverage);
        }
    }

    /// Leave entry orders resting instead of filling them
    pub fn hold_entries(&self, hold: bool) {
        self.lock().hold_entries = hold;
    }

    /// Fill a resting entry order at the current price
    pub fn fill_order(&self, order_id: &str) -> bool {
        let mut state = self.lock();
        let Some(order) = state.orders.remove(order_id) else {
            return false;
        };
        let price = state.prices.get(&order.symbol).copied().unwrap_or(0.0);
        state.apply_fill(&order.symbol, order.side, order.qty, price, order.reduce_only, self.leverage);
        true
    }

    pub fn fail_orders(&self, fail: bool) {
        self.lock().fail_orders = fail;
    }

    pub fn fail_positions(&self, fail: bool) {
        self.lock().fail_positions = fail;
    }

    /// Simulate a manual close on the exchange UI
    pub fn close_externally(&self, symbol: &str) -> Option<ExchangePosition> {
        let mut state = self.lock();
        let position = state.positions.remove(symbol)?;
        let price = state.prices.get(symbol).copied().unwrap_or(position.entry_price);
        state.balance += (price - position.entry_price) * position.size * position.side.sign();
        state.orders.retain(|_, o| o.symbol != symbol);
        Some(position)
    }

    /// Simulate a position opened outside the bot
    pub fn open_externally(&self, position: ExchangePosition) {
        let mut state = self.lock();
        state.prices.entry(position.symbol.clone()).or_insert(position.entry_price);
        state.positions.insert(position.symbol.clone(), position);
    }

    pub fn position(&self, symbol: &str) -> Option<ExchangePosition> {
        self.lock().positions.get(symbol).cloned()
    }

    /// Orders accepted so far, including stop-loss orders
    pub fn placed_orders(&self) -> usize {
        self.lock().placed_orders
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        lookback: usize,
    ) -> Result<Vec<Candle>> {
        if let Some(source) = &self.market_data {
            let candles = source.get_candles(symbol, timeframe, lookback).await?;
            if let Some(last) = candles.last() {
                let mut state = self.lock();
                state.prices.insert(symbol.to_string(), last.close);
                if let Some(position) = state.positions.get_mut(symbol) {
                    position.mark_price = Some(last.close);
                }
            }
            return Ok(candles);
        }

        let state = self.lock();
        let candles = state.candles.get(symbol).cloned().unwrap_or_default();
        let skip = candles.len().saturating_sub(lookback);
        Ok(candles.into_iter().skip(skip).collect())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let mut state = self.lock();
        if state.fail_orders {
            return Err(TradingError::ExchangeUnavailable(
                "paper exchange: order endpoint down".to_string(),
            ));
        }
        let Some(price) = state.prices.get(&request.symbol).copied() else {
            return Ok(OrderAck {
                order_id: String::new(),
                status: OrderStatus::Rejected {
                    reason: format!("no price for {}", request.symbol),
                },
            });
        };
        if request.qty <= 0.0 {
            return Ok(OrderAck {
                order_id: String::new(),
                status: OrderStatus::Rejected {
                    reason: "quantity must be positive".to_string(),
                },
            });
        }

        let order_id = state.next_order_id();
        state.placed_orders += 1;

        if state.hold_entries && !request.reduce_only {
            let order = ExchangeOrder {
                order_id: order_id.clone(),
                symbol: request.symbol.clone(),
                side: request.side,
                kind: request.kind,
                qty: request.qty,
                price: request.price,
                trigger_price: None,
                reduce_only: false,
                created_at: Utc::now(),
            };
            state.orders.insert(order_id.clone(), order);
            return Ok(OrderAck {
                order_id,
                status: OrderStatus::Accepted,
            });
        }

        state.apply_fill(
            &request.symbol,
            request.side,
            request.qty,
            price,
            request.reduce_only,
            self.leverage,
        );
        Ok(OrderAck {
            order_id,
            status: OrderStatus::Filled {
                avg_price: price,
                qty: request.qty,
            },
        })
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>> {
        let state = self.lock();
        if state.fail_positions {
            return Err(TradingError::ExchangeUnavailable(
                "paper exchange: position endpoint down".to_string(),
            ));
        }
        let mut positions: Vec<_> = state.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn get_open_orders(&self) -> Result<Vec<ExchangeOrder>> {
        let state = self.lock();
        if state.fail_positions {
            return Err(TradingError::ExchangeUnavailable(
                "paper exchange: order endpoint down".to_string(),
            ));
        }
        Ok(state.orders.values().cloned().collect())
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let mut state = self.lock();
        let cancelled = state.orders.remove(order_id);
        if cancelled.is_some_and(|o| o.kind == OrderKind::StopLoss) {
            if let Some(position) = state.positions.get_mut(symbol) {
                position.stop_loss = None;
            }
        }
        Ok(())
    }

    async fn get_balance(&self) -> Result<Balance> {
        let state = self.lock();
        let margin: f64 = state
            .positions
            .values()
            .map(|p| p.entry_price * p.size / p.leverage.unwrap_or(self.leverage).max(1.0))
            .sum();
        Ok(Balance {
            total: state.balance,
            available: (state.balance - margin).max(0.0),
        })
    }

    async fn place_stop_loss(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        trigger_price: f64,
    ) -> Result<OrderAck> {
        let mut state = self.lock();
        if state.fail_orders {
            return Err(TradingError::ExchangeUnavailable(
                "paper exchange: order endpoint down".to_string(),
            ));
        }
        let order_id = state.next_order_id();
        state.placed_orders += 1;
        state.orders.insert(
            order_id.clone(),
            ExchangeOrder {
                order_id: order_id.clone(),
                symbol: symbol.to_string(),
                side: side.exit_order_side(),
                kind: OrderKind::StopLoss,
                qty,
                price: None,
                trigger_price: Some(trigger_price),
                reduce_only: true,
                created_at: Utc::now(),
            },
        );
        if let Some(position) = state.positions.get_mut(symbol) {
            position.stop_loss = Some(trigger_price);
        }
        Ok(OrderAck {
            order_id,
            status: OrderStatus::Accepted,
        })
    }

    async fn get_symbols(&self) -> Result<Vec<String>> {
        if let Some(source) = &self.market_data {
            return source.get_symbols().await;
        }
        let mut symbols: Vec<String> = self.lock().candles.keys().cloned().collect();
        symbols.sort();
        Ok(symbols)
    }
}
