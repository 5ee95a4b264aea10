use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::ExchangeSettings;
use crate::error::TradingError;
use crate::exchange::{Balance, ExchangeClient, OrderAck, OrderRequest, OrderStatus};
use crate::models::{
    Candle, ExchangeOrder, ExchangePosition, OrderKind, OrderSide, Side, Timeframe,
};
use crate::Result;

const CATEGORY: &str = "linear";
const MAX_KLINE_LIMIT: usize = 1000;
const MAX_PAGES: usize = 20;
const MAX_RETRIES: u32 = 3;
/// Bybit's "too many visits" return code
const RATE_LIMIT_RET_CODE: i64 = 10006;

type HmacSha256 = Hmac<Sha256>;

type BybitRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Bybit v5 client for USDT linear perpetuals
///
/// Cloneable; clones share the HTTP connection pool and the rate limiter.
#[derive(Clone)]
pub struct BybitClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    recv_window_ms: u64,
    rate_limiter: Arc<BybitRateLimiter>,
    filters: Arc<RwLock<HashMap<String, InstrumentFilters>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    ret_code: i64,
    ret_msg: String,
    #[serde(default)]
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct KlineResult {
    /// [startTime, open, high, low, close, volume, turnover], newest first
    list: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page<T> {
    list: Vec<T>,
    #[serde(default)]
    next_page_cursor: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionEntry {
    symbol: String,
    side: String,
    size: String,
    avg_price: String,
    #[serde(default)]
    mark_price: String,
    #[serde(default)]
    leverage: String,
    #[serde(default)]
    stop_loss: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderEntry {
    order_id: String,
    symbol: String,
    side: String,
    order_type: String,
    qty: String,
    #[serde(default)]
    price: String,
    #[serde(default)]
    trigger_price: String,
    #[serde(default)]
    reduce_only: bool,
    #[serde(default)]
    stop_order_type: String,
    #[serde(default)]
    order_status: String,
    #[serde(default)]
    avg_price: String,
    #[serde(default)]
    cum_exec_qty: String,
    #[serde(default)]
    reject_reason: String,
    #[serde(default)]
    created_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrderResult {
    order_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletAccount {
    total_equity: String,
    #[serde(default)]
    total_available_balance: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentEntry {
    symbol: String,
    status: String,
    quote_coin: String,
    #[serde(default)]
    lot_size_filter: LotSizeFilter,
    #[serde(default)]
    price_filter: PriceFilter,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LotSizeFilter {
    #[serde(default)]
    qty_step: String,
    #[serde(default)]
    min_order_qty: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriceFilter {
    #[serde(default)]
    tick_size: String,
}

/// Lot and tick granularity Bybit enforces on a symbol's orders
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentFilters {
    pub qty_step: f64,
    pub min_qty: f64,
    pub tick_size: f64,
    qty_decimals: usize,
    price_decimals: usize,
}

/// Digits after the point in a step like "0.001"
fn step_decimals(step: &str) -> usize {
    step.split_once('.')
        .map(|(_, frac)| frac.trim_end_matches('0').len())
        .unwrap_or(0)
}

/// `value` snapped to a multiple of `step`; a zero step passes it through
fn snap(value: f64, step: f64, decimals: usize, round: fn(f64) -> f64) -> String {
    if step <= 0.0 {
        return value.to_string();
    }
    // Nudge so 0.3 / 0.1 does not floor to 2
    let snapped = round(value / step + 1e-9) * step;
    format!("{:.*}", decimals, snapped)
}

impl InstrumentFilters {
    fn from_entry(entry: &InstrumentEntry) -> Self {
        let lot = &entry.lot_size_filter;
        Self {
            qty_step: parse_opt(&lot.qty_step).unwrap_or(0.0),
            min_qty: parse_opt(&lot.min_order_qty).unwrap_or(0.0),
            tick_size: parse_opt(&entry.price_filter.tick_size).unwrap_or(0.0),
            qty_decimals: step_decimals(&lot.qty_step),
            price_decimals: step_decimals(&entry.price_filter.tick_size),
        }
    }

    /// Quantity floored to the lot step; rejected below the minimum order size
    pub fn qty(&self, symbol: &str, qty: f64) -> Result<String> {
        let text = snap(qty, self.qty_step, self.qty_decimals, f64::floor);
        let snapped = text.parse::<f64>().unwrap_or(0.0);
        if snapped <= 0.0 || snapped < self.min_qty {
            return Err(TradingError::OrderSubmissionFailed {
                symbol: symbol.to_string(),
                reason: format!(
                    "quantity {} below minimum order size {}",
                    qty, self.min_qty
                ),
            });
        }
        Ok(text)
    }

    /// Price rounded to the nearest tick
    pub fn price(&self, price: f64) -> String {
        snap(price, self.tick_size, self.price_decimals, f64::round)
    }
}

fn parse_num(field: &str, value: &str) -> Result<f64> {
    value.parse::<f64>().map_err(|_| {
        TradingError::ExchangeUnavailable(format!("unparseable {} from Bybit: {:?}", field, value))
    })
}

fn parse_opt(value: &str) -> Option<f64> {
    value.parse::<f64>().ok().filter(|v| *v > 0.0)
}

fn parse_order_side(value: &str) -> Result<OrderSide> {
    match value {
        "Buy" => Ok(OrderSide::Buy),
        "Sell" => Ok(OrderSide::Sell),
        other => Err(TradingError::ExchangeUnavailable(format!(
            "unknown order side from Bybit: {:?}",
            other
        ))),
    }
}

fn order_side_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "Buy",
        OrderSide::Sell => "Sell",
    }
}

/// Bybit kline interval for a timeframe
pub fn interval(timeframe: Timeframe) -> &'static str {
    match timeframe {
        Timeframe::M1 => "1",
        Timeframe::M5 => "5",
        Timeframe::M15 => "15",
        Timeframe::M30 => "30",
        Timeframe::H1 => "60",
        Timeframe::H4 => "240",
        Timeframe::H6 => "360",
        Timeframe::H12 => "720",
        Timeframe::D1 => "D",
    }
}

/// X-BAPI-SIGN: hex HMAC-SHA256 over timestamp + key + recv window + payload
pub fn sign(secret: &str, timestamp: i64, api_key: &str, recv_window: u64, payload: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| TradingError::InvalidConfig(format!("bad API secret: {}", e)))?;
    mac.update(format!("{}{}{}{}", timestamp, api_key, recv_window, payload).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

impl BybitClient {
    pub fn new(settings: &ExchangeSettings, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(request_timeout).build()?;

        let rps = NonZeroU32::new(settings.requests_per_second).ok_or_else(|| {
            TradingError::InvalidConfig("requests_per_second must be positive".to_string())
        })?;
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(rps)));

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            api_secret: settings.api_secret.clone(),
            recv_window_ms: settings.recv_window_ms,
            rate_limiter,
            filters: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Decoded result of a call that Bybit accepted (ret_code 0)
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
        signed: bool,
    ) -> Result<T> {
        let envelope = self.send(method, path, query, body, signed).await?;
        if envelope.ret_code != 0 {
            return Err(TradingError::ExchangeUnavailable(format!(
                "Bybit {} error {}: {}",
                path, envelope.ret_code, envelope.ret_msg
            )));
        }
        Ok(serde_json::from_value(envelope.result)?)
    }

    /// Rate-limited request with backoff on 429, 5xx and Bybit rate-limit codes
    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
        signed: bool,
    ) -> Result<Envelope> {
        let query_string = query
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let url = if query_string.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query_string)
        };
        let body_text = body.map(|b| b.to_string());

        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            let mut builder = self.client.request(method.clone(), &url);
            if signed {
                let timestamp = Utc::now().timestamp_millis();
                let payload = body_text.as_deref().unwrap_or(&query_string);
                let signature = sign(
                    &self.api_secret,
                    timestamp,
                    &self.api_key,
                    self.recv_window_ms,
                    payload,
                )?;
                builder = builder
                    .header("X-BAPI-API-KEY", &self.api_key)
                    .header("X-BAPI-TIMESTAMP", timestamp.to_string())
                    .header("X-BAPI-RECV-WINDOW", self.recv_window_ms.to_string())
                    .header("X-BAPI-SIGN", signature);
            }
            if let Some(text) = &body_text {
                builder = builder
                    .header("Content-Type", "application/json")
                    .body(text.clone());
            }

            let response = match builder.send().await {
                Ok(response) => response,
                Err(e) if attempt < MAX_RETRIES && (e.is_timeout() || e.is_connect()) => {
                    let backoff_ms = 250 * 2u64.pow(attempt - 1);
                    tracing::warn!(
                        "Bybit {} network error: {}, retrying in {}ms (attempt {}/{})",
                        path,
                        e,
                        backoff_ms,
                        attempt,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                if attempt < MAX_RETRIES {
                    let backoff_ms = 250 * 2u64.pow(attempt - 1);
                    tracing::warn!(
                        "Bybit {} returned {}, backing off {}ms (attempt {}/{})",
                        path,
                        status,
                        backoff_ms,
                        attempt,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    continue;
                }
                return Err(TradingError::ExchangeUnavailable(format!(
                    "Bybit {} returned {}",
                    path, status
                )));
            }

            let text = response.text().await?;
            if !status.is_success() {
                return Err(TradingError::ExchangeUnavailable(format!(
                    "Bybit {} returned {}: {}",
                    path, status, text
                )));
            }

            let envelope: Envelope = serde_json::from_str(&text)?;
            if envelope.ret_code == RATE_LIMIT_RET_CODE && attempt < MAX_RETRIES {
                tracing::warn!("Bybit {} rate limited, backing off", path);
                tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                continue;
            }
            return Ok(envelope);
        }

        Err(TradingError::ExchangeUnavailable(format!(
            "Bybit {}: retries exhausted",
            path
        )))
    }

    /// Follow `nextPageCursor` until exhausted; a failed later page is PartialData
    async fn paged<T: DeserializeOwned>(
        &self,
        path: &str,
        base_query: Vec<(&str, String)>,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut cursor = String::new();

        for page in 0..MAX_PAGES {
            let mut query = base_query.clone();
            if !cursor.is_empty() {
                query.push(("cursor", cursor.clone()));
            }
            let result: Result<Page<T>> = self.request(Method::GET, path, &query, None, true).await;
            let page_data = match result {
                Ok(data) => data,
                Err(e) if page > 0 => {
                    return Err(TradingError::PartialData(format!(
                        "{} page {} failed after {} items: {}",
                        path,
                        page + 1,
                        items.len(),
                        e
                    )));
                }
                Err(e) => return Err(e),
            };
            items.extend(page_data.list);
            if page_data.next_page_cursor.is_empty() {
                return Ok(items);
            }
            cursor = page_data.next_page_cursor;
        }

        Err(TradingError::PartialData(format!(
            "{}: more than {} pages",
            path, MAX_PAGES
        )))
    }

    /// Cached lot and tick filters; fetched once per symbol
    pub async fn filters(&self, symbol: &str) -> Result<InstrumentFilters> {
        let cached = self
            .filters
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(symbol)
            .cloned();
        if let Some(filters) = cached {
            return Ok(filters);
        }

        let query = vec![
            ("category", CATEGORY.to_string()),
            ("symbol", symbol.to_string()),
        ];
        let page: Page<InstrumentEntry> = self
            .request(Method::GET, "/v5/market/instruments-info", &query, None, false)
            .await?;
        let entry = page
            .list
            .iter()
            .find(|i| i.symbol == symbol)
            .ok_or_else(|| TradingError::OrderSubmissionFailed {
                symbol: symbol.to_string(),
                reason: "instrument not listed on Bybit".to_string(),
            })?;
        let filters = InstrumentFilters::from_entry(entry);
        self.cache_filters(&page.list);
        Ok(filters)
    }

    fn cache_filters(&self, entries: &[InstrumentEntry]) {
        let mut cache = self.filters.write().unwrap_or_else(|p| p.into_inner());
        for entry in entries {
            cache.insert(entry.symbol.clone(), InstrumentFilters::from_entry(entry));
        }
    }

    async fn order_status(&self, symbol: &str, order_id: &str) -> Result<Option<OrderEntry>> {
        let query = vec![
            ("category", CATEGORY.to_string()),
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        let page: Page<OrderEntry> = self
            .request(Method::GET, "/v5/order/realtime", &query, None, true)
            .await?;
        Ok(page.list.into_iter().next())
    }
}

fn to_exchange_order(entry: OrderEntry) -> Result<ExchangeOrder> {
    let kind = if !entry.stop_order_type.is_empty() || parse_opt(&entry.trigger_price).is_some() {
        OrderKind::StopLoss
    } else if entry.order_type == "Limit" {
        OrderKind::Limit
    } else {
        OrderKind::Market
    };
    let created_at = entry
        .created_time
        .parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);

    Ok(ExchangeOrder {
        side: parse_order_side(&entry.side)?,
        qty: parse_num("qty", &entry.qty)?,
        price: parse_opt(&entry.price),
        trigger_price: parse_opt(&entry.trigger_price),
        reduce_only: entry.reduce_only,
        order_id: entry.order_id,
        symbol: entry.symbol,
        kind,
        created_at,
    })
}

#[async_trait]
impl ExchangeClient for BybitClient {
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        lookback: usize,
    ) -> Result<Vec<Candle>> {
        let query = vec![
            ("category", CATEGORY.to_string()),
            ("symbol", symbol.to_string()),
            ("interval", interval(timeframe).to_string()),
            ("limit", lookback.clamp(1, MAX_KLINE_LIMIT).to_string()),
        ];
        let result: KlineResult = self
            .request(Method::GET, "/v5/market/kline", &query, None, false)
            .await?;

        let mut candles = Vec::with_capacity(result.list.len());
        for row in result.list.iter().rev() {
            if row.len() < 6 {
                return Err(TradingError::ExchangeUnavailable(format!(
                    "{}: malformed kline row {:?}",
                    symbol, row
                )));
            }
            let start_ms = row[0].parse::<i64>().map_err(|_| {
                TradingError::ExchangeUnavailable(format!("{}: bad kline time {:?}", symbol, row[0]))
            })?;
            let Some(open_time) = Utc.timestamp_millis_opt(start_ms).single() else {
                continue;
            };
            candles.push(Candle {
                open_time,
                open: parse_num("open", &row[1])?,
                high: parse_num("high", &row[2])?,
                low: parse_num("low", &row[3])?,
                close: parse_num("close", &row[4])?,
                volume: parse_num("volume", &row[5])?,
            });
        }

        tracing::debug!("{}: fetched {} {} candles", symbol, candles.len(), timeframe);
        Ok(candles)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let order_type = match request.kind {
            OrderKind::Limit => "Limit",
            _ => "Market",
        };
        let filters = self.filters(&request.symbol).await?;
        let mut body = json!({
            "category": CATEGORY,
            "symbol": request.symbol,
            "side": order_side_str(request.side),
            "orderType": order_type,
            "qty": filters.qty(&request.symbol, request.qty)?,
            "reduceOnly": request.reduce_only,
            "orderLinkId": request.client_order_id,
        });
        if let Some(price) = request.price {
            body["price"] = json!(filters.price(price));
        }

        let envelope = self
            .send(Method::POST, "/v5/order/create", &[], Some(body), true)
            .await?;
        if envelope.ret_code != 0 {
            // Business rejection, not an outage
            return Ok(OrderAck {
                order_id: String::new(),
                status: OrderStatus::Rejected {
                    reason: format!("{}: {}", envelope.ret_code, envelope.ret_msg),
                },
            });
        }
        let created: CreateOrderResult = serde_json::from_value(envelope.result)?;

        // Market orders usually fill before the status is queryable
        let status = match self.order_status(&request.symbol, &created.order_id).await {
            Ok(Some(entry)) => match entry.order_status.as_str() {
                "Filled" => OrderStatus::Filled {
                    avg_price: parse_num("avgPrice", &entry.avg_price)?,
                    qty: parse_num("cumExecQty", &entry.cum_exec_qty)?,
                },
                "Rejected" | "Cancelled" | "Deactivated" => OrderStatus::Rejected {
                    reason: if entry.reject_reason.is_empty() {
                        entry.order_status
                    } else {
                        entry.reject_reason
                    },
                },
                _ => OrderStatus::Accepted,
            },
            Ok(None) => OrderStatus::Accepted,
            Err(e) => {
                tracing::warn!(
                    "{}: order {} placed, status unknown: {}",
                    request.symbol,
                    created.order_id,
                    e
                );
                OrderStatus::Accepted
            }
        };

        Ok(OrderAck {
            order_id: created.order_id,
            status,
        })
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>> {
        let entries: Vec<PositionEntry> = self
            .paged(
                "/v5/position/list",
                vec![
                    ("category", CATEGORY.to_string()),
                    ("settleCoin", "USDT".to_string()),
                    ("limit", "200".to_string()),
                ],
            )
            .await?;

        let mut positions = Vec::new();
        for entry in entries {
            let size = parse_num("size", &entry.size)?;
            let side = match entry.side.as_str() {
                "Buy" => Side::Long,
                "Sell" => Side::Short,
                _ => continue,
            };
            if size <= 0.0 {
                continue;
            }
            positions.push(ExchangePosition {
                side,
                size,
                entry_price: parse_num("avgPrice", &entry.avg_price)?,
                mark_price: parse_opt(&entry.mark_price),
                leverage: parse_opt(&entry.leverage),
                stop_loss: parse_opt(&entry.stop_loss),
                symbol: entry.symbol,
            });
        }
        Ok(positions)
    }

    async fn get_open_orders(&self) -> Result<Vec<ExchangeOrder>> {
        let entries: Vec<OrderEntry> = self
            .paged(
                "/v5/order/realtime",
                vec![
                    ("category", CATEGORY.to_string()),
                    ("settleCoin", "USDT".to_string()),
                    ("limit", "50".to_string()),
                ],
            )
            .await?;
        entries.into_iter().map(to_exchange_order).collect()
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "orderId": order_id,
        });
        let _: serde_json::Value = self
            .request(Method::POST, "/v5/order/cancel", &[], Some(body), true)
            .await?;
        Ok(())
    }

    async fn get_balance(&self) -> Result<Balance> {
        let query = vec![("accountType", "UNIFIED".to_string())];
        let page: Page<WalletAccount> = self
            .request(Method::GET, "/v5/account/wallet-balance", &query, None, true)
            .await?;
        let account = page.list.into_iter().next().ok_or_else(|| {
            TradingError::ExchangeUnavailable("wallet balance: no account".to_string())
        })?;
        let total = parse_num("totalEquity", &account.total_equity)?;
        Ok(Balance {
            total,
            available: parse_opt(&account.total_available_balance).unwrap_or(total),
        })
    }

    async fn place_stop_loss(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        trigger_price: f64,
    ) -> Result<OrderAck> {
        // 1 = trigger when price rises to it, 2 = when it falls to it
        let trigger_direction = match side {
            Side::Long => 2,
            Side::Short => 1,
        };
        let filters = self.filters(symbol).await?;
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "side": order_side_str(side.exit_order_side()),
            "orderType": "Market",
            "qty": filters.qty(symbol, qty)?,
            "triggerPrice": filters.price(trigger_price),
            "triggerDirection": trigger_direction,
            "reduceOnly": true,
            "closeOnTrigger": true,
            "orderLinkId": uuid::Uuid::new_v4().to_string(),
        });
        let created: CreateOrderResult = self
            .request(Method::POST, "/v5/order/create", &[], Some(body), true)
            .await?;
        Ok(OrderAck {
            order_id: created.order_id,
            status: OrderStatus::Accepted,
        })
    }

    async fn get_symbols(&self) -> Result<Vec<String>> {
        let query = vec![
            ("category", CATEGORY.to_string()),
            ("limit", "1000".to_string()),
        ];
        let page: Page<InstrumentEntry> = self
            .request(Method::GET, "/v5/market/instruments-info", &query, None, false)
            .await?;
        self.cache_filters(&page.list);
        let mut symbols: Vec<String> = page
            .list
            .into_iter()
            .filter(|i| i.status == "Trading" && i.quote_coin == "USDT")
            .map(|i| i.symbol)
            .collect();
        symbols.sort();
        Ok(symbols)
    }
}
