use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// OHLCV candlestick, ordered oldest -> newest in every series
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// A candle is closed once its whole timeframe has elapsed
    pub fn is_closed(&self, timeframe: Timeframe, now: DateTime<Utc>) -> bool {
        now >= self.open_time + timeframe.duration()
    }
}

/// Candle interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[default]
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub fn minutes(&self) -> i64 {
        match self {
            Timeframe::M1 => 1,
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::M30 => 30,
            Timeframe::H1 => 60,
            Timeframe::H4 => 240,
            Timeframe::H6 => 360,
            Timeframe::H12 => 720,
            Timeframe::D1 => 1440,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(self.minutes())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::H6 => "6h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1d",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "30m" => Ok(Timeframe::M30),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "6h" => Ok(Timeframe::H6),
            "12h" => Ok(Timeframe::H12),
            "1d" => Ok(Timeframe::D1),
            other => Err(format!("unknown timeframe '{}'", other)),
        }
    }
}

/// Position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Order side that opens a position in this direction
    pub fn entry_order_side(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Order side that closes a position in this direction
    pub fn exit_order_side(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        }
    }

    /// +1 for long, -1 for short
    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => f.write_str("LONG"),
            Side::Short => f.write_str("SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Trend direction from the EMA comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Trend {
    Up,
    Down,
    #[default]
    Flat,
}

/// Trading signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Signal {
    EnterLong,
    EnterShort,
    ExitLong,
    ExitShort,
    Hold,
    #[default]
    #[serde(rename = "NONE")]
    NoSignal,
}

impl Signal {
    /// Side to open, if this is an entry signal
    pub fn entry_side(&self) -> Option<Side> {
        match self {
            Signal::EnterLong => Some(Side::Long),
            Signal::EnterShort => Some(Side::Short),
            _ => None,
        }
    }

    /// True if this signal asks to leave a position on the given side
    pub fn exits(&self, side: Side) -> bool {
        matches!(
            (self, side),
            (Signal::ExitLong, Side::Long) | (Signal::ExitShort, Side::Short)
        )
    }
}

/// Result of one entry filter, kept for observability
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterOutcome {
    pub allowed: bool,
    pub reason: String,
}

impl FilterOutcome {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Latest RSI/trend/signal computation for a symbol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalRecord {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// None when there were not enough closed candles
    pub rsi: Option<f64>,
    pub trend: Trend,
    pub signal: Signal,
    pub computed_at: DateTime<Utc>,
    /// Latest traded price, forming candle included
    pub last_price: Option<f64>,
    pub closed_candles: usize,
    /// First filter that blocked an entry
    pub blocked_by: Option<String>,
    pub maturity_info: Option<FilterOutcome>,
    pub time_filter_info: Option<FilterOutcome>,
    pub exit_scam_info: Option<FilterOutcome>,
}

impl SignalRecord {
    /// Record for a symbol whose candles could not support an RSI
    pub fn insufficient(
        symbol: &str,
        timeframe: Timeframe,
        closed_candles: usize,
        last_price: Option<f64>,
        computed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            rsi: None,
            trend: Trend::Flat,
            signal: Signal::NoSignal,
            computed_at,
            last_price,
            closed_candles,
            blocked_by: None,
            maturity_info: None,
            time_filter_info: None,
            exit_scam_info: None,
        }
    }
}

/// Open position as reported by the exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: Option<f64>,
    pub leverage: Option<f64>,
    /// Stop-loss attached to the position itself, if the venue supports it
    pub stop_loss: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
    StopLoss,
}

/// Open (resting) order as reported by the exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExchangeOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub qty: f64,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub reduce_only: bool,
    pub created_at: DateTime<Utc>,
}
