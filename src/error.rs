use thiserror::Error;

/// Every failure the trading core can surface.
///
/// The first group mirrors the decision taxonomy used by the bots and the
/// reconciler; the tail wraps the infrastructure errors of the collaborators.
#[derive(Error, Debug)]
pub enum TradingError {
    #[error("insufficient data for {symbol}: {have} closed candles, need {need}")]
    InsufficientData {
        symbol: String,
        have: usize,
        need: usize,
    },

    #[error("entry blocked for {symbol}: {reason}")]
    FilterBlocked { symbol: String, reason: String },

    #[error("order submission failed for {symbol}: {reason}")]
    OrderSubmissionFailed { symbol: String, reason: String },

    #[error("order timed out after {secs}s: {operation}")]
    OrderTimeout { operation: String, secs: u64 },

    #[error("exchange unavailable: {0}")]
    ExchangeUnavailable(String),

    #[error("partial data from exchange: {0}")]
    PartialData(String),

    #[error("state corrupted for {scope}: {reason}")]
    StateCorrupted { scope: String, reason: String },

    #[error("concurrency limit reached: {active}/{max} bots active")]
    ConcurrencyLimitReached { active: usize, max: usize },

    #[error("risk cap exceeded: margin {required:.2} USDT, {available:.2} USDT left under cap")]
    RiskCapExceeded { required: f64, available: f64 },

    #[error("bot already exists for {0}")]
    BotAlreadyExists(String),

    #[error("no bot for {0}")]
    BotNotFound(String),

    #[error("timed out waiting for lock on {0}")]
    LockTimeout(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl TradingError {
    /// Stable machine-readable code for the API layer.
    pub fn code(&self) -> &'static str {
        match self {
            TradingError::InsufficientData { .. } => "INSUFFICIENT_DATA",
            TradingError::FilterBlocked { .. } => "FILTER_BLOCKED",
            TradingError::OrderSubmissionFailed { .. } => "ORDER_SUBMISSION_FAILED",
            TradingError::OrderTimeout { .. } => "ORDER_TIMEOUT",
            TradingError::ExchangeUnavailable(_) => "EXCHANGE_UNAVAILABLE",
            TradingError::PartialData(_) => "PARTIAL_DATA",
            TradingError::StateCorrupted { .. } => "STATE_CORRUPTED",
            TradingError::ConcurrencyLimitReached { .. } => "CONCURRENCY_LIMIT_REACHED",
            TradingError::RiskCapExceeded { .. } => "RISK_CAP_EXCEEDED",
            TradingError::BotAlreadyExists(_) => "BOT_ALREADY_EXISTS",
            TradingError::BotNotFound(_) => "BOT_NOT_FOUND",
            TradingError::LockTimeout(_) => "LOCK_TIMEOUT",
            TradingError::InvalidConfig(_) | TradingError::Config(_) => "INVALID_CONFIG",
            TradingError::Io(_)
            | TradingError::Json(_)
            | TradingError::Redis(_)
            | TradingError::Database(_)
            | TradingError::Migration(_) => "STORAGE_ERROR",
            TradingError::Http(_) => "EXCHANGE_UNAVAILABLE",
        }
    }

    /// Errors worth another attempt within the same bounded retry budget.
    pub fn is_transient(&self) -> bool {
        match self {
            TradingError::ExchangeUnavailable(_)
            | TradingError::PartialData(_)
            | TradingError::OrderTimeout { .. } => true,
            TradingError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}
