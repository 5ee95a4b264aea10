//! Layered application settings.
//!
//! Sources, lowest priority first: `config/default.toml` (optional), an
//! explicit file passed on the command line, then `RSIBOT__*` environment
//! variables (`RSIBOT__AUTOBOT__MAX_CONCURRENT_BOTS=3`). Every field has a
//! default, so an empty configuration is valid.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::TradingError;
use crate::indicators::TrendConfig;
use crate::models::Timeframe;
use crate::Result;

/// How a bot's position size is expressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VolumeMode {
    /// Fixed USDT margin per position
    #[default]
    Usdt,
    /// Fixed coin quantity per position
    Coins,
}

/// Global risk and signal parameters shared by every bot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutoBotConfig {
    /// Whether the orchestrator creates bots on its own
    pub enabled: bool,
    pub timeframe: Timeframe,
    pub rsi_period: usize,

    // RSI thresholds
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub rsi_exit_long: f64,
    pub rsi_exit_short: f64,

    // Trend avoidance
    pub avoid_down_trend: bool,
    pub avoid_up_trend: bool,
    pub trend: TrendConfig,

    // Protection, all in percent of margin (price move x leverage)
    pub leverage: f64,
    pub max_loss_percent: f64,
    pub trailing_stop_activation: f64,
    pub trailing_stop_distance: f64,
    /// 0 disables the time stop
    pub max_position_hours: u64,
    pub max_close_attempts: u32,

    // Capacity
    pub max_concurrent_bots: usize,
    pub risk_cap_percent: f64,
    pub default_volume_mode: VolumeMode,
    pub default_volume_value: f64,

    // Maturity filter
    pub min_candles_for_maturity: usize,

    // Time filter
    pub time_filter_enabled: bool,
    pub time_filter_candles: usize,
    pub time_filter_extreme_low: f64,
    pub time_filter_extreme_high: f64,
    pub time_filter_min_calm_candles: usize,

    // Rapid-move ("exit scam") filter
    pub exit_scam_enabled: bool,
    pub exit_scam_candles: usize,
    pub exit_scam_single_candle_percent: f64,
    pub exit_scam_multi_candle_count: usize,
    pub exit_scam_multi_candle_percent: f64,

    // Lifecycle
    pub adopt_external_positions: bool,
    pub inactive_bot_timeout_minutes: i64,
}

impl Default for AutoBotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeframe: Timeframe::H6,
            rsi_period: 14,
            rsi_oversold: 29.0,
            rsi_overbought: 71.0,
            rsi_exit_long: 65.0,
            rsi_exit_short: 35.0,
            avoid_down_trend: true,
            avoid_up_trend: true,
            trend: TrendConfig::default(),
            leverage: 1.0,
            max_loss_percent: 15.0,
            trailing_stop_activation: 50.0,
            trailing_stop_distance: 20.0,
            max_position_hours: 0,
            max_close_attempts: 5,
            max_concurrent_bots: 5,
            risk_cap_percent: 50.0,
            default_volume_mode: VolumeMode::Usdt,
            default_volume_value: 10.0,
            min_candles_for_maturity: 400,
            time_filter_enabled: true,
            time_filter_candles: 8,
            time_filter_extreme_low: 20.0,
            time_filter_extreme_high: 80.0,
            time_filter_min_calm_candles: 4,
            exit_scam_enabled: true,
            exit_scam_candles: 8,
            exit_scam_single_candle_percent: 15.0,
            exit_scam_multi_candle_count: 4,
            exit_scam_multi_candle_percent: 50.0,
            adopt_external_positions: true,
            inactive_bot_timeout_minutes: 180,
        }
    }
}

impl AutoBotConfig {
    /// Reject thresholds that would make the classifier or the protections incoherent
    pub fn validate(&self) -> Result<()> {
        let in_range = |v: f64| (0.0..=100.0).contains(&v);
        let checks: [(bool, &str); 12] = [
            (self.rsi_period >= 2, "rsi_period must be at least 2"),
            (
                in_range(self.rsi_oversold)
                    && in_range(self.rsi_overbought)
                    && in_range(self.rsi_exit_long)
                    && in_range(self.rsi_exit_short),
                "RSI thresholds must be within [0, 100]",
            ),
            (
                self.rsi_oversold < self.rsi_overbought,
                "rsi_oversold must be below rsi_overbought",
            ),
            (
                self.rsi_exit_long > self.rsi_oversold,
                "rsi_exit_long must be above rsi_oversold",
            ),
            (
                self.rsi_exit_short < self.rsi_overbought,
                "rsi_exit_short must be below rsi_overbought",
            ),
            (self.leverage >= 1.0, "leverage must be at least 1"),
            (self.max_loss_percent > 0.0, "max_loss_percent must be positive"),
            (
                self.trailing_stop_activation > 0.0 && self.trailing_stop_distance > 0.0,
                "trailing stop activation and distance must be positive",
            ),
            (
                self.risk_cap_percent > 0.0 && self.risk_cap_percent <= 100.0,
                "risk_cap_percent must be within (0, 100]",
            ),
            (
                self.default_volume_value > 0.0,
                "default_volume_value must be positive",
            ),
            (
                self.trend.ema_short > 0 && self.trend.ema_short < self.trend.ema_long,
                "trend EMA periods must satisfy 0 < short < long",
            ),
            (
                self.exit_scam_multi_candle_count > 0 && self.exit_scam_candles > 0,
                "exit scam candle counts must be positive",
            ),
        ];

        for (ok, message) in checks {
            if !ok {
                return Err(TradingError::InvalidConfig(message.to_string()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Simulated fills against live (or injected) market data
    #[default]
    Paper,
    Bybit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub kind: ExchangeKind,
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub recv_window_ms: u64,
    pub requests_per_second: u32,
    pub paper_initial_balance: f64,
    /// Symbols to trade; empty means every symbol the exchange lists
    pub symbols: Vec<String>,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            kind: ExchangeKind::Paper,
            base_url: "https://api.bybit.com".to_string(),
            api_key: String::new(),
            api_secret: String::new(),
            recv_window_ms: 5000,
            requests_per_second: 10,
            paper_initial_balance: 1000.0,
            symbols: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub state_path: PathBuf,
    pub maturity_path: PathBuf,
    pub history_path: PathBuf,
    /// Use Redis for the maturity set when present
    pub redis_url: Option<String>,
    /// Use Postgres for trade history when present
    pub database_url: Option<String>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("data/bots_state.json"),
            maturity_path: PathBuf::from("data/mature_coins.json"),
            history_path: PathBuf::from("data/trade_history.jsonl"),
            redis_url: None,
            database_url: None,
        }
    }
}

/// Worker intervals, timeouts and retry budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub signal_refresh_secs: u64,
    pub bot_tick_secs: u64,
    pub reconcile_secs: u64,
    pub autobot_secs: u64,
    pub lock_timeout_ms: u64,
    pub worker_pool_size: usize,
    pub candle_lookback: usize,
    pub pending_entry_grace_secs: i64,
    pub exchange_timeout_secs: u64,
    pub exchange_max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Consecutive failed reconciliation passes before alerting
    pub reconcile_alert_after: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            signal_refresh_secs: 60,
            bot_tick_secs: 15,
            reconcile_secs: 30,
            autobot_secs: 60,
            lock_timeout_ms: 2000,
            worker_pool_size: 8,
            candle_lookback: 500,
            pending_entry_grace_secs: 90,
            exchange_timeout_secs: 10,
            exchange_max_retries: 3,
            retry_backoff_ms: 500,
            reconcile_alert_after: 3,
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub exchange: ExchangeSettings,
    pub storage: StorageSettings,
    pub engine: EngineSettings,
    pub autobot: AutoBotConfig,
}

impl AppConfig {
    /// Load settings from the default file, an optional override file and the environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false));

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("RSIBOT")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("exchange.symbols")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.autobot.validate()?;

        if self.engine.worker_pool_size == 0 {
            return Err(TradingError::InvalidConfig(
                "worker_pool_size must be positive".to_string(),
            ));
        }
        if self.engine.candle_lookback <= self.autobot.rsi_period {
            return Err(TradingError::InvalidConfig(
                "candle_lookback must exceed rsi_period".to_string(),
            ));
        }
        if self.exchange.kind == ExchangeKind::Bybit
            && (self.exchange.api_key.is_empty() || self.exchange.api_secret.is_empty())
        {
            return Err(TradingError::InvalidConfig(
                "bybit exchange requires api_key and api_secret".to_string(),
            ));
        }
        Ok(())
    }
}
