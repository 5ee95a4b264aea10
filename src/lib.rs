// Core modules
pub mod api;
pub mod bots;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod notify;
pub mod persistence;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use bots::{Bot, BotSettings, BotStatus, ExitReason, TradeRecord};
pub use config::{AppConfig, AutoBotConfig};
pub use engine::{CoreDeps, TradingCore, Workers};
pub use error::TradingError;
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, TradingError>;
