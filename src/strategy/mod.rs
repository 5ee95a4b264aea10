// Signal classification: RSI/trend rules gated by the entry filters
pub mod filters;
pub mod signals;

pub use filters::{exit_scam_filter, maturity_filter, time_filter};
pub use signals::{generate_signal, validate_candle_uniformity, MarketContext};
