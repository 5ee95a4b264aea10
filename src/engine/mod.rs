//! The trading core and the background loops that drive it.
//!
//! One [`TradingCore`] owns the bot registry, the signal cache and the
//! auto-bot config. Signal refresh, bot ticks, reconciliation and the
//! auto-bot orchestrator all run against it, sequenced per symbol.

pub mod autobot;
pub mod reconcile;
pub mod runner;
pub mod signal_refresh;
pub mod trading_core;
pub mod workers;

pub use autobot::AutoBotReport;
pub use reconcile::ReconcileReport;
pub use runner::TickOutcome;
pub use signal_refresh::RefreshSummary;
pub use trading_core::{normalize_symbol, CoreDeps, TradingCore};
pub use workers::Workers;

#[cfg(test)]
mod tests;
