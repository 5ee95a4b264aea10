// Bot state machine, its protections and the per-symbol bookkeeping around it
pub mod bot;
pub mod locks;
pub mod protection;
pub mod registry;
pub mod trade;

pub use bot::{Bot, BotSettings, BotStatus, InvalidTransition};
pub use locks::{ScopedLock, SymbolLocks};
pub use protection::{evaluate_protections, pnl_percent, stop_loss_price, ExitReason, ProtectionCheck};
pub use registry::{BotRegistry, QuarantinedBot};
pub use trade::TradeRecord;
