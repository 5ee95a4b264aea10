// Entry limits, position sizing and running trade statistics
pub mod limits;
pub mod stats;

pub use limits::{bot_margin, order_quantity, position_margin, EntryLimits, Exposure, LimitTrip};
pub use stats::GlobalStats;
