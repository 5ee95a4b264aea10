// Order execution and market data buffering
pub mod candle_buffer;
pub mod executor;

pub use candle_buffer::CandleBuffer;
pub use executor::{decide, ExecutionAction, ExecutionDecision, Executor, FillOutcome};
