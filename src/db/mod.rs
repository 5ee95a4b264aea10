// SQL-backed storage
pub mod postgres;

pub use postgres::PostgresTradeHistory;
