use std::collections::BTreeSet;
use std::path::PathBuf;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

use super::write_atomic;
use crate::error::TradingError;
use crate::Result;

const REDIS_MATURE_KEY: &str = "rsibot:mature_symbols";

/// Sticky record of symbols that have shown enough history to trade
#[async_trait]
pub trait MaturityStore: Send + Sync {
    async fn is_mature(&self, symbol: &str) -> Result<bool>;

    /// Idempotent; a symbol is never unmarked
    async fn mark_mature(&self, symbol: &str) -> Result<()>;

    async fn mature_symbols(&self) -> Result<Vec<String>>;
}

/// JSON array of symbols on disk, cached in memory
pub struct FileMaturityStore {
    path: PathBuf,
    symbols: Mutex<BTreeSet<String>>,
}

impl FileMaturityStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let symbols = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<BTreeSet<String>>(&bytes).map_err(|e| {
                TradingError::StateCorrupted {
                    scope: path.display().to_string(),
                    reason: e.to_string(),
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::info!("Loaded {} mature symbols from {}", symbols.len(), path.display());
        Ok(Self {
            path,
            symbols: Mutex::new(symbols),
        })
    }
}

#[async_trait]
impl MaturityStore for FileMaturityStore {
    async fn is_mature(&self, symbol: &str) -> Result<bool> {
        Ok(self.symbols.lock().await.contains(symbol))
    }

    async fn mark_mature(&self, symbol: &str) -> Result<()> {
        let mut symbols = self.symbols.lock().await;
        if !symbols.insert(symbol.to_string()) {
            return Ok(());
        }
        let bytes = serde_json::to_vec_pretty(&*symbols)?;
        if let Err(e) = write_atomic(&self.path, &bytes).await {
            symbols.remove(symbol);
            return Err(e);
        }
        tracing::info!("{} marked mature", symbol);
        Ok(())
    }

    async fn mature_symbols(&self) -> Result<Vec<String>> {
        Ok(self.symbols.lock().await.iter().cloned().collect())
    }
}

/// Redis set shared by every process pointing at the same server
pub struct RedisMaturityStore {
    conn: ConnectionManager,
}

impl RedisMaturityStore {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| {
                TradingError::Redis(redis::RedisError::from((
                    redis::ErrorKind::IoError,
                    "Redis connection timeout after 5 seconds",
                )))
            })??;

        tracing::info!("Connected to Redis at {}", redis_url);
        Ok(Self { conn })
    }
}

#[async_trait]
impl MaturityStore for RedisMaturityStore {
    async fn is_mature(&self, symbol: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.sismember(REDIS_MATURE_KEY, symbol).await?)
    }

    async fn mark_mature(&self, symbol: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let added: usize = conn.sadd(REDIS_MATURE_KEY, symbol).await?;
        if added > 0 {
            tracing::info!("{} marked mature", symbol);
        }
        Ok(())
    }

    async fn mature_symbols(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut symbols: Vec<String> = conn.smembers(REDIS_MATURE_KEY).await?;
        symbols.sort();
        Ok(symbols)
    }
}
