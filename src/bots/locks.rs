use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-symbol async locks
///
/// Everything that mutates one symbol's bot (ticks, reconciliation, API
/// calls) goes through here so those operations are sequenced.
#[derive(Debug, Clone)]
pub struct SymbolLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
    timeout: Duration,
}

/// Result of an acquisition attempt; releases on drop
#[derive(Debug)]
pub struct ScopedLock {
    symbol: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ScopedLock {
    pub fn acquired(&self) -> bool {
        self.guard.is_some()
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

impl SymbolLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    fn entry(&self, symbol: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait up to the configured timeout for the symbol's lock
    pub async fn acquire(&self, symbol: &str) -> ScopedLock {
        self.acquire_with_timeout(symbol, self.timeout).await
    }

    pub async fn acquire_with_timeout(&self, symbol: &str, timeout: Duration) -> ScopedLock {
        let mutex = self.entry(symbol);
        let guard = match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                tracing::debug!("{}: lock not acquired within {:?}", symbol, timeout);
                None
            }
        };
        ScopedLock {
            symbol: symbol.to_string(),
            guard,
        }
    }
}
