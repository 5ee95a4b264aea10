use crate::models::Candle;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Thread-safe in-memory buffer for candle data
///
/// Keeps a rolling window of candles per symbol. Fetches overlap the stored
/// tail, so merging replaces candles with the same open time (the forming
/// candle changes until it closes) and appends newer ones.
#[derive(Clone)]
pub struct CandleBuffer {
    data: Arc<RwLock<HashMap<String, VecDeque<Candle>>>>,
    max_candles: usize,
}

impl CandleBuffer {
    /// # Arguments
    /// * `max_candles` - Maximum number of candles to keep per symbol
    pub fn new(max_candles: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            max_candles,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, VecDeque<Candle>>> {
        match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, VecDeque<Candle>>> {
        match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Merge a fetched batch (oldest first) into the symbol's window
    pub fn merge(&self, symbol: &str, candles: &[Candle]) {
        let mut data = self.write();
        let stored = data.entry(symbol.to_string()).or_default();

        for candle in candles {
            let tail = stored.back().map(|c| c.open_time);
            match tail {
                Some(t) if t >= candle.open_time => {
                    // Same or older than the tail: replace in place if we have it
                    if let Some(existing) = stored.iter_mut().rev().find(|c| c.open_time == candle.open_time) {
                        *existing = candle.clone();
                    }
                }
                _ => stored.push_back(candle.clone()),
            }
        }

        while stored.len() > self.max_candles {
            stored.pop_front();
        }
    }

    /// All candles for a symbol, oldest first
    pub fn get_candles(&self, symbol: &str) -> Vec<Candle> {
        self.read()
            .get(symbol)
            .map(|deque| deque.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Close of the newest candle, forming or not
    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.read().get(symbol).and_then(|d| d.back()).map(|c| c.close)
    }

}
