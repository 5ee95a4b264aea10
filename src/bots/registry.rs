use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bot::Bot;
use crate::error::TradingError;
use crate::models::Side;
use crate::Result;

/// A persisted bot entry that failed to load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedBot {
    pub symbol: String,
    pub reason: String,
    /// Entry exactly as it was on disk
    pub raw: serde_json::Value,
    pub quarantined_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    bots: HashMap<String, Bot>,
    quarantined: HashMap<String, QuarantinedBot>,
}

/// All live bots, keyed by symbol
///
/// Critical sections are short and synchronous; the guard never crosses an
/// `.await`.
#[derive(Debug, Default)]
pub struct BotRegistry {
    inner: Mutex<Inner>,
}

impl BotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(bots: Vec<Bot>, quarantined: Vec<QuarantinedBot>) -> Self {
        let inner = Inner {
            bots: bots.into_iter().map(|b| (b.symbol.clone(), b)).collect(),
            quarantined: quarantined
                .into_iter()
                .map(|q| (q.symbol.clone(), q))
                .collect(),
        };
        Self {
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<Bot> {
        self.lock().bots.get(symbol).cloned()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.lock().bots.contains_key(symbol)
    }

    /// Bots sorted by symbol
    pub fn list(&self) -> Vec<Bot> {
        let inner = self.lock();
        let sorted: BTreeMap<_, _> = inner.bots.iter().collect();
        sorted.into_values().cloned().collect()
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.lock().bots.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn len(&self) -> usize {
        self.lock().bots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_count(&self) -> usize {
        self.lock().bots.values().filter(|b| b.is_active()).count()
    }

    /// Insert a bot for a symbol that has none
    ///
    /// Check and insert happen under one lock: of two racing creates the
    /// first wins and the second gets `BotAlreadyExists`. `admit` sees every
    /// current bot and can veto (concurrency and risk caps).
    pub fn insert_new<F>(&self, bot: Bot, admit: F) -> Result<Bot>
    where
        F: FnOnce(&[&Bot]) -> Result<()>,
    {
        let mut inner = self.lock();
        if let Some(q) = inner.quarantined.get(&bot.symbol) {
            return Err(TradingError::StateCorrupted {
                scope: bot.symbol.clone(),
                reason: format!("quarantined: {}", q.reason),
            });
        }
        if inner.bots.contains_key(&bot.symbol) {
            return Err(TradingError::BotAlreadyExists(bot.symbol));
        }
        let existing: Vec<&Bot> = inner.bots.values().collect();
        admit(&existing)?;
        inner.bots.insert(bot.symbol.clone(), bot.clone());
        Ok(bot)
    }

    /// IDLE -> PENDING_ENTRY, with the caps checked in the same critical section
    pub fn reserve_entry<F>(
        &self,
        symbol: &str,
        side: Side,
        now: DateTime<Utc>,
        admit: F,
    ) -> Result<Bot>
    where
        F: FnOnce(&[&Bot]) -> Result<()>,
    {
        let mut inner = self.lock();
        {
            let others: Vec<&Bot> = inner.bots.values().filter(|b| b.symbol != symbol).collect();
            if !inner.bots.contains_key(symbol) {
                return Err(TradingError::BotNotFound(symbol.to_string()));
            }
            admit(&others)?;
        }
        let bot = inner
            .bots
            .get_mut(symbol)
            .ok_or_else(|| TradingError::BotNotFound(symbol.to_string()))?;
        bot.begin_entry(side, now).map_err(|e| TradingError::StateCorrupted {
            scope: symbol.to_string(),
            reason: e.to_string(),
        })?;
        Ok(bot.clone())
    }

    /// Mutate one bot in place
    /// Mutate an existing bot only if `admit` accepts the other bots
    ///
    /// Check and mutation share one critical section, like `reserve_entry`.
    pub fn update_admitted<R, F>(
        &self,
        symbol: &str,
        admit: F,
        f: impl FnOnce(&mut Bot) -> R,
    ) -> Result<R>
    where
        F: FnOnce(&[&Bot]) -> Result<()>,
    {
        let mut inner = self.lock();
        {
            let others: Vec<&Bot> = inner.bots.values().filter(|b| b.symbol != symbol).collect();
            if !inner.bots.contains_key(symbol) {
                return Err(TradingError::BotNotFound(symbol.to_string()));
            }
            admit(&others)?;
        }
        inner
            .bots
            .get_mut(symbol)
            .map(f)
            .ok_or_else(|| TradingError::BotNotFound(symbol.to_string()))
    }

    pub fn update<R>(&self, symbol: &str, f: impl FnOnce(&mut Bot) -> R) -> Option<R> {
        self.lock().bots.get_mut(symbol).map(f)
    }

    pub fn remove(&self, symbol: &str) -> Option<Bot> {
        self.lock().bots.remove(symbol)
    }

    pub fn quarantine(&self, entry: QuarantinedBot) {
        let mut inner = self.lock();
        inner.bots.remove(&entry.symbol);
        inner.quarantined.insert(entry.symbol.clone(), entry);
    }

    pub fn is_quarantined(&self, symbol: &str) -> bool {
        self.lock().quarantined.contains_key(symbol)
    }

    pub fn quarantined(&self) -> Vec<QuarantinedBot> {
        let mut entries: Vec<_> = self.lock().quarantined.values().cloned().collect();
        entries.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        entries
    }

    /// Drop the quarantine mark and the raw entry
    pub fn resolve_quarantine(&self, symbol: &str) -> Option<QuarantinedBot> {
        self.lock().quarantined.remove(symbol)
    }

    /// Consistent copy of bots and quarantined entries for persistence
    pub fn snapshot(&self) -> (Vec<Bot>, Vec<QuarantinedBot>) {
        let inner = self.lock();
        let mut bots: Vec<Bot> = inner.bots.values().cloned().collect();
        bots.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        let mut quarantined: Vec<QuarantinedBot> = inner.quarantined.values().cloned().collect();
        quarantined.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        (bots, quarantined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bots::BotSettings;
    use crate::config::VolumeMode;
    use std::sync::Arc;

    fn bot(symbol: &str) -> Bot {
        Bot::new(
            symbol,
            BotSettings {
                volume_mode: VolumeMode::Usdt,
                volume_value: 10.0,
            },
            false,
            Utc::now(),
        )
    }

    fn admit_all(_: &[&Bot]) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let registry = BotRegistry::new();
        registry.insert_new(bot("BTCUSDT"), admit_all).unwrap();
        let err = registry.insert_new(bot("BTCUSDT"), admit_all).unwrap_err();
        assert!(matches!(err, TradingError::BotAlreadyExists(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_creates_single_winner() {
        let registry = Arc::new(BotRegistry::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.insert_new(bot("SOLUSDT"), admit_all).is_ok())
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_quarantined_symbol_cannot_be_created() {
        let registry = BotRegistry::new();
        registry.quarantine(QuarantinedBot {
            symbol: "XRPUSDT".to_string(),
            reason: "bad entry".to_string(),
            raw: serde_json::json!({"status": "???"}),
            quarantined_at: Utc::now(),
        });

        let err = registry.insert_new(bot("XRPUSDT"), admit_all).unwrap_err();
        assert_eq!(err.code(), "STATE_CORRUPTED");

        assert!(registry.resolve_quarantine("XRPUSDT").is_some());
        assert!(registry.insert_new(bot("XRPUSDT"), admit_all).is_ok());
    }

    #[test]
    fn test_reserve_entry_respects_admit() {
        let registry = BotRegistry::new();
        registry.insert_new(bot("A"), admit_all).unwrap();
        registry.insert_new(bot("B"), admit_all).unwrap();

        let now = Utc::now();
        registry.reserve_entry("A", Side::Long, now, admit_all).unwrap();

        // B sees A as active and the cap of one rejects it
        let err = registry
            .reserve_entry("B", Side::Long, now, |others| {
                let active = others.iter().filter(|b| b.is_active()).count();
                if active >= 1 {
                    return Err(TradingError::ConcurrencyLimitReached { active, max: 1 });
                }
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, TradingError::ConcurrencyLimitReached { .. }));
        assert!(!registry.get("B").unwrap().is_active());
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_update_admitted_leaves_bot_untouched_on_trip() {
        let registry = BotRegistry::new();
        registry.insert_new(bot("A"), admit_all).unwrap();
        registry.insert_new(bot("B"), admit_all).unwrap();
        registry.reserve_entry("A", Side::Long, Utc::now(), admit_all).unwrap();

        let cap_of_one = |others: &[&Bot]| {
            let active = others.iter().filter(|b| b.is_active()).count();
            if active >= 1 {
                return Err(TradingError::ConcurrencyLimitReached { active, max: 1 });
            }
            Ok(())
        };
        let err = registry
            .update_admitted("B", cap_of_one, |b| b.begin_entry(Side::Short, Utc::now()))
            .unwrap_err();
        assert!(matches!(err, TradingError::ConcurrencyLimitReached { .. }));
        assert!(!registry.get("B").unwrap().is_active());

        let err = registry
            .update_admitted("missing", admit_all, |_| ())
            .unwrap_err();
        assert!(matches!(err, TradingError::BotNotFound(_)));

        // A itself is excluded from its own check
        let touched = registry.update_admitted("A", cap_of_one, |_| true).unwrap();
        assert!(touched);
    }

    #[test]
    fn test_list_is_sorted() {
        let registry = BotRegistry::new();
        for s in ["C", "A", "B"] {
            registry.insert_new(bot(s), admit_all).unwrap();
        }
        let symbols: Vec<_> = registry.list().into_iter().map(|b| b.symbol).collect();
        assert_eq!(symbols, vec!["A", "B", "C"]);
    }
}
