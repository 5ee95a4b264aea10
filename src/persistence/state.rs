use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::write_atomic;
use crate::bots::{Bot, QuarantinedBot, TradeRecord};
use crate::config::AutoBotConfig;
use crate::error::TradingError;
use crate::risk::GlobalStats;
use crate::Result;

const STATE_VERSION: u32 = 1;

/// Everything written to disk on each save
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub autobot: AutoBotConfig,
    pub stats: GlobalStats,
    /// Bots by symbol; kept as raw JSON so one bad entry cannot sink the file
    pub bots: BTreeMap<String, serde_json::Value>,
    /// Closed trades the history store has not accepted yet
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_trades: Vec<TradeRecord>,
}

impl PersistedState {
    /// Serialize live bots and carry quarantined entries over untouched
    pub fn capture(
        bots: &[Bot],
        quarantined: &[QuarantinedBot],
        autobot: &AutoBotConfig,
        stats: &GlobalStats,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for q in quarantined {
            entries.insert(q.symbol.clone(), q.raw.clone());
        }
        for bot in bots {
            entries.insert(bot.symbol.clone(), serde_json::to_value(bot)?);
        }
        Ok(Self {
            version: STATE_VERSION,
            saved_at: now,
            autobot: autobot.clone(),
            stats: stats.clone(),
            bots: entries,
            pending_trades: Vec::new(),
        })
    }

    pub fn with_pending_trades(mut self, trades: Vec<TradeRecord>) -> Self {
        self.pending_trades = trades;
        self
    }
}

/// Decoded state ready for the registry
#[derive(Debug, Clone)]
pub struct LoadedState {
    pub bots: Vec<Bot>,
    pub quarantined: Vec<QuarantinedBot>,
    pub autobot: AutoBotConfig,
    pub stats: GlobalStats,
    pub pending_trades: Vec<TradeRecord>,
}

impl LoadedState {
    /// Decode every bot entry; entries that fail are quarantined, not dropped
    pub fn decode(state: PersistedState, now: DateTime<Utc>) -> Self {
        let mut bots = Vec::new();
        let mut quarantined = Vec::new();

        for (symbol, raw) in state.bots {
            let decoded = serde_json::from_value::<Bot>(raw.clone())
                .map_err(|e| format!("undecodable: {}", e))
                .and_then(|bot| {
                    if bot.symbol != symbol {
                        return Err(format!("keyed as {} but holds {}", symbol, bot.symbol));
                    }
                    bot.validate().map(|_| bot)
                });

            match decoded {
                Ok(bot) => bots.push(bot),
                Err(reason) => {
                    tracing::error!("{}: quarantining persisted bot: {}", symbol, reason);
                    quarantined.push(QuarantinedBot {
                        symbol,
                        reason,
                        raw,
                        quarantined_at: now,
                    });
                }
            }
        }

        Self {
            bots,
            quarantined,
            autobot: state.autobot,
            stats: state.stats,
            pending_trades: state.pending_trades,
        }
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save(&self, state: &PersistedState) -> Result<()>;

    /// `Ok(None)` on first start; `StateCorrupted` if the store is unreadable
    async fn load(&self) -> Result<Option<PersistedState>>;
}

/// Pretty-printed JSON file, replaced atomically on every save
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn save(&self, state: &PersistedState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.path, &bytes).await?;
        tracing::debug!(
            "Saved state ({} bots) to {}",
            state.bots.len(),
            self.path.display()
        );
        Ok(())
    }

    async fn load(&self) -> Result<Option<PersistedState>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let state: PersistedState =
            serde_json::from_slice(&bytes).map_err(|e| TradingError::StateCorrupted {
                scope: self.path.display().to_string(),
                reason: e.to_string(),
            })?;

        if state.version != STATE_VERSION {
            return Err(TradingError::StateCorrupted {
                scope: self.path.display().to_string(),
                reason: format!("unsupported state version {}", state.version),
            });
        }

        tracing::info!(
            "Loaded state with {} bots from {} (saved {})",
            state.bots.len(),
            self.path.display(),
            state.saved_at
        );
        Ok(Some(state))
    }
}
