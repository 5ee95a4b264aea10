use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::bots::TradeRecord;
use crate::Result;

/// Append-only record of completed trades
#[async_trait]
pub trait TradeHistory: Send + Sync {
    /// `Ok(false)` if a record with the same id is already stored
    async fn append(&self, record: &TradeRecord) -> Result<bool>;

    /// Newest first
    async fn recent(&self, limit: usize) -> Result<Vec<TradeRecord>>;
}

/// One JSON record per line
pub struct JsonlTradeHistory {
    path: PathBuf,
    seen: Mutex<HashSet<Uuid>>,
}

async fn read_records(path: &PathBuf) -> Result<Vec<TradeRecord>> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for (n, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TradeRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!("{}:{}: skipping bad trade line: {}", path.display(), n + 1, e),
        }
    }
    Ok(records)
}

impl JsonlTradeHistory {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let seen = read_records(&path).await?.into_iter().map(|r| r.id).collect();
        Ok(Self {
            path,
            seen: Mutex::new(seen),
        })
    }
}

#[async_trait]
impl TradeHistory for JsonlTradeHistory {
    async fn append(&self, record: &TradeRecord) -> Result<bool> {
        let mut seen = self.seen.lock().await;
        if seen.contains(&record.id) {
            tracing::debug!("{}: trade {} already recorded", record.symbol, record.id);
            return Ok(false);
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;

        seen.insert(record.id);
        Ok(true)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        let _guard = self.seen.lock().await;
        let records = read_records(&self.path).await?;
        Ok(records.into_iter().rev().take(limit).collect())
    }
}
