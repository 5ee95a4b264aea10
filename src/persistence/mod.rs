//! Durable storage: bot state snapshots, the maturity set and trade history.

pub mod history;
pub mod maturity;
pub mod state;

use std::path::Path;

use tokio::io::AsyncWriteExt;

use crate::Result;

pub use history::{JsonlTradeHistory, TradeHistory};
pub use maturity::{FileMaturityStore, MaturityStore, RedisMaturityStore};
pub use state::{JsonFileStore, LoadedState, PersistedState, StateStore};

/// Replace `path` with `bytes` so readers see either the old or the new file
///
/// Writes a sibling temp file, fsyncs it, then renames it over the target.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = Path::new(&tmp_name);

    let mut file = tokio::fs::File::create(tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(tmp, path).await?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_dir() -> std::path::PathBuf {
    std::env::temp_dir().join(format!("rsibot-test-{}", uuid::Uuid::new_v4()))
}
