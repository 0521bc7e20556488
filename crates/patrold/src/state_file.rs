//! File-backed state provider
//!
//! The monitoring platform maintains a JSON snapshot of the inventory on
//! disk; the daemon reads it on each patrol. Percent normalization happens
//! in the engine, so the file may carry fractions or percentages.

use anyhow::{Context, Result};
use patrol_lib::providers::{async_trait, StateProvider};
use patrol_lib::snapshot::StateSnapshot;
use std::path::PathBuf;

/// Reads the inventory snapshot from a platform-maintained JSON file
pub struct FileStateProvider {
    path: PathBuf,
}

impl FileStateProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StateProvider for FileStateProvider {
    async fn get_state(&self) -> Result<StateSnapshot> {
        let data = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Failed to read state file {:?}", self.path))?;
        serde_json::from_slice(&data).context("Failed to parse state snapshot")
    }
}
