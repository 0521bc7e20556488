//! File-backed persistence for findings and run history
//!
//! Writes JSON atomically: serialize to a temp file, sync, then rename over
//! the target. Load errors are surfaced to the stores, which treat them as
//! non-fatal and start fresh.

use anyhow::{Context, Result};
use patrol_lib::providers::{async_trait, FindingsPersistence, HistoryPersistence};
use patrol_lib::{Finding, PatrolRunRecord};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const FINDINGS_FILE: &str = "findings.json";
const HISTORY_FILE: &str = "patrol_history.json";

/// Persistence adapter rooted at a data directory
pub struct FilePersistence {
    dir: PathBuf,
}

impl FilePersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn save_json<T: Serialize>(&self, file_name: &str, value: &T) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create directory {:?}", self.dir))?;

        let path = self.dir.join(file_name);
        let json = serde_json::to_vec_pretty(value).context("Failed to serialize")?;

        let temp_path = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;

        file.write_all(&json).context("Failed to write data")?;
        file.sync_all().context("Failed to sync file")?;

        std::fs::rename(&temp_path, &path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

        Ok(())
    }

    fn load_json<T: DeserializeOwned>(&self, file_name: &str) -> Result<Vec<T>> {
        let path = self.dir.join(file_name);
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_json(&path)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data).context("Failed to read file")?;
    serde_json::from_slice(&data).context("Failed to deserialize")
}

#[async_trait]
impl FindingsPersistence for FilePersistence {
    async fn save_findings(&self, findings: &[Finding]) -> Result<()> {
        self.save_json(FINDINGS_FILE, &findings)
    }

    async fn load_findings(&self) -> Result<Vec<Finding>> {
        self.load_json(FINDINGS_FILE)
    }
}

#[async_trait]
impl HistoryPersistence for FilePersistence {
    async fn save_run_history(&self, records: &[PatrolRunRecord]) -> Result<()> {
        self.save_json(HISTORY_FILE, &records)
    }

    async fn load_run_history(&self) -> Result<Vec<PatrolRunRecord>> {
        self.load_json(HISTORY_FILE)
    }
}
