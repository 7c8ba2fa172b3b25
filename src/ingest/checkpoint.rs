//! Ingestion checkpoints: one JSON file mapping history paths to the last
//! processed line number.
//!
//! The file also mirrors the single most-recently-advanced entry in the
//! legacy flat fields so older builds can still read their state; a legacy
//! single-file state migrates into the map on load.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// File name inside the data directory.
pub const CHECKPOINT_FILE: &str = "codex-history-ingest-state.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IngestState {
    /// historyPath → last processed line number (1-based, inclusive).
    pub file_checkpoints: HashMap<String, u64>,
    /// Legacy mirror: the most recently advanced file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_processed_line_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl IngestState {
    /// Load state, migrating a legacy single-file layout into the map.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut state: IngestState =
            serde_json::from_str(&contents).context("failed to parse ingest state")?;

        // Legacy migration: a single-file state becomes a map entry. The
        // legacy fields are kept on disk for older builds.
        if let (Some(history_path), Some(line)) =
            (state.history_path.clone(), state.last_processed_line_number)
        {
            state
                .file_checkpoints
                .entry(history_path)
                .or_insert(line);
        }
        Ok(state)
    }

    /// Last processed line for a file; 0 when never seen.
    pub fn checkpoint_for(&self, path: &Path) -> u64 {
        self.file_checkpoints
            .get(&path_key(path))
            .copied()
            .unwrap_or(0)
    }

    /// Advance a file's checkpoint (never backwards) and refresh the legacy
    /// mirror.
    pub fn advance(&mut self, path: &Path, line_number: u64) {
        let key = path_key(path);
        let entry = self.file_checkpoints.entry(key.clone()).or_insert(0);
        if line_number > *entry {
            *entry = line_number;
            self.history_path = Some(key);
            self.last_processed_line_number = Some(line_number);
        }
        self.updated_at = Some(chrono::Utc::now().to_rfc3339());
    }

    /// Persist atomically (tmp + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Checkpoint file path inside a data directory.
pub fn checkpoint_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CHECKPOINT_FILE)
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
