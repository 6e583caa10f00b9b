//! Persistent storage for the catalog emulator

use crate::EmulatorState;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// JSON file holding emulator state between runs
#[derive(Debug, Clone)]
pub struct FileStorage {
    file_path: PathBuf,
}

impl FileStorage {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Load state from file; a missing file is an empty catalog
    pub async fn load(&self) -> Result<EmulatorState> {
        if !self.exists() {
            return Ok(EmulatorState::default());
        }

        let content = tokio::fs::read_to_string(&self.file_path)
            .await
            .with_context(|| format!("reading {}", self.file_path.display()))?;
        let state: EmulatorState = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", self.file_path.display()))?;
        tracing::debug!(path = %self.file_path.display(), "loaded emulator state");
        Ok(state)
    }

    /// Save state to file
    pub async fn save(&self, state: &EmulatorState) -> Result<()> {
        let content = serde_json::to_string_pretty(state)?;

        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        tokio::fs::write(&self.file_path, content)
            .await
            .with_context(|| format!("writing {}", self.file_path.display()))?;
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.file_path.exists()
    }
}
