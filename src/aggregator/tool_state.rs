//! Tool-state file: which public tools the client gets to see.
//!
//! The file holds two lists of fully-qualified public names:
//!
//! ```json
//! {"enabled": ["mcp__syntropy__serena_find_symbol"], "disabled": ["mcp__syntropy__git_push"]}
//! ```
//!
//! Tools are enabled unless listed in `disabled`. The `enabled` list records
//! explicit re-enables so they survive edits by hand.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::ToolStateError;
use super::LOG_TARGET;

/// Persisted enable/disable lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolState {
    #[serde(default)]
    pub enabled: BTreeSet<String>,
    #[serde(default)]
    pub disabled: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ToolState {
    /// Load from `path`. A missing file is an empty state.
    pub fn load(path: &Path) -> Result<Self, ToolStateError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(ToolStateError::Io {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })
            }
        };

        let state: Self = serde_json::from_str(&content).map_err(|e| ToolStateError::Malformed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        tracing::info!(
            target: LOG_TARGET,
            path = %path.display(),
            disabled = state.disabled.len(),
            "loaded tool state"
        );
        Ok(state)
    }

    /// Write to `path` atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<(), ToolStateError> {
        let io_err = |e: std::io::Error| ToolStateError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        };

        let content = serde_json::to_string_pretty(self).map_err(|e| ToolStateError::Malformed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content).map_err(io_err)?;
        std::fs::rename(&tmp_path, path).map_err(io_err)?;

        tracing::debug!(target: LOG_TARGET, path = %path.display(), "saved tool state");
        Ok(())
    }

    /// Disabled wins; anything unlisted is enabled.
    pub fn is_enabled(&self, name: &str) -> bool {
        !self.disabled.contains(name)
    }

    /// Move names between the lists. A name in both inputs ends disabled.
    pub fn apply(&mut self, enable: &[String], disable: &[String]) {
        for name in enable {
            self.disabled.remove(name);
            self.enabled.insert(name.clone());
        }
        for name in disable {
            self.enabled.remove(name);
            self.disabled.insert(name.clone());
        }
        self.updated_at = Some(Utc::now());
    }
}

/// Shared tool state, optionally backed by a file.
#[derive(Debug)]
pub struct ToolStateStore {
    path: Option<PathBuf>,
    state: RwLock<ToolState>,
}

impl ToolStateStore {
    /// In-memory only; changes are lost on exit.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(ToolState::default()),
        }
    }

    pub fn open(path: PathBuf) -> Result<Self, ToolStateError> {
        let state = ToolState::load(&path)?;
        Ok(Self {
            path: Some(path),
            state: RwLock::new(state),
        })
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_enabled(name)
    }

    /// Apply and persist. The in-memory state changes even if saving fails.
    ///
    /// The write lock is held until the file is renamed into place, so
    /// concurrent updates reach the disk in the order they were applied.
    pub fn update(&self, enable: &[String], disable: &[String]) -> Result<ToolState, ToolStateError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.apply(enable, disable);
        if let Some(path) = &self.path {
            state.save(path)?;
        }
        let updated = state.clone();
        drop(state);

        tracing::info!(
            target: LOG_TARGET,
            enabled = enable.len(),
            disabled = disable.len(),
            "tool state updated"
        );
        Ok(updated)
    }
}
