// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Durable agent state: one JSON file per agent id under
//! `<store_dir>/agents/<agent_id>.json`, sufficient to resume a sub-agent's
//! conversation after a process restart.
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::warn;

use crate::types::SavedAgentState;

/// Reads and writes [`SavedAgentState`] snapshots under a configured
/// directory. Each save is a full-file overwrite — agent state is saved
/// infrequently (at natural pause points, not per tool call), so no
/// debouncing is warranted here unlike `sven_memory`'s stores.
pub struct AgentStateStore {
    agents_dir: PathBuf,
}

impl AgentStateStore {
    /// `store_dir` is the team store root (e.g. `~/.config/sven/team`);
    /// agent snapshots live in its `agents/` subdirectory.
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            agents_dir: store_dir.into().join("agents"),
        }
    }

    pub fn default_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("sven").join("team"))
            .unwrap_or_else(|| PathBuf::from(".sven/team"))
    }

    fn path_for(&self, agent_id: &str) -> PathBuf {
        self.agents_dir.join(format!("{agent_id}.json"))
    }

    pub fn save(&self, state: &SavedAgentState) -> Result<()> {
        std::fs::create_dir_all(&self.agents_dir)
            .with_context(|| format!("creating {}", self.agents_dir.display()))?;
        let path = self.path_for(&state.agent_id);
        let json = serde_json::to_string_pretty(state)?;
        std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))
    }

    /// Load a saved state. Returns `None` (with a warning log) on missing or
    /// corrupt files rather than failing — a corrupt snapshot should not
    /// block the runner from spawning a fresh agent in its place.
    pub fn load(&self, agent_id: &str) -> Option<SavedAgentState> {
        let path = self.path_for(agent_id);
        match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "agent state file corrupt, ignoring");
                    None
                }
            },
            Err(_) => None,
        }
    }

    pub fn delete(&self, agent_id: &str) -> Result<()> {
        let path = self.path_for(agent_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }

    pub fn list_ids(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.agents_dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                if path.extension().and_then(|s| s.to_str()) == Some("json") {
                    path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
                } else {
                    None
                }
            })
            .collect()
    }
}
