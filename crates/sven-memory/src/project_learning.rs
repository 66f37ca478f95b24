// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-project learning: accumulated strategy notes persisted as YAML,
//! keyed by the same project hash used for project-scoped memory entries.
//! Distinct from [`crate::store::MemoryStore`]'s JSON-backed project files —
//! this is the "Project learning" persistence surface named separately in
//! the external-interfaces design.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::project_hash;

/// One recorded lesson about working in a given project — e.g. "tests
/// require `cargo nextest`, not `cargo test`".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningNote {
    pub content: String,
    pub recorded: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectLearning {
    pub notes: Vec<LearningNote>,
}

/// Load (or default-initialize) a project's learning file.
pub fn load(memory_dir: &Path, project_path: &Path) -> ProjectLearning {
    let path = learning_path(memory_dir, project_path);
    match std::fs::read_to_string(&path) {
        Ok(text) => serde_yaml::from_str(&text).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "project learning file corrupt, starting fresh");
            ProjectLearning::default()
        }),
        Err(_) => ProjectLearning::default(),
    }
}

/// Append a note and persist the file immediately (project learning is
/// low-frequency; no debounce is warranted).
pub fn record(memory_dir: &Path, project_path: &Path, content: impl Into<String>) -> Result<ProjectLearning> {
    let mut learning = load(memory_dir, project_path);
    learning.notes.push(LearningNote {
        content: content.into(),
        recorded: Utc::now(),
    });
    save(memory_dir, project_path, &learning)?;
    Ok(learning)
}

pub fn save(memory_dir: &Path, project_path: &Path, learning: &ProjectLearning) -> Result<()> {
    std::fs::create_dir_all(memory_dir)
        .with_context(|| format!("creating {}", memory_dir.display()))?;
    let path = learning_path(memory_dir, project_path);
    let yaml = serde_yaml::to_string(learning)?;
    std::fs::write(&path, yaml).with_context(|| format!("writing {}", path.display()))
}

fn learning_path(memory_dir: &Path, project_path: &Path) -> PathBuf {
    memory_dir.join(format!("{}.yaml", project_hash(project_path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn record_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let project = PathBuf::from("/repo/x");
        record(dir.path(), &project, "use cargo nextest").unwrap();
        let learning = load(dir.path(), &project);
        assert_eq!(learning.notes.len(), 1);
        assert_eq!(learning.notes[0].content, "use cargo nextest");
    }

    #[test]
    fn missing_file_yields_empty_learning() {
        let dir = tempdir().unwrap();
        let learning = load(dir.path(), Path::new("/repo/nope"));
        assert!(learning.notes.is_empty());
    }

    #[test]
    fn corrupt_file_starts_fresh() {
        let dir = tempdir().unwrap();
        let project = PathBuf::from("/repo/x");
        let path = learning_path(dir.path(), &project);
        std::fs::write(&path, "not: [valid: yaml:").unwrap();
        assert!(load(dir.path(), &project).notes.is_empty());
    }

    #[test]
    fn two_projects_get_distinct_files() {
        let dir = tempdir().unwrap();
        record(dir.path(), Path::new("/repo/a"), "note a").unwrap();
        record(dir.path(), Path::new("/repo/b"), "note b").unwrap();
        let a = load(dir.path(), Path::new("/repo/a"));
        let b = load(dir.path(), Path::new("/repo/b"));
        assert_eq!(a.notes[0].content, "note a");
        assert_eq!(b.notes[0].content, "note b");
    }
}
