// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Bounded linear undo/redo history over file writes and edits. Reverts are
//! applied atomically via [`crate::transaction::FileTransaction`].
use std::collections::VecDeque;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::transaction::FileTransaction;

/// A single recorded file mutation, reversible via [`UndoManager::undo`].
#[derive(Debug, Clone)]
pub struct FileChange {
    pub id: String,
    pub path: PathBuf,
    pub tool_name: String,
    pub timestamp: DateTime<Utc>,
    /// `None` iff the file was newly created by this change.
    pub old_content: Option<Vec<u8>>,
    pub new_content: Vec<u8>,
    pub old_mode: u32,
    pub was_new: bool,
}

struct Inner {
    history: VecDeque<FileChange>,
    redo: VecDeque<FileChange>,
    max_history: usize,
    max_redo: usize,
}

/// Records file changes and reverts/reapplies them on request.
pub struct UndoManager {
    inner: Mutex<Inner>,
}

impl UndoManager {
    pub fn new(max_history: usize, max_redo: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                history: VecDeque::new(),
                redo: VecDeque::new(),
                max_history,
                max_redo,
            }),
        }
    }

    /// Record a change to `path`. `old_content` is `None` when the file did
    /// not exist before this write (a creation). Clears the redo stack.
    pub fn record(
        &self,
        path: impl Into<PathBuf>,
        tool_name: impl Into<String>,
        old_content: Option<Vec<u8>>,
        new_content: Vec<u8>,
        old_mode: u32,
    ) -> String {
        let mut inner = self.inner.lock().unwrap();
        let change = FileChange {
            id: Uuid::new_v4().to_string(),
            path: path.into(),
            tool_name: tool_name.into(),
            timestamp: Utc::now(),
            was_new: old_content.is_none(),
            old_content,
            new_content,
            old_mode,
        };
        let id = change.id.clone();
        inner.redo.clear();
        inner.history.push_back(change);
        while inner.history.len() > inner.max_history {
            inner.history.pop_front();
        }
        id
    }

    pub fn history_len(&self) -> usize {
        self.inner.lock().unwrap().history.len()
    }

    pub fn redo_len(&self) -> usize {
        self.inner.lock().unwrap().redo.len()
    }

    /// Pop the most recent change and revert it. On any I/O failure the
    /// change is restored to the undo stack so a retry is possible.
    pub fn undo(&self) -> Result<Option<FileChange>> {
        let change = {
            let mut inner = self.inner.lock().unwrap();
            match inner.history.pop_back() {
                Some(c) => c,
                None => return Ok(None),
            }
        };

        if let Err(e) = revert(&change) {
            let mut inner = self.inner.lock().unwrap();
            inner.history.push_back(change);
            return Err(e).context("undo failed, change restored to history");
        }

        let mut inner = self.inner.lock().unwrap();
        inner.redo.push_back(change.clone());
        while inner.redo.len() > inner.max_redo {
            inner.redo.pop_front();
        }
        Ok(Some(change))
    }

    /// Pop the most recently undone change and re-apply it.
    pub fn redo(&self) -> Result<Option<FileChange>> {
        let change = {
            let mut inner = self.inner.lock().unwrap();
            match inner.redo.pop_back() {
                Some(c) => c,
                None => return Ok(None),
            }
        };

        if let Err(e) = reapply(&change) {
            let mut inner = self.inner.lock().unwrap();
            inner.redo.push_back(change);
            return Err(e).context("redo failed, change restored to redo stack");
        }

        let mut inner = self.inner.lock().unwrap();
        inner.history.push_back(change.clone());
        while inner.history.len() > inner.max_history {
            inner.history.pop_front();
        }
        Ok(Some(change))
    }
}

/// Revert a change: remove the file if it was a creation, else atomically
/// restore the pre-image content and mode.
fn revert(change: &FileChange) -> Result<()> {
    let staging_root = change
        .path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    let mut txn = FileTransaction::new(&staging_root)
        .or_else(|_| FileTransaction::new(&std::env::temp_dir()))?;
    match &change.old_content {
        None => {
            txn.delete(&change.path)?;
        }
        Some(old) => {
            txn.write(&change.path, old, change.old_mode)?;
        }
    }
    txn.commit()
}

/// Re-apply a change that was previously undone.
fn reapply(change: &FileChange) -> Result<()> {
    let staging_root = change
        .path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    let mut txn = FileTransaction::new(&staging_root)
        .or_else(|_| FileTransaction::new(&std::env::temp_dir()))?;
    let mode = current_mode(&change.path).unwrap_or(change.old_mode);
    txn.write(&change.path, &change.new_content, mode)?;
    txn.commit()
}

fn current_mode(path: &std::path::Path) -> Option<u32> {
    std::fs::metadata(path).ok().map(|m| m.permissions().mode())
}
