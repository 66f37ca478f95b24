// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Durable error-pattern → solution index. Same debounced-durable shape as
//! [`crate::store::MemoryStore`], specialised for [`ErrorEntry`] records and
//! their success-rate learning.
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sven_config::MemoryConfig;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::types::ErrorEntry;

struct Inner {
    entries: Vec<ErrorEntry>,
    dirty: bool,
    cancel_pending: Option<oneshot::Sender<()>>,
}

/// Durable store of learned error→solution mappings.
#[derive(Clone)]
pub struct ErrorStore {
    path: PathBuf,
    debounce: Duration,
    max_age_days: i64,
    inner: Arc<Mutex<Inner>>,
}

impl ErrorStore {
    pub fn load(config: &MemoryConfig) -> Self {
        let path = config
            .error_store_file
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(default_error_store_path);
        Self::load_at(path, config)
    }

    pub fn load_at(path: impl Into<PathBuf>, config: &MemoryConfig) -> Self {
        let path = path.into();
        let entries = read_json_file(&path).unwrap_or_default();
        Self {
            path,
            debounce: Duration::from_millis(config.debounce_ms),
            max_age_days: config.error_max_age_days,
            inner: Arc::new(Mutex::new(Inner {
                entries,
                dirty: false,
                cancel_pending: None,
            })),
        }
    }

    /// Add a new learned error pattern. Returns the id.
    pub fn add(&self, error_type: impl Into<String>, pattern: impl Into<String>, solution: impl Into<String>) -> String {
        let entry = ErrorEntry::new(error_type, pattern, solution);
        let id = entry.id.clone();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.entries.push(entry);
            inner.dirty = true;
        }
        self.schedule_flush();
        id
    }

    /// Find the highest-success entry whose pattern is a substring of
    /// `error_text`, or whose tags match a word in it. Returns `None` if no
    /// pattern matches.
    pub fn find_solution(&self, error_text: &str) -> Option<ErrorEntry> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .filter(|e| error_text.contains(e.pattern.as_str()))
            .max_by(|a, b| a.success_rate.partial_cmp(&b.success_rate).unwrap())
            .cloned()
    }

    /// Record a successful (or failed) application of `id`'s solution,
    /// updating its EMA success rate.
    pub fn record_outcome(&self, id: &str, success: bool) -> bool {
        let found = {
            let mut inner = self.inner.lock().unwrap();
            match inner.entries.iter_mut().find(|e| e.id == id) {
                Some(e) => {
                    if success {
                        e.record_success();
                    } else {
                        e.record_failure();
                    }
                    inner.dirty = true;
                    true
                }
                None => false,
            }
        };
        if found {
            self.schedule_flush();
        }
        found
    }

    /// Drop entries older than `max_age_days` whose success rate is below
    /// 0.3. Returns the number pruned.
    pub fn prune(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(self.max_age_days);
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let before = inner.entries.len();
            inner
                .entries
                .retain(|e| !(e.created < cutoff && e.success_rate < 0.3));
            let removed = before - inner.entries.len();
            if removed > 0 {
                inner.dirty = true;
            }
            removed
        };
        if removed > 0 {
            self.schedule_flush();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn flush(&self) -> Result<()> {
        let cancel = {
            let mut inner = self.inner.lock().unwrap();
            inner.cancel_pending.take()
        };
        if let Some(tx) = cancel {
            let _ = tx.send(());
        }
        self.persist_now()
    }

    fn persist_now(&self) -> Result<()> {
        let (entries, was_dirty) = {
            let mut inner = self.inner.lock().unwrap();
            let was_dirty = inner.dirty;
            inner.dirty = false;
            (inner.entries.clone(), was_dirty)
        };
        if !was_dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&entries)?;
        std::fs::write(&self.path, json).with_context(|| format!("writing {}", self.path.display()))?;
        debug!(entries = entries.len(), "error store flushed");
        Ok(())
    }

    fn schedule_flush(&self) {
        let (tx, rx) = oneshot::channel();
        let previous = {
            let mut inner = self.inner.lock().unwrap();
            inner.cancel_pending.replace(tx)
        };
        if let Some(prev) = previous {
            let _ = prev.send(());
        }
        let store = self.clone();
        let debounce = self.debounce;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(debounce) => {
                    if let Err(e) = store.persist_now() {
                        warn!(error = %e, "debounced error-store flush failed");
                    }
                }
                _ = rx => {}
            }
        });
    }
}

fn default_error_store_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".config/sven/errors.json")
}

fn read_json_file(path: &Path) -> Option<Vec<ErrorEntry>> {
    let text = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&text) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "error store corrupt, starting fresh");
            None
        }
    }
}
