// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Durable memory store: an in-memory primary plus a debounced writer.
//! Global and per-project entries are persisted as JSON; session entries are
//! never written to disk. A single dirty bit and pending timer collapse
//! bursts of `add`/`edit`/`remove` calls into one flush per debounce window.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use sven_config::MemoryConfig;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::types::{MemoryEntry, MemoryType, ScoredEntry};

/// sha256(project_path)[:8], hex-encoded — the file-name key for a
/// project's memory and project-learning files.
pub fn project_hash(project_path: &Path) -> String {
    let digest = Sha256::digest(project_path.to_string_lossy().as_bytes());
    hex::encode(&digest[..8])
}

struct Inner {
    global: Vec<MemoryEntry>,
    projects: HashMap<String, Vec<MemoryEntry>>,
    session: Vec<MemoryEntry>,
    dirty: bool,
    /// Sending on this cancels the in-flight debounce timer.
    cancel_pending: Option<oneshot::Sender<()>>,
}

/// Durable, debounced store of [`MemoryEntry`] records.
///
/// Cheap to clone — internal state is `Arc`-shared so the debounce timer
/// task can hold its own handle.
#[derive(Clone)]
pub struct MemoryStore {
    memory_dir: PathBuf,
    max_entries: usize,
    debounce: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Load existing global/project files under `config.memory_dir` (default
    /// `~/.config/sven/memory/`) into memory.
    pub fn load(config: &MemoryConfig) -> Self {
        let memory_dir = config
            .memory_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(default_memory_dir);

        let global = read_json_file(&memory_dir.join("global.json")).unwrap_or_default();
        let projects = load_project_files(&memory_dir);

        Self {
            memory_dir,
            max_entries: config.max_entries,
            debounce: Duration::from_millis(config.debounce_ms),
            inner: Arc::new(Mutex::new(Inner {
                global,
                projects,
                session: Vec::new(),
                dirty: false,
                cancel_pending: None,
            })),
        }
    }

    /// Construct a store rooted at an explicit directory, bypassing
    /// `~/.config`. Used by tests and by callers that want an isolated
    /// store (e.g. per-CI-run).
    pub fn load_at(memory_dir: impl Into<PathBuf>, config: &MemoryConfig) -> Self {
        let memory_dir = memory_dir.into();
        let global = read_json_file(&memory_dir.join("global.json")).unwrap_or_default();
        let projects = load_project_files(&memory_dir);
        Self {
            memory_dir,
            max_entries: config.max_entries,
            debounce: Duration::from_millis(config.debounce_ms),
            inner: Arc::new(Mutex::new(Inner {
                global,
                projects,
                session: Vec::new(),
                dirty: false,
                cancel_pending: None,
            })),
        }
    }

    /// Add a new entry, auto-tagging its content. Schedules a debounced
    /// flush for non-session entries.
    pub fn add(
        &self,
        key: Option<String>,
        memory_type: MemoryType,
        content: impl Into<String>,
        project_path: Option<&Path>,
    ) -> MemoryEntry {
        let project_hash = if memory_type == MemoryType::Project {
            project_path.map(project_hash)
        } else {
            None
        };
        let entry = MemoryEntry::new(key, memory_type, content, project_hash.clone());

        {
            let mut inner = self.inner.lock().unwrap();
            match memory_type {
                MemoryType::Session => inner.session.push(entry.clone()),
                MemoryType::Global => {
                    inner.global.push(entry.clone());
                    prune_oldest(&mut inner.global, self.max_entries);
                }
                MemoryType::Project => {
                    let hash = project_hash.unwrap_or_default();
                    let bucket = inner.projects.entry(hash).or_default();
                    bucket.push(entry.clone());
                    prune_oldest(bucket, self.max_entries);
                }
            }
            inner.dirty = true;
        }

        if memory_type != MemoryType::Session {
            self.schedule_flush();
        }
        entry
    }

    /// Replace the content (and re-derive tags) of an existing entry.
    pub fn edit(&self, id: &str, new_content: impl Into<String>) -> bool {
        let content = new_content.into();
        let mut inner = self.inner.lock().unwrap();
        let found = find_mut(&mut inner.global, id)
            .or_else(|| inner.projects.values_mut().find_map(|v| find_mut(v, id)))
            .or_else(|| find_mut(&mut inner.session, id));
        let Some(entry) = found else { return false };
        entry.tags = crate::tagging::extract_tags(&content);
        entry.content = content;
        inner.dirty = true;
        drop(inner);
        self.schedule_flush();
        true
    }

    /// Remove an entry by id from whichever scope holds it.
    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let removed = remove_by_id(&mut inner.global, id)
            || inner.projects.values_mut().any(|v| remove_by_id(v, id))
            || remove_by_id(&mut inner.session, id);
        if removed {
            inner.dirty = true;
        }
        drop(inner);
        if removed {
            self.schedule_flush();
        }
        removed
    }

    /// Score and rank entries against `query`/`key`, truncated to `limit`.
    /// Exact key match scores 10, a tag hit scores 5, a content substring
    /// match scores 1; ties break on timestamp descending (newest first).
    /// Searches global, session, and (if given) the named project's bucket.
    pub fn search(
        &self,
        query: &str,
        key: Option<&str>,
        project_path: Option<&Path>,
        limit: usize,
    ) -> Vec<ScoredEntry> {
        let inner = self.inner.lock().unwrap();
        let mut all: Vec<&MemoryEntry> = inner.global.iter().chain(inner.session.iter()).collect();
        if let Some(path) = project_path {
            let hash = project_hash(path);
            if let Some(bucket) = inner.projects.get(&hash) {
                all.extend(bucket.iter());
            }
        }

        let mut scored: Vec<ScoredEntry> = all
            .into_iter()
            .filter_map(|e| score(e, query, key).map(|score| ScoredEntry { entry: e.clone(), score }))
            .collect();

        scored.sort_by(|a, b| b.score.cmp(&a.score).then(b.entry.timestamp.cmp(&a.entry.timestamp)));
        scored.truncate(limit);
        scored
    }

    /// Cancel any pending debounce timer and persist all dirty scopes
    /// immediately. Callers invoke this at shutdown.
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
        let (global, projects, was_dirty) = {
            let mut inner = self.inner.lock().unwrap();
            let was_dirty = inner.dirty;
            inner.dirty = false;
            (inner.global.clone(), inner.projects.clone(), was_dirty)
        };
        if !was_dirty {
            return Ok(());
        }
        std::fs::create_dir_all(&self.memory_dir)
            .with_context(|| format!("creating memory dir {}", self.memory_dir.display()))?;
        write_json_file(&self.memory_dir.join("global.json"), &global)?;
        for (hash, entries) in &projects {
            write_json_file(&self.memory_dir.join(format!("{hash}.json")), entries)?;
        }
        debug!(entries = global.len(), projects = projects.len(), "memory store flushed");
        Ok(())
    }

    /// Spawn (or re-arm) the debounce timer. A prior pending timer for this
    /// store is cancelled, so only the latest scheduled flush survives —
    /// collapsing a burst of writes into one disk write.
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
                        warn!(error = %e, "debounced memory flush failed");
                    }
                }
                _ = rx => {
                    // Superseded by a newer write; that write's own timer
                    // (or an explicit flush()) will persist this change.
                }
            }
        });
    }
}

fn default_memory_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".config/sven/memory")
}

fn load_project_files(dir: &Path) -> HashMap<String, Vec<MemoryEntry>> {
    let mut map = HashMap::new();
    let Ok(read) = std::fs::read_dir(dir) else {
        return map;
    };
    for entry in read.flatten() {
        let path = entry.path();
        if path.file_name().and_then(|n| n.to_str()) == Some("global.json") {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some(entries) = read_json_file::<Vec<MemoryEntry>>(&path) {
            map.insert(stem.to_string(), entries);
        }
    }
    map
}

fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let text = std::fs::read_to_string(path).ok()?;
    // §7: on load failure, start fresh rather than refuse to boot.
    match serde_json::from_str(&text) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "memory file corrupt, starting fresh");
            None
        }
    }
}

fn write_json_file<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))
}

fn prune_oldest(entries: &mut Vec<MemoryEntry>, max: usize) {
    if max == 0 || entries.len() <= max {
        return;
    }
    entries.sort_by_key(|e| e.timestamp);
    let overflow = entries.len() - max;
    entries.drain(0..overflow);
}

fn find_mut<'a>(entries: &'a mut [MemoryEntry], id: &str) -> Option<&'a mut MemoryEntry> {
    entries.iter_mut().find(|e| e.id == id)
}

fn remove_by_id(entries: &mut Vec<MemoryEntry>, id: &str) -> bool {
    let before = entries.len();
    entries.retain(|e| e.id != id);
    entries.len() != before
}

/// `None` if no signal matches at all; otherwise the summed score
/// (key=10, tag=5, content-substring=1 — all may stack).
fn score(entry: &MemoryEntry, query: &str, key: Option<&str>) -> Option<i32> {
    let mut score = 0;
    if let Some(k) = key {
        if entry.key.as_deref() == Some(k) {
            score += 10;
        }
    }
    if !query.is_empty() {
        if entry.tags.iter().any(|t| t.eq_ignore_ascii_case(query)) {
            score += 5;
        }
        if entry.content.to_lowercase().contains(&query.to_lowercase()) {
            score += 1;
        }
    }
    if score > 0 {
        Some(score)
    } else {
        None
    }
}
