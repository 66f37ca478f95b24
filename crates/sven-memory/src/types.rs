// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scope a [`MemoryEntry`] is stored under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    /// Transient — never written to disk, dropped with the store.
    Session,
    /// Persisted under the project's hash-keyed file.
    Project,
    /// Persisted in the shared `global.json`.
    Global,
}

/// A single learned or recorded fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    /// Optional lookup key; exact matches score highest in `search`.
    pub key: Option<String>,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub content: String,
    /// Auto-extracted from `content`: file paths, `func X`/`fn X`, `package
    /// X`/`mod X`.
    pub tags: Vec<String>,
    pub timestamp: DateTime<Utc>,
    /// Present for `MemoryType::Project` entries: sha256(project_path)[:8].
    pub project_hash: Option<String>,
}

impl MemoryEntry {
    pub fn new(
        key: Option<String>,
        memory_type: MemoryType,
        content: impl Into<String>,
        project_hash: Option<String>,
    ) -> Self {
        let content = content.into();
        let tags = crate::tagging::extract_tags(&content);
        Self {
            id: Uuid::new_v4().to_string(),
            key,
            memory_type,
            content,
            tags,
            timestamp: Utc::now(),
            project_hash,
        }
    }
}

/// A search hit with its relevance score, returned most-relevant first.
#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub entry: MemoryEntry,
    pub score: i32,
}

/// A learned error-pattern → solution mapping, with a success rate updated
/// via an exponential moving average (α = 0.3) as it is recorded used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub id: String,
    pub error_type: String,
    /// Substring matched against future error text.
    pub pattern: String,
    pub solution: String,
    pub tags: Vec<String>,
    /// Exponential moving average of past successes (α = 0.3), in [0, 1].
    pub success_rate: f32,
    pub use_count: u64,
    pub last_used: DateTime<Utc>,
    pub created: DateTime<Utc>,
}

/// EMA smoothing factor for `ErrorEntry::success_rate` updates.
pub const SUCCESS_RATE_ALPHA: f32 = 0.3;

impl ErrorEntry {
    pub fn new(error_type: impl Into<String>, pattern: impl Into<String>, solution: impl Into<String>) -> Self {
        let now = Utc::now();
        let solution = solution.into();
        Self {
            id: Uuid::new_v4().to_string(),
            error_type: error_type.into(),
            pattern: pattern.into(),
            tags: crate::tagging::extract_tags(&solution),
            solution,
            success_rate: 0.5,
            use_count: 0,
            last_used: now,
            created: now,
        }
    }

    /// Record a successful application of this entry's solution.
    pub fn record_success(&mut self) {
        self.success_rate = SUCCESS_RATE_ALPHA + (1.0 - SUCCESS_RATE_ALPHA) * self.success_rate;
        self.use_count += 1;
        self.last_used = Utc::now();
    }

    /// Record a failed application of this entry's solution.
    pub fn record_failure(&mut self) {
        self.success_rate = (1.0 - SUCCESS_RATE_ALPHA) * self.success_rate;
        self.use_count += 1;
        self.last_used = Utc::now();
    }
}
