// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Durable memory and error-pattern stores for sven agents: a debounced,
//! JSON-backed [`MemoryStore`] scoped to session/project/global, a learned
//! error→solution [`ErrorStore`] with EMA success-rate tracking, and a YAML
//! [`project_learning`] notes file per project.
mod error_store;
pub mod project_learning;
mod store;
mod tagging;
mod types;

pub use error_store::ErrorStore;
pub use project_learning::{LearningNote, ProjectLearning};
pub use store::{project_hash, MemoryStore};
pub use types::{ErrorEntry, MemoryEntry, MemoryType, ScoredEntry, SUCCESS_RATE_ALPHA};
