// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sven_model::Message;

/// The fixed set of agent roles a [`crate::runner::Runner`] can spawn,
/// plus a registry escape hatch for dynamically-defined types.
///
/// Distinct from [`sven_config::AgentMode`], which gates tool availability
/// *within* one agent's loop; `AgentType` selects which system prompt /
/// tool profile / model a *newly spawned* agent gets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentType {
    /// Read-only investigation: greps, reads, summarizes. No writes.
    Explore,
    /// Shell-first agent for build/test/lint loops.
    Bash,
    /// Full read/write/execute agent — the default delegate/help target.
    General,
    /// Produces a structured plan; does not modify the workspace.
    Plan,
    /// Answers questions / gives advice without taking action — the
    /// natural target for a `help_request`.
    Guide,
    /// The top-level orchestrator role; never itself a delegation target.
    Coordinator,
    /// A type registered at runtime by name (see
    /// [`crate::runner::AgentSpawner`] implementations).
    Custom(String),
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentType::Explore => write!(f, "explore"),
            AgentType::Bash => write!(f, "bash"),
            AgentType::General => write!(f, "general"),
            AgentType::Plan => write!(f, "plan"),
            AgentType::Guide => write!(f, "guide"),
            AgentType::Coordinator => write!(f, "coordinator"),
            AgentType::Custom(name) => write!(f, "{name}"),
        }
    }
}

/// Lifecycle state of a spawned agent. Transitions are one-directional:
/// `Pending -> Running -> {Completed, Failed, Cancelled}`; terminal states
/// never revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl AgentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Cancelled)
    }
}

/// Current progress within a multi-step task, surfaced to the UI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Progress {
    pub step: u32,
    pub total_steps: u32,
    pub description: String,
}

/// Summary of tool usage over an agent's lifetime, attached to its result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolUsage {
    pub tool_name: String,
    pub call_count: u32,
    pub error_count: u32,
}

/// The terminal record of a spawned agent, created when it finishes and
/// mutable only by the [`crate::runner::Runner`] under its lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_id: String,
    pub agent_type: AgentType,
    pub status: AgentStatus,
    pub output: String,
    pub error: Option<String>,
    pub duration: Duration,
    pub completed: bool,
    pub tool_usage: Vec<ToolUsage>,
    /// When this result was produced — the key `Runner::store_result` sorts
    /// on to evict the oldest half of the retained-results cache.
    pub completed_at: DateTime<Utc>,
}

impl AgentResult {
    pub fn pending(agent_id: impl Into<String>, agent_type: AgentType) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type,
            status: AgentStatus::Pending,
            output: String::new(),
            error: None,
            duration: Duration::ZERO,
            completed: false,
            tool_usage: Vec::new(),
            completed_at: Utc::now(),
        }
    }
}

/// Durable snapshot of an agent sufficient to resume it, persisted by
/// [`crate::persistence::AgentStateStore`] as one JSON file per agent id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedAgentState {
    pub agent_id: String,
    pub agent_type: AgentType,
    pub model_id: String,
    pub max_turns: u32,
    pub history: Vec<Message>,
    pub saved_at: DateTime<Utc>,
}
