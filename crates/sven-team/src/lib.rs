// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Multi-agent runtime: spawns, tracks, and retires sub-agents
//! ([`runner::Runner`]), dispatches them in bounded-parallel batches
//! ([`coordinator::Coordinator`]), and lets agents exchange help/delegate
//! messages ([`messenger::Messenger`]) without the runner and messenger
//! holding a reference cycle on each other.
pub mod coordinator;
pub mod messenger;
pub mod persistence;
pub mod runner;
pub mod tools;
pub mod types;

pub use coordinator::{Coordinator, CoordinatorTask, NullBroadcaster, UIBroadcaster};
pub use messenger::{Message, MessageKind, Messenger, MessengerError};
pub use persistence::AgentStateStore;
pub use runner::{AgentSpawner, Runner, RunnerCallbacks, RunnerError};
pub use tools::{DelegateTool, HelpRequestTool};
pub use types::{AgentResult, AgentStatus, AgentType, Progress, SavedAgentState, ToolUsage};
