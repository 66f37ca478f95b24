// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use sven_config::AgentMode;
use sven_tools::{events::TodoItem, ToolCall};

/// Events emitted by the agent during a single turn.
/// Consumers (CI runner, TUI) subscribe to these to drive their output.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A text chunk streamed from the model
    TextDelta(String),
    /// A complete text response from the model (after streaming finishes)
    TextComplete(String),
    /// A thinking/reasoning chunk from the model (extended thinking API).
    /// Consumers should accumulate deltas and finalise them into a Thinking
    /// segment when the model signals the end of the reasoning block.
    ThinkingDelta(String),
    /// A complete thinking/reasoning block (accumulated from ThinkingDelta events).
    ThinkingComplete(String),
    /// The model has requested a tool call
    ToolCallStarted(ToolCall),
    /// A tool call finished
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// Context was compacted; statistics for the UI
    ContextCompacted {
        tokens_before: usize,
        tokens_after: usize,
        strategy: CompactionStrategyUsed,
        /// Tool-round number at which compaction fired (0 = pre-submit).
        turn: u32,
    },
    /// Current token usage update
    TokenUsage {
        input: u32,
        output: u32,
        /// Tokens served from the provider's prompt cache this turn.
        cache_read: u32,
        /// Tokens written into the provider's prompt cache this turn.
        cache_write: u32,
        /// Running total of cache-read tokens for the session.
        cache_read_total: u64,
        /// Running total of cache-write tokens for the session.
        cache_write_total: u64,
        /// Context window size in effect for the current model.
        max_tokens: usize,
    },
    /// The agent has finished processing the current user turn
    TurnComplete,
    /// A recoverable error occurred
    Error(String),
    /// The todo list was updated
    TodoUpdate(Vec<TodoItem>),
    /// The agent mode was changed
    ModeChanged(AgentMode),
    /// The agent is asking the user a question (id links to QuestionAnswer)
    Question { id: String, questions: Vec<String> },
    /// Answer to a previous Question event
    QuestionAnswer { id: String, answer: String },
    /// A subagent delegation or help-request was dispatched.
    SubAgentSpawned { agent_id: String, agent_type: String },
    /// A subagent delegation or help-request finished.
    SubAgentFinished { agent_id: String, success: bool },
    /// The agent's scratchpad was updated.
    ScratchpadUpdated(String),
    /// Progress within a multi-step task (current step, total steps, description).
    Progress {
        step: u32,
        total_steps: u32,
        description: String,
    },
    /// The agent was aborted mid-stream; carries whatever text had already
    /// streamed before cancellation.
    Aborted { partial_text: String },
}

/// Records which compaction path was taken for a given `ContextCompacted` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStrategyUsed {
    /// Rolling LLM summarisation using the structured checkpoint format.
    Structured,
    /// Rolling LLM summarisation using the free-form narrative format.
    Narrative,
    /// Deterministic drop of old messages with no model call.
    Emergency,
}
