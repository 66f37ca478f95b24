// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tools that let an agent reach into the multi-agent runtime: ask a guide
//! agent a question, or delegate a subtask to a fresh general-purpose agent.
//! Both tools depend on a [`Messenger`] that does not exist until after the
//! top-level [`crate::runner::Runner`] is constructed, so it is injected via
//! a setter (a `tokio::sync::OnceCell`) rather than passed to `new()` — this
//! keeps `ToolRegistry` construction and `Runner`/`Messenger` construction
//! independent, with neither crate needing to know about the other's
//! lifetime.
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{oneshot, OnceCell};

use sven_config::AgentMode;
use sven_tools::{policy::ApprovalPolicy, Tool, ToolCall, ToolOutput};

use crate::messenger::{MessageKind, Messenger};

fn agent_type_arg(call: &ToolCall) -> Option<String> {
    call.args
        .get("agent_type")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Ask a `guide` (or other named) agent a question and return its answer.
/// Lightweight: no delegation-depth bookkeeping, bounded only by the
/// messenger's own response timeout.
pub struct HelpRequestTool {
    sender_agent_id: String,
    messenger: OnceCell<Arc<Messenger>>,
}

impl HelpRequestTool {
    pub fn new(sender_agent_id: impl Into<String>) -> Self {
        Self {
            sender_agent_id: sender_agent_id.into(),
            messenger: OnceCell::new(),
        }
    }

    /// Inject the shared messenger. Safe to call exactly once; a second call
    /// is a caller bug and is ignored rather than panicking.
    pub fn set_messenger(&self, messenger: Arc<Messenger>) {
        let _ = self.messenger.set(messenger);
    }
}

#[async_trait]
impl Tool for HelpRequestTool {
    fn name(&self) -> &str {
        "help_request"
    }

    fn description(&self) -> &str {
        "Ask another agent a question and wait for its answer. Use this for advice or a quick \
         lookup that doesn't require taking action — for action-taking subtasks use `delegate` \
         instead."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "agent_type": {
                    "type": "string",
                    "enum": ["explore", "bash", "general", "plan", "guide"],
                    "description": "Which kind of agent to ask (default: guide)"
                },
                "question": {
                    "type": "string",
                    "description": "The question to ask"
                }
            },
            "required": ["question"]
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    fn modes(&self) -> &[AgentMode] {
        &[AgentMode::Research, AgentMode::Plan, AgentMode::Agent]
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(messenger) = self.messenger.get() else {
            return ToolOutput::err(&call.id, "help_request: messenger not configured");
        };
        let question = match call.args.get("question").and_then(|v| v.as_str()) {
            Some(q) => q.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'question'"),
        };
        let target = agent_type_arg(call).unwrap_or_else(|| "guide".to_string());

        let id = messenger
            .send_message(&self.sender_agent_id, &target, MessageKind::HelpRequest, question, Value::Null)
            .await;
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        match messenger.receive_response(&id, cancel_rx).await {
            Ok(answer) => ToolOutput::ok(&call.id, answer),
            Err(e) => ToolOutput::err(&call.id, format!("help_request failed: {e}")),
        }
    }
}

/// Delegate a subtask to a fresh agent and wait for it to complete, subject
/// to the messenger's configured maximum delegation depth.
pub struct DelegateTool {
    sender_agent_id: String,
    delegation_depth: u32,
    messenger: OnceCell<Arc<Messenger>>,
}

impl DelegateTool {
    pub fn new(sender_agent_id: impl Into<String>, delegation_depth: u32) -> Self {
        Self {
            sender_agent_id: sender_agent_id.into(),
            delegation_depth,
            messenger: OnceCell::new(),
        }
    }

    pub fn set_messenger(&self, messenger: Arc<Messenger>) {
        let _ = self.messenger.set(messenger);
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        "delegate"
    }

    fn description(&self) -> &str {
        "Delegate a self-contained subtask to a fresh agent and wait for its result. The \
         delegate has its own tool access and context; it cannot see this conversation beyond \
         the prompt given here. Delegation depth is capped to prevent runaway recursion."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "agent_type": {
                    "type": "string",
                    "enum": ["explore", "bash", "general", "plan"],
                    "description": "Which kind of agent should carry out the subtask (default: general)"
                },
                "task": {
                    "type": "string",
                    "description": "Full, self-contained description of the subtask"
                }
            },
            "required": ["task"]
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    fn modes(&self) -> &[AgentMode] {
        &[AgentMode::Agent]
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(messenger) = self.messenger.get() else {
            return ToolOutput::err(&call.id, "delegate: messenger not configured");
        };
        let task = match call.args.get("task").and_then(|v| v.as_str()) {
            Some(t) => t.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'task'"),
        };
        let target = agent_type_arg(call).unwrap_or_else(|| "general".to_string());

        let id = messenger
            .send_message(
                &self.sender_agent_id,
                &target,
                MessageKind::Delegate,
                task,
                json!({ "delegation_depth": self.delegation_depth }),
            )
            .await;
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        match messenger.receive_response(&id, cancel_rx).await {
            Ok(output) => ToolOutput::ok(&call.id, output),
            Err(e) => ToolOutput::err(&call.id, format!("delegate failed: {e}")),
        }
    }
}
