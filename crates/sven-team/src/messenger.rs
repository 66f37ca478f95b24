// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Inter-agent messenger: request/response channel fabric for help/delegate
//! traffic, plus per-type broadcast inboxes. One [`Messenger`] is shared by
//! every agent a [`crate::runner::Runner`] spawns; it never holds a
//! back-reference to the `Runner` struct itself — only to the narrower
//! [`AgentSpawner`] trait object the `Runner` hands it at construction,
//! breaking the Runner↔Messenger↔Agent cycle the design notes flag.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::runner::AgentSpawner;
use crate::types::AgentType;

/// What a [`Message`] is asking the recipient to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Lightweight: spawn a helper agent and return its advice text.
    HelpRequest,
    /// Heavier: spawn a delegate agent to carry out a subtask, subject to
    /// `max_delegation_depth`.
    Delegate,
    /// Fire-and-forget fan-out to every inbox registered for a type.
    Broadcast,
}

/// A single inter-agent message. Short-lived — it lives only until a
/// response is delivered or the request times out.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub sender_agent_id: String,
    /// Either a concrete agent id or a role/type name, depending on `kind`.
    pub target: String,
    pub kind: MessageKind,
    pub payload: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(thiserror::Error, Debug)]
pub enum MessengerError {
    #[error("Delegation failed: maximum depth ({0}) exceeded")]
    MaxDelegationDepthExceeded(u32),
    #[error("messenger response timed out after {0:?}")]
    Timeout(Duration),
    #[error("messenger call was cancelled, or no such pending message")]
    Cancelled,
    #[error("spawn failed: {0}")]
    SpawnFailed(#[from] anyhow::Error),
}

type Response = Result<String, MessengerError>;

/// Per-agent facade over a shared pending-response table and per-type
/// broadcast inboxes.
pub struct Messenger {
    spawner: Arc<dyn AgentSpawner>,
    max_delegation_depth: u32,
    response_timeout: Duration,
    pending: Mutex<HashMap<String, oneshot::Receiver<Response>>>,
    inboxes: Mutex<HashMap<String, Vec<mpsc::Sender<Message>>>>,
}

impl Messenger {
    pub fn new(spawner: Arc<dyn AgentSpawner>, max_delegation_depth: u32, response_timeout: Duration) -> Self {
        Self {
            spawner,
            max_delegation_depth,
            response_timeout,
            pending: Mutex::new(HashMap::new()),
            inboxes: Mutex::new(HashMap::new()),
        }
    }

    /// Register an inbox that [`Messenger::broadcast`] can deliver to for
    /// agents of `agent_type`.
    pub async fn register_inbox(&self, agent_type: &AgentType, sender: mpsc::Sender<Message>) {
        self.inboxes
            .lock()
            .await
            .entry(agent_type.to_string())
            .or_default()
            .push(sender);
    }

    /// Mint a message id, open a one-shot response channel, and dispatch the
    /// handler for `kind` off-task. Returns the message id immediately; call
    /// [`Messenger::receive_response`] with it to await the result.
    pub async fn send_message(
        &self,
        sender_agent_id: &str,
        target: &str,
        kind: MessageKind,
        payload: String,
        data: Value,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), rx);

        let message = Message {
            id: id.clone(),
            sender_agent_id: sender_agent_id.to_string(),
            target: target.to_string(),
            kind,
            payload,
            data,
            timestamp: Utc::now(),
        };

        let spawner = Arc::clone(&self.spawner);
        let max_depth = self.max_delegation_depth;
        tokio::spawn(async move {
            let result = handle_message(spawner, message, max_depth).await;
            // `oneshot::Sender::send` never blocks and never awaits: if the
            // receiver already timed out and was dropped, the value is
            // simply discarded — the handler task still exits promptly,
            // so no task is ever leaked by a timed-out receiver.
            let _ = tx.send(result);
        });

        id
    }

    /// Block on `id`'s response until delivery, external cancellation, or
    /// the messenger's response timeout (default 5 minutes). The pending
    /// entry for `id` is removed as soon as this call begins, so a second
    /// call with the same id always returns `Cancelled`.
    pub async fn receive_response(
        &self,
        id: &str,
        mut cancel: oneshot::Receiver<()>,
    ) -> Response {
        let rx = self.pending.lock().await.remove(id);
        let Some(mut rx) = rx else {
            return Err(MessengerError::Cancelled);
        };

        tokio::select! {
            result = &mut rx => result.unwrap_or(Err(MessengerError::Cancelled)),
            _ = &mut cancel => Err(MessengerError::Cancelled),
            _ = tokio::time::sleep(self.response_timeout) => Err(MessengerError::Timeout(self.response_timeout)),
        }
    }

    /// Deliver `message` to every inbox registered for `agent_type`,
    /// non-blocking: a full inbox is skipped with a debug log rather than
    /// awaited.
    pub async fn broadcast(&self, agent_type: &AgentType, message: Message) {
        let inboxes = self.inboxes.lock().await;
        let Some(senders) = inboxes.get(&agent_type.to_string()) else {
            return;
        };
        for sender in senders {
            if sender.try_send(message.clone()).is_err() {
                debug!(agent_type = %agent_type, "broadcast inbox full or closed, dropping");
            }
        }
    }

    /// Number of in-flight (not yet received) messages. Exposed for tests
    /// verifying no leak survives a timeout.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Spawns the agent appropriate for `message.kind` and produces its output
/// text (or a `MessengerError`) as the response payload.
async fn handle_message(
    spawner: Arc<dyn AgentSpawner>,
    message: Message,
    max_delegation_depth: u32,
) -> Response {
    match message.kind {
        MessageKind::HelpRequest => {
            let agent_type = agent_type_from_target(&message.target);
            let result = spawner.spawn_and_run(agent_type, message.payload.clone(), 0).await?;
            Ok(result.output)
        }
        MessageKind::Delegate => {
            let depth = message
                .data
                .get("delegation_depth")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32;
            if depth >= max_delegation_depth {
                return Err(MessengerError::MaxDelegationDepthExceeded(max_delegation_depth));
            }
            let agent_type = agent_type_from_target(&message.target);
            let result = spawner.spawn_and_run(agent_type, message.payload.clone(), depth + 1).await?;
            Ok(result.output)
        }
        MessageKind::Broadcast => Ok(String::new()),
    }
}

fn agent_type_from_target(target: &str) -> AgentType {
    match target {
        "explore" => AgentType::Explore,
        "bash" => AgentType::Bash,
        "general" => AgentType::General,
        "plan" => AgentType::Plan,
        "guide" => AgentType::Guide,
        "coordinator" => AgentType::Coordinator,
        other => AgentType::Custom(other.to_string()),
    }
}
