// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sven_model::Message;
use uuid::Uuid;

/// One saved turn in the conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub role: String,
    pub content: String,
}

/// In-memory conversation session.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    /// Approximate total token count for the current message list
    pub token_count: usize,
    /// Maximum context tokens (set from model config / provider limits)
    pub max_tokens: usize,
    /// Maximum output tokens reserved for the model's reply.  Subtracted from
    /// `max_tokens` to get the usable input budget.
    pub max_output_tokens: usize,
    /// Estimated token cost of items sent with every request but not stored
    /// in `messages` (tool schemas, the dynamic git/CI context block).
    /// Recomputed once per turn by the agent.
    pub schema_overhead: usize,
    /// Running correction factor applied to the chars/4 token estimate,
    /// derived from the provider's actual reported input token counts.
    /// Starts at 1.0 (no correction) and is nudged by an exponential moving
    /// average each time `Usage` is observed.
    pub calibration_factor: f32,
    /// Cumulative prompt-cache read tokens reported by the provider this session.
    pub cache_read_total: u64,
    /// Cumulative prompt-cache write tokens reported by the provider this session.
    pub cache_write_total: u64,
}

impl Session {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
            token_count: 0,
            max_tokens,
            max_output_tokens: 0,
            schema_overhead: 0,
            calibration_factor: 1.0,
            cache_read_total: 0,
            cache_write_total: 0,
        }
    }

    /// Usable input budget: the context window minus the reserved output
    /// allowance.  Returns 0 when no context window is configured, which
    /// callers treat as "budget gating disabled".
    pub fn input_budget(&self) -> usize {
        if self.max_tokens == 0 {
            return 0;
        }
        self.max_tokens.saturating_sub(self.max_output_tokens)
    }

    /// Fold newly observed prompt-cache usage into the running totals.
    pub fn add_cache_usage(&mut self, cache_read: u32, cache_write: u32) {
        self.cache_read_total += cache_read as u64;
        self.cache_write_total += cache_write as u64;
    }

    /// Update `calibration_factor` from a provider's actual reported input
    /// token count vs. our chars/4 estimate for the same request.
    ///
    /// Uses an exponential moving average (alpha = 0.2) so a single noisy
    /// sample can't swing the factor wildly, and clamps to [0.5, 2.0] since
    /// anything outside that range indicates a bad sample (e.g. a retried
    /// request) rather than a real estimation bias.
    pub fn update_calibration(&mut self, actual_input: u32, estimated: usize) {
        if estimated == 0 {
            return;
        }
        let sample = actual_input as f32 / estimated as f32;
        if !sample.is_finite() || sample <= 0.0 {
            return;
        }
        const ALPHA: f32 = 0.2;
        let next = ALPHA * sample + (1.0 - ALPHA) * self.calibration_factor;
        self.calibration_factor = next.clamp(0.5, 2.0);
    }

    pub fn push(&mut self, msg: Message) {
        self.token_count += msg.approx_tokens();
        self.messages.push(msg);
    }

    pub fn push_many(&mut self, msgs: impl IntoIterator<Item = Message>) {
        for m in msgs { self.push(m); }
    }

    /// Fraction of context window consumed (0.0–1.0)
    pub fn context_fraction(&self) -> f32 {
        if self.max_tokens == 0 { return 0.0; }
        (self.token_count as f32) / (self.max_tokens as f32)
    }

    pub fn is_near_limit(&self, threshold: f32) -> bool {
        self.context_fraction() >= threshold
    }

    /// Recalculate token count from scratch (call after compaction).
    pub fn recalculate_tokens(&mut self) {
        self.token_count = self.messages.iter().map(|m| m.approx_tokens()).sum();
    }

    /// Replace the message list and recalculate token count (for resubmit / edit).
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.recalculate_tokens();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
