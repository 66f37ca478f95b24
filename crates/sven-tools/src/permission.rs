// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Permission gate: risk classification, per-tool policy, a session cache of
//! prior human decisions, and dispatch to a human-in-the-loop prompt handler.
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};

use sven_config::PermissionConfig;

use crate::cache::TtlCache;
use crate::policy::{ApprovalPolicy, ToolPolicy};

/// Coarse risk classification used to decide whether a session-level
/// auto-approve can short-circuit a repeated Ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskLevel {
    /// Read-only: read/glob/grep/tree/env/list_dir/todo and similar.
    Low,
    /// File modifiers: write/edit.
    Medium,
    /// Shell execution.
    High,
}

/// Final outcome of a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    /// Allow, and remember this exact (tool, salient-arg) for the session.
    AllowSession,
    Deny,
    /// Deny, and remember this exact (tool, salient-arg) for the session.
    DenySession,
}

impl PermissionDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, PermissionDecision::Allow | PermissionDecision::AllowSession)
    }
}

/// What the gate asks a human (or automated) handler to decide.
#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub tool_name: String,
    pub args: Value,
    pub risk_level: RiskLevel,
    pub reason: String,
}

/// Human-in-the-loop (or scripted) decision source. The core never interprets
/// UI; it only calls this trait and acts on the returned decision.
#[async_trait]
pub trait PermissionPromptHandler: Send + Sync {
    async fn prompt(&self, request: &PermissionRequest) -> PermissionDecision;
}

/// The result of a gate check, carrying the reason the Agent surfaces to the
/// model on denial.
pub struct PermissionResult {
    pub decision: PermissionDecision,
    pub reason: String,
}

impl PermissionResult {
    pub fn allowed(&self) -> bool {
        self.decision.is_allowed()
    }
}

fn risk_level_for(tool_name: &str) -> RiskLevel {
    const LOW: &[&str] = &[
        "read_file", "glob_file_search", "grep", "search_codebase", "list_dir", "read_lints",
        "todo_write", "ask_question", "web_fetch", "web_search", "switch_mode", "update_memory",
    ];
    const MEDIUM: &[&str] = &["write", "edit_file", "delete_file"];
    if LOW.contains(&tool_name) {
        RiskLevel::Low
    } else if MEDIUM.contains(&tool_name) {
        RiskLevel::Medium
    } else {
        // shell, run_terminal_command, and any unrecognized tool default to
        // the highest tier — safer than silently under-classifying.
        RiskLevel::High
    }
}

/// Extracts the argument the session cache keys on: for shell-like tools the
/// first 8 bytes of SHA-256(command); for file-mutating tools, the full path.
fn salient_arg(tool_name: &str, args: &Value) -> String {
    match tool_name {
        "shell" | "run_terminal_command" => {
            let cmd = args
                .get("shell_command")
                .or_else(|| args.get("command"))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let digest = Sha256::digest(cmd.as_bytes());
            hex::encode(&digest[..8])
        }
        "write" | "edit_file" | "delete_file" => args
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        _ => args.to_string(),
    }
}

/// Default capacity/TTL for the session cache: 1000 entries × 24 h.
const DEFAULT_CAPACITY: usize = 1000;
const DEFAULT_TTL_HOURS: u64 = 24;

pub struct PermissionGate {
    policy: ToolPolicy,
    default_policy: ApprovalPolicy,
    unrestricted: bool,
    session_cache: TtlCache<String, PermissionDecision>,
    /// Per-tool names for which a Medium-risk Ask has already been approved
    /// once in this session; subsequent Medium-risk calls to that tool skip
    /// the prompt.
    medium_auto_approved: Mutex<HashSet<String>>,
    handler: Option<std::sync::Arc<dyn PermissionPromptHandler>>,
}

impl PermissionGate {
    pub fn new(policy: ToolPolicy, config: &PermissionConfig) -> Self {
        let default_policy = match config.default_policy.as_str() {
            "allow" => ApprovalPolicy::Auto,
            "deny" => ApprovalPolicy::Deny,
            _ => ApprovalPolicy::Ask,
        };
        Self {
            policy,
            default_policy,
            unrestricted: config.unrestricted,
            session_cache: TtlCache::new(
                config.session_cache_capacity.max(1),
                Duration::from_secs(config.session_cache_ttl_hours.max(1) * 3600),
            ),
            medium_auto_approved: Mutex::new(HashSet::new()),
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: std::sync::Arc<dyn PermissionPromptHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Defaults for use in tests or when no config is loaded.
    pub fn with_defaults(policy: ToolPolicy) -> Self {
        Self::new(
            policy,
            &PermissionConfig {
                default_policy: "ask".to_string(),
                session_cache_capacity: DEFAULT_CAPACITY,
                session_cache_ttl_hours: DEFAULT_TTL_HOURS,
                unrestricted: false,
            },
        )
    }

    /// `command_text` is the salient text used for glob-pattern policy
    /// matching (the shell command for `shell`, the path for file tools).
    pub async fn check(
        &self,
        tool_name: &str,
        args: &Value,
        command_text: &str,
    ) -> PermissionResult {
        if self.unrestricted {
            return PermissionResult {
                decision: PermissionDecision::Allow,
                reason: "unrestricted mode".to_string(),
            };
        }

        let risk = risk_level_for(tool_name);
        let key = format!("{tool_name}:{}", salient_arg(tool_name, args));

        if let Some(cached) = self.session_cache.get(&key) {
            return PermissionResult {
                decision: cached,
                reason: "session cache hit".to_string(),
            };
        }

        let policy = match self.policy.decide(command_text) {
            // ToolPolicy only distinguishes Auto/Ask/Deny via glob patterns;
            // fall back to the tool's/global default when no pattern matched.
            ApprovalPolicy::Ask if !self.policy.has_match(command_text) => self.default_policy,
            other => other,
        };

        match policy {
            ApprovalPolicy::Auto => PermissionResult {
                decision: PermissionDecision::Allow,
                reason: "allowed by configuration".to_string(),
            },
            ApprovalPolicy::Deny => PermissionResult {
                decision: PermissionDecision::Deny,
                reason: "not permitted by configuration".to_string(),
            },
            ApprovalPolicy::Ask => {
                if risk == RiskLevel::Medium
                    && self
                        .medium_auto_approved
                        .lock()
                        .unwrap()
                        .contains(tool_name)
                {
                    return PermissionResult {
                        decision: PermissionDecision::Allow,
                        reason: "previously approved this session".to_string(),
                    };
                }

                let handler = match &self.handler {
                    Some(h) => h,
                    // Absent a prompt handler the gate defaults to Allow
                    // rather than hanging forever waiting on a human who
                    // isn't attached (unattended sub-agents). Flagged as a
                    // possibly-unsafe fallback, not a considered default.
                    None => {
                        return PermissionResult {
                            decision: PermissionDecision::Allow,
                            reason: "no prompt handler registered".to_string(),
                        }
                    }
                };

                let request = PermissionRequest {
                    tool_name: tool_name.to_string(),
                    args: args.clone(),
                    risk_level: risk,
                    reason: format!("{tool_name}: {command_text}"),
                };
                let decision = handler.prompt(&request).await;

                match decision {
                    PermissionDecision::AllowSession | PermissionDecision::DenySession => {
                        self.session_cache.set(key, decision);
                    }
                    _ => {}
                }
                if decision.is_allowed() && risk == RiskLevel::Medium {
                    self.medium_auto_approved
                        .lock()
                        .unwrap()
                        .insert(tool_name.to_string());
                }

                let reason = if decision.is_allowed() {
                    "approved by user".to_string()
                } else {
                    "denied by user".to_string()
                };
                PermissionResult { decision, reason }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sven_config::ToolsConfig;

    struct AlwaysAllow;
    #[async_trait]
    impl PermissionPromptHandler for AlwaysAllow {
        async fn prompt(&self, _req: &PermissionRequest) -> PermissionDecision {
            PermissionDecision::AllowSession
        }
    }

    struct AlwaysDeny;
    #[async_trait]
    impl PermissionPromptHandler for AlwaysDeny {
        async fn prompt(&self, _req: &PermissionRequest) -> PermissionDecision {
            PermissionDecision::Deny
        }
    }

    fn gate_with_handler(
        handler: std::sync::Arc<dyn PermissionPromptHandler>,
    ) -> PermissionGate {
        let policy = ToolPolicy::from_config(&ToolsConfig::default());
        PermissionGate::with_defaults(policy).with_handler(handler)
    }

    #[tokio::test]
    async fn risk_classification_low_medium_high() {
        assert_eq!(risk_level_for("read_file"), RiskLevel::Low);
        assert_eq!(risk_level_for("write"), RiskLevel::Medium);
        assert_eq!(risk_level_for("shell"), RiskLevel::High);
    }

    #[tokio::test]
    async fn deny_pattern_short_circuits_before_handler() {
        let policy = ToolPolicy::from_config(&ToolsConfig {
            deny_patterns: vec!["rm -rf /*".to_string()],
            ..ToolsConfig::default()
        });
        let gate = PermissionGate::with_defaults(policy).with_handler(std::sync::Arc::new(AlwaysAllow));
        let result = gate
            .check("shell", &serde_json::json!({"shell_command": "rm -rf /*"}), "rm -rf /*")
            .await;
        assert_eq!(result.decision, PermissionDecision::Deny);
    }

    #[tokio::test]
    async fn allow_session_decision_is_cached() {
        let gate = gate_with_handler(std::sync::Arc::new(AlwaysAllow));
        let args = serde_json::json!({"shell_command": "custom-thing"});
        let r1 = gate.check("shell", &args, "custom-thing").await;
        assert_eq!(r1.decision, PermissionDecision::AllowSession);
        let r2 = gate.check("shell", &args, "custom-thing").await;
        assert_eq!(r2.decision, PermissionDecision::AllowSession);
        assert_eq!(r2.reason, "session cache hit");
    }

    #[tokio::test]
    async fn medium_risk_allow_flips_auto_approve_flag() {
        let gate = gate_with_handler(std::sync::Arc::new(AlwaysAllow));
        let a1 = serde_json::json!({"path": "/tmp/a.txt"});
        let a2 = serde_json::json!({"path": "/tmp/b.txt"});
        let _ = gate.check("write", &a1, "/tmp/a.txt").await;
        // Different path -> not a session-cache hit, but the per-tool
        // medium-risk auto-approve flag should short-circuit the handler.
        let r2 = gate.check("write", &a2, "/tmp/b.txt").await;
        assert!(r2.allowed());
        assert_eq!(r2.reason, "previously approved this session");
    }

    #[tokio::test]
    async fn deny_session_decision_is_cached_and_blocks() {
        let gate = gate_with_handler(std::sync::Arc::new(AlwaysDeny));
        let args = serde_json::json!({"shell_command": "curl evil.example"});
        let r1 = gate.check("shell", &args, "curl evil.example").await;
        assert_eq!(r1.decision, PermissionDecision::Deny);
        // AlwaysDeny never returns DenySession in this test double, so the
        // cache should remain empty and the handler is consulted again.
        let r2 = gate.check("shell", &args, "curl evil.example").await;
        assert_eq!(r2.decision, PermissionDecision::Deny);
    }

    #[tokio::test]
    async fn no_handler_defaults_to_allow() {
        let policy = ToolPolicy::from_config(&ToolsConfig::default());
        let gate = PermissionGate::with_defaults(policy);
        let r = gate
            .check("shell", &serde_json::json!({"shell_command": "custom"}), "custom")
            .await;
        assert!(r.allowed());
        assert_eq!(r.reason, "no prompt handler registered");
    }

    #[tokio::test]
    async fn unrestricted_mode_always_allows() {
        let policy = ToolPolicy::from_config(&ToolsConfig::default());
        let gate = PermissionGate::new(
            policy,
            &PermissionConfig {
                unrestricted: true,
                ..PermissionConfig::default()
            },
        )
        .with_handler(std::sync::Arc::new(AlwaysDeny));
        let r = gate
            .check("shell", &serde_json::json!({"shell_command": "rm -rf /*"}), "rm -rf /*")
            .await;
        assert!(r.allowed());
    }

    #[tokio::test]
    async fn default_config_policy_allow_short_circuits_handler() {
        // Default ToolsConfig auto-approves `cat *` and `ls *` patterns.
        let policy = ToolPolicy::from_config(&ToolsConfig::default());
        let gate = PermissionGate::with_defaults(policy).with_handler(std::sync::Arc::new(AlwaysDeny));
        let r = gate
            .check("shell", &serde_json::json!({"shell_command": "cat README.md"}), "cat README.md")
            .await;
        assert_eq!(r.decision, PermissionDecision::Allow);
    }
}
