// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Single entry point for executing a tool call on behalf of an Agent:
//! validate → cache lookup → permission check → pre_tool hook → execute
//! (with timeout) → compact → post_tool/on_error hook → audit append →
//! cache store → UI callbacks.
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::cache::TtlCache;
use crate::permission::PermissionGate;
use crate::registry::ToolRegistry;
use crate::tool::{OutputCategory, ToolCall, ToolOutput};

/// Tools whose results may be cached: they are read-only and their output
/// depends only on workspace state, not on conversation history.
const CACHEABLE_TOOLS: &[&str] = &[
    "read_file",
    "glob_file_search",
    "grep",
    "search_codebase",
    "list_dir",
    "read_lints",
];

/// Tools whose successful execution invalidates any cached entries that
/// reference the same path.
const INVALIDATING_TOOLS: &[&str] = &["write", "edit_file", "delete_file"];

/// Tool results above this size are never cached (matches the 100 KB
/// resource-cap budget for the in-memory tool-result cache).
const MAX_CACHEABLE_BYTES: usize = 100 * 1024;

/// Hard ceiling on the text handed back to the model for a single tool
/// result before context-aware compaction kicks in.
const COMPACT_CHAR_CAP: usize = 20_000;

#[derive(Debug, Clone)]
struct CachedResult {
    content: String,
    is_error: bool,
    stored_at: Instant,
    hit_count: Arc<AtomicU64>,
}

/// Synchronous, failure-aware hook pair invoked around tool execution.
pub trait ToolHooks: Send + Sync {
    /// Return `Err` to veto execution before it starts.
    fn pre_tool(&self, call: &ToolCall) -> Result<(), String> {
        let _ = call;
        Ok(())
    }
    fn post_tool(&self, call: &ToolCall, output: &ToolOutput) {
        let _ = (call, output);
    }
    fn on_error(&self, call: &ToolCall, error: &str) {
        let _ = (call, error);
    }
}

/// UI-facing callbacks. All invoked outside any internal lock.
pub trait ExecutorCallbacks: Send + Sync {
    fn tool_start(&self, call: &ToolCall) {
        let _ = call;
    }
    fn tool_progress(&self, call_id: &str, elapsed: Duration) {
        let _ = (call_id, elapsed);
    }
    fn tool_end(&self, call: &ToolCall, output: &ToolOutput) {
        let _ = (call, output);
    }
}

#[derive(Debug, Serialize)]
struct AuditRecord {
    timestamp: chrono::DateTime<Utc>,
    tool_name: String,
    call_id: String,
    args: Value,
    is_error: bool,
    duration_ms: u128,
}

/// Appends newline-delimited JSON audit records to
/// `<store_dir>/audit/<session>.json`, tracking in-flight writes so shutdown
/// can wait for them to land.
struct AuditLog {
    path: PathBuf,
    lock: AsyncMutex<()>,
    inflight: Arc<AtomicU64>,
}

impl AuditLog {
    fn new(store_dir: &std::path::Path, session_id: &str) -> std::io::Result<Self> {
        let audit_dir = store_dir.join("audit");
        std::fs::create_dir_all(&audit_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&audit_dir, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self {
            path: audit_dir.join(format!("{session_id}.json")),
            lock: AsyncMutex::new(()),
            inflight: Arc::new(AtomicU64::new(0)),
        })
    }

    fn append_async(&self, record: AuditRecord) -> tokio::task::JoinHandle<()> {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        let path = self.path.clone();
        let inflight = Arc::clone(&self.inflight);
        tokio::spawn(async move {
            if let Ok(line) = serde_json::to_string(&record) {
                use tokio::io::AsyncWriteExt;
                if let Ok(mut f) = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await
                {
                    let _ = f.write_all(line.as_bytes()).await;
                    let _ = f.write_all(b"\n").await;
                }
            }
            inflight.fetch_sub(1, Ordering::SeqCst);
        })
    }

    /// Wait (with a short poll loop) for all in-flight writes to land.
    async fn drain(&self) {
        let _guard = self.lock.lock().await;
        for _ in 0..100 {
            if self.inflight.load(Ordering::SeqCst) == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Configuration knobs for the executor pipeline.
pub struct ExecutorConfig {
    pub default_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub cache_max_entries: usize,
    pub cache_ttl: Duration,
    /// Sandbox-off AND permission-off: downgrades preflight warnings from
    /// errors to logs.
    pub unrestricted: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            cache_max_entries: 100,
            cache_ttl: Duration::from_secs(5 * 60),
            unrestricted: false,
        }
    }
}

/// Wraps a [`ToolRegistry`] with the full validate/cache/permission/hook/
/// audit pipeline described by the core design.
pub struct Executor {
    registry: Arc<ToolRegistry>,
    gate: Arc<PermissionGate>,
    cache: TtlCache<String, CachedResult>,
    hooks: Option<Arc<dyn ToolHooks>>,
    callbacks: Option<Arc<dyn ExecutorCallbacks>>,
    audit: Option<AuditLog>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(registry: Arc<ToolRegistry>, gate: Arc<PermissionGate>, config: ExecutorConfig) -> Self {
        let cache = TtlCache::new(config.cache_max_entries, config.cache_ttl);
        Self {
            registry,
            gate,
            cache,
            hooks: None,
            callbacks: None,
            audit: None,
            config,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ToolHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_callbacks(mut self, callbacks: Arc<dyn ExecutorCallbacks>) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    pub fn with_audit(mut self, store_dir: &std::path::Path, session_id: &str) -> Self {
        match AuditLog::new(store_dir, session_id) {
            Ok(log) => self.audit = Some(log),
            Err(e) => warn!(error = %e, "failed to initialize audit log, continuing without it"),
        }
        self
    }

    /// Flush any in-flight audit writes. Call at agent/session shutdown.
    pub async fn drain_audit(&self) {
        if let Some(audit) = &self.audit {
            audit.drain().await;
        }
    }

    fn cache_key(tool_name: &str, args: &Value) -> String {
        format!("{tool_name}:{}", normalize_args(args))
    }

    async fn execute_with_timeout(&self, call: &ToolCall, timeout: Duration) -> ToolOutput {
        let heartbeat = self.config.heartbeat_interval;
        let callbacks = self.callbacks.clone();
        let call_id = call.id.clone();
        let started = Instant::now();

        let heartbeat_task = callbacks.clone().map(|cb| {
            let call_id = call_id.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(heartbeat);
                tick.tick().await; // skip the immediate first tick
                loop {
                    tick.tick().await;
                    cb.tool_progress(&call_id, started.elapsed());
                }
            })
        });

        let result = tokio::time::timeout(timeout, self.registry.execute(call)).await;

        if let Some(h) = heartbeat_task {
            h.abort();
        }

        match result {
            Ok(output) => output,
            Err(_) => ToolOutput::err(&call.id, format!("tool '{}' timed out after {:?}", call.name, timeout)),
        }
    }

    /// Run the full pipeline for a single tool call.
    pub async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let started = Instant::now();

        if let Some(cb) = &self.callbacks {
            cb.tool_start(call);
        }

        // 1. Validate: confirm the tool exists and required schema fields
        //    are present. Individual tools still validate their own args.
        let tool = match self.registry.get(&call.name) {
            Some(t) => t,
            None => {
                let out = ToolOutput::err(&call.id, format!("unknown tool: {}", call.name));
                if let Some(cb) = &self.callbacks {
                    cb.tool_end(call, &out);
                }
                return out;
            }
        };
        if let Err(reason) = validate_required_fields(&tool.parameters_schema(), &call.args) {
            if self.config.unrestricted {
                debug!(tool = %call.name, %reason, "validator warning downgraded (unrestricted mode)");
            } else {
                let out = ToolOutput::err(&call.id, reason);
                if let Some(cb) = &self.callbacks {
                    cb.tool_end(call, &out);
                }
                return out;
            }
        }

        // 2. Cache lookup for idempotent tools.
        let cacheable = CACHEABLE_TOOLS.contains(&call.name.as_str());
        let key = Self::cache_key(&call.name, &call.args);
        if cacheable {
            if let Some(hit) = self.cache.get(&key) {
                hit.hit_count.fetch_add(1, Ordering::Relaxed);
                let out = if hit.is_error {
                    ToolOutput::err(&call.id, hit.content.clone())
                } else {
                    ToolOutput::ok(&call.id, hit.content.clone())
                };
                if let Some(cb) = &self.callbacks {
                    cb.tool_end(call, &out);
                }
                return out;
            }
        }

        // 3. Permission check.
        let command_text = command_text_for(&call.name, &call.args);
        let permission = self.gate.check(&call.name, &call.args, &command_text).await;
        if !permission.allowed() {
            let out = ToolOutput::err(&call.id, permission.reason.clone());
            if let Some(hooks) = &self.hooks {
                hooks.on_error(call, &permission.reason);
            }
            if let Some(cb) = &self.callbacks {
                cb.tool_end(call, &out);
            }
            return out;
        }

        // 4. pre_tool hook.
        if let Some(hooks) = &self.hooks {
            if let Err(reason) = hooks.pre_tool(call) {
                let out = ToolOutput::err(&call.id, format!("pre_tool hook rejected call: {reason}"));
                hooks.on_error(call, &reason);
                if let Some(cb) = &self.callbacks {
                    cb.tool_end(call, &out);
                }
                return out;
            }
        }

        // 5. Execute with timeout + heartbeats.
        let mut output = self
            .execute_with_timeout(call, self.config.default_timeout)
            .await;

        // 6. Compact oversized results.
        output.content = compact_output(&output.content, tool.output_category());

        // 7. post_tool / on_error hook.
        if let Some(hooks) = &self.hooks {
            if output.is_error {
                hooks.on_error(call, &output.content);
            } else {
                hooks.post_tool(call, &output);
            }
        }

        // 8. Audit append (async, tracked).
        if let Some(audit) = &self.audit {
            audit.append_async(AuditRecord {
                timestamp: Utc::now(),
                tool_name: call.name.clone(),
                call_id: call.id.clone(),
                args: call.args.clone(),
                is_error: output.is_error,
                duration_ms: started.elapsed().as_millis(),
            });
        }

        // 9. Cache store / invalidate.
        if cacheable && !output.is_error && output.content.len() <= MAX_CACHEABLE_BYTES {
            self.cache.set(
                key,
                CachedResult {
                    content: output.content.clone(),
                    is_error: output.is_error,
                    stored_at: Instant::now(),
                    hit_count: Arc::new(AtomicU64::new(0)),
                },
            );
        }
        if INVALIDATING_TOOLS.contains(&call.name.as_str()) && !output.is_error {
            if let Some(path) = call.args.get("path").and_then(|v| v.as_str()) {
                self.cache.remove(|k, v| k.contains(path) || v.content.contains(path));
            }
        }

        // 10. UI callback.
        if let Some(cb) = &self.callbacks {
            cb.tool_end(call, &output);
        }

        output
    }
}

fn command_text_for(tool_name: &str, args: &Value) -> String {
    match tool_name {
        "shell" | "run_terminal_command" => args
            .get("shell_command")
            .or_else(|| args.get("command"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        _ => args
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or(tool_name)
            .to_string(),
    }
}

/// Canonicalize an args map for cache-key purposes: sorted keys, stringified
/// values — so `{"a":1,"b":2}` and `{"b":2,"a":1}` hash the same.
fn normalize_args(args: &Value) -> String {
    match args.as_object() {
        Some(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            keys.iter()
                .map(|k| format!("{k}={}", map[*k]))
                .collect::<Vec<_>>()
                .join("&")
        }
        None => args.to_string(),
    }
}

fn validate_required_fields(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(required) = schema.get("required").and_then(|v| v.as_array()) else {
        return Ok(());
    };
    for field in required {
        let Some(name) = field.as_str() else { continue };
        if args.get(name).is_none() {
            return Err(format!("missing required parameter '{name}'"));
        }
    }
    Ok(())
}

/// Truncate oversized tool output according to its declared shape. Mirrors
/// `sven_core`'s context compaction strategy but operates at the
/// single-result level before the result ever reaches conversation history.
fn compact_output(content: &str, category: OutputCategory) -> String {
    if content.len() <= COMPACT_CHAR_CAP {
        return content.to_string();
    }
    match category {
        OutputCategory::HeadTail | OutputCategory::FileContent => {
            let half = COMPACT_CHAR_CAP / 2;
            let head = char_boundary_prefix(content, half);
            let tail = char_boundary_suffix(content, half);
            format!(
                "{head}\n...[{} bytes omitted]...\n{tail}",
                content.len() - head.len() - tail.len()
            )
        }
        OutputCategory::MatchList => {
            let head = char_boundary_prefix(content, COMPACT_CHAR_CAP);
            format!("{head}\n...[truncated, showing leading matches only]")
        }
        OutputCategory::Generic => {
            let head = char_boundary_prefix(content, COMPACT_CHAR_CAP);
            format!("{head}\n...[truncated]")
        }
    }
}

/// Largest prefix of `s` no longer than `max_bytes` that ends on a char
/// boundary.
fn char_boundary_prefix(s: &str, max_bytes: usize) -> &str {
    let mut end = max_bytes.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Largest suffix of `s` no longer than `max_bytes` that starts on a char
/// boundary.
fn char_boundary_suffix(s: &str, max_bytes: usize) -> &str {
    let mut start = s.len().saturating_sub(max_bytes);
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;
    use sven_config::{PermissionConfig, ToolsConfig};

    use super::*;
    use crate::permission::{PermissionDecision, PermissionPromptHandler, PermissionRequest};
    use crate::policy::ToolPolicy;
    use crate::tool::Tool;

    struct CountingTool {
        name: &'static str,
        calls: Arc<AtomicU64>,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "counts invocations"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {"path": {"type": "string"}}, "required": ["path"]})
        }
        fn default_policy(&self) -> crate::policy::ApprovalPolicy {
            crate::policy::ApprovalPolicy::Auto
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ToolOutput::ok(&call.id, "result")
        }
    }

    struct AlwaysAllow;
    #[async_trait]
    impl PermissionPromptHandler for AlwaysAllow {
        async fn prompt(&self, _req: &PermissionRequest) -> PermissionDecision {
            PermissionDecision::Allow
        }
    }

    fn executor_with(tool_name: &'static str, calls: Arc<AtomicU64>) -> Executor {
        let mut registry = ToolRegistry::new();
        registry.register(CountingTool { name: tool_name, calls });
        let policy = ToolPolicy::from_config(&ToolsConfig::default());
        let gate = Arc::new(PermissionGate::new(policy, &PermissionConfig::default()).with_handler(Arc::new(AlwaysAllow)));
        Executor::new(Arc::new(registry), gate, ExecutorConfig::default())
    }

    #[tokio::test]
    async fn unknown_tool_is_error() {
        let calls = Arc::new(AtomicU64::new(0));
        let exec = executor_with("read_file", calls);
        let out = exec
            .execute(&ToolCall { id: "1".into(), name: "missing".into(), args: json!({}) })
            .await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn missing_required_field_is_validation_error() {
        let calls = Arc::new(AtomicU64::new(0));
        let exec = executor_with("read_file", calls.clone());
        let out = exec
            .execute(&ToolCall { id: "1".into(), name: "read_file".into(), args: json!({}) })
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("missing required parameter"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cacheable_tool_hits_cache_on_second_call() {
        let calls = Arc::new(AtomicU64::new(0));
        let exec = executor_with("read_file", calls.clone());
        let call = ToolCall { id: "1".into(), name: "read_file".into(), args: json!({"path": "/a"}) };
        let _ = exec.execute(&call).await;
        let _ = exec.execute(&call).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1, "second call should be served from cache");
    }

    #[tokio::test]
    async fn write_invalidates_cached_entries_for_path() {
        let calls = Arc::new(AtomicU64::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(CountingTool { name: "read_file", calls: calls.clone() });
        registry.register(CountingTool { name: "write", calls: calls.clone() });
        let policy = ToolPolicy::from_config(&ToolsConfig::default());
        let gate = Arc::new(PermissionGate::new(policy, &PermissionConfig::default()).with_handler(Arc::new(AlwaysAllow)));
        let exec = Executor::new(Arc::new(registry), gate, ExecutorConfig::default());

        let read_call = ToolCall { id: "1".into(), name: "read_file".into(), args: json!({"path": "/a"}) };
        let write_call = ToolCall { id: "2".into(), name: "write".into(), args: json!({"path": "/a"}) };

        let _ = exec.execute(&read_call).await;
        let _ = exec.execute(&write_call).await;
        let _ = exec.execute(&read_call).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3, "cache entry for /a should have been invalidated by write");
    }

    #[tokio::test]
    async fn permission_denied_never_executes_tool() {
        struct AlwaysDeny;
        #[async_trait]
        impl PermissionPromptHandler for AlwaysDeny {
            async fn prompt(&self, _req: &PermissionRequest) -> PermissionDecision {
                PermissionDecision::Deny
            }
        }
        let calls = Arc::new(AtomicU64::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(CountingTool { name: "shell", calls: calls.clone() });
        let policy = ToolPolicy::from_config(&ToolsConfig {
            deny_patterns: vec!["*".to_string()],
            ..ToolsConfig::default()
        });
        let gate = Arc::new(PermissionGate::new(policy, &PermissionConfig::default()).with_handler(Arc::new(AlwaysDeny)));
        let exec = Executor::new(Arc::new(registry), gate, ExecutorConfig::default());
        let call = ToolCall { id: "1".into(), name: "shell".into(), args: json!({"path": "whatever"}) };
        let out = exec.execute(&call).await;
        assert!(out.is_error);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn normalize_args_is_order_independent() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(normalize_args(&a), normalize_args(&b));
    }

    #[test]
    fn compact_output_passthrough_when_small() {
        assert_eq!(compact_output("short", OutputCategory::Generic), "short");
    }

    #[test]
    fn compact_output_truncates_generic_large_text() {
        let big = "x".repeat(COMPACT_CHAR_CAP + 5000);
        let out = compact_output(&big, OutputCategory::Generic);
        assert!(out.len() < big.len());
        assert!(out.contains("truncated"));
    }

    #[test]
    fn compact_output_head_tail_preserves_both_ends() {
        let mut s = String::from("HEAD-MARK\n");
        s.push_str(&"filler\n".repeat(10_000));
        s.push_str("TAIL-MARK");
        let out = compact_output(&s, OutputCategory::HeadTail);
        assert!(out.contains("HEAD-MARK"));
        assert!(out.contains("TAIL-MARK"));
        assert!(out.contains("omitted"));
    }
}
