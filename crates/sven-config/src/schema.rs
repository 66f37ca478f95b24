// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub tui: TuiConfig,
    /// Multi-agent runner / coordinator / messenger sizing
    #[serde(default)]
    pub team: TeamConfig,
    /// Named provider configurations.
    ///
    /// Define custom endpoints, local models, or additional accounts here and
    /// reference them by name with `--model <key>` or `--model <key>/<model>`.
    ///
    /// ```yaml
    /// providers:
    ///   my_ollama:
    ///     provider: openai        # uses the OpenAI-compatible wire format
    ///     base_url: http://localhost:11434/v1
    ///     name: llama3.2          # default model for this provider
    ///   work_anthropic:
    ///     provider: anthropic
    ///     api_key_env: WORK_ANTHROPIC_KEY
    ///     name: claude-opus-4-5
    /// ```
    #[serde(default)]
    pub providers: std::collections::HashMap<String, ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier.  Run `sven list-providers` for the full list.
    /// Common values: "openai" | "anthropic" | "google" | "azure" | "aws" |
    /// "groq" | "openrouter" | "ollama" | "mistral" | "deepseek" | "mock"
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override.  Useful for local proxies, LiteLLM, or Cloudflare.
    /// For most hosted providers the correct default is auto-selected.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,

    // ── Azure OpenAI ─────────────────────────────────────────────────────────
    /// Azure resource name (the subdomain of `.openai.azure.com`).
    /// Required when provider = "azure" and base_url is not set.
    pub azure_resource: Option<String>,
    /// Azure deployment name.  Defaults to `model.name` when not set.
    pub azure_deployment: Option<String>,
    /// Azure REST API version string, e.g. `"2024-02-01"`.
    pub azure_api_version: Option<String>,

    // ── AWS Bedrock ───────────────────────────────────────────────────────────
    /// AWS region override (also honoured via AWS_DEFAULT_REGION env var).
    pub aws_region: Option<String>,

    // ── Prompt caching ────────────────────────────────────────────────────────
    /// Attach an explicit cache-control marker to the system message.
    ///
    /// **Anthropic**: adds `"cache_control": {"type": "ephemeral"}` to the
    /// system block, which tells the API to cache the prefix up to and
    /// including that block.  Anthropic charges a one-time write fee and
    /// subsequent calls save ~90% on cached input tokens.
    ///
    /// **Other providers**: OpenAI and Google cache automatically; this flag
    /// has no effect for those providers.
    #[serde(default = "default_true")]
    pub cache_system_prompt: bool,

    /// Use the extended (1-hour) cache TTL instead of the default 5-minute
    /// window.  Applies to the system prompt (when `cache_system_prompt = true`)
    /// and to tool definitions (when `cache_tools = true`).  Only meaningful
    /// for the Anthropic provider.  Sends the
    /// `anthropic-beta: extended-cache-ttl-2025-04-11` header automatically.
    ///
    /// Conversation caching (`cache_conversation`) always uses the 5-minute
    /// TTL regardless of this setting, because conversation turns are
    /// typically frequent enough to keep the cache refreshed within 5 minutes.
    #[serde(default)]
    pub extended_cache_time: bool,

    /// Cache tool definitions using Anthropic prompt caching.
    ///
    /// Tool definitions are stable across requests within a session, making
    /// them ideal for caching.  The last tool in the list receives a
    /// `cache_control` marker so Anthropic caches all tool definitions as a
    /// prefix.  Uses the same TTL as `extended_cache_time` controls (1-hour
    /// when true, 5-minute otherwise).
    ///
    /// With many tools (each ~200-500 tokens), this can save thousands of
    /// tokens per request.
    #[serde(default = "default_true")]
    pub cache_tools: bool,

    /// Enable automatic conversation caching (Anthropic only).
    ///
    /// Adds a top-level `cache_control` marker that instructs Anthropic to
    /// automatically cache conversation history up to the last message.
    /// Subsequent turns read prior context from cache at 10% of the base
    /// token cost, dramatically reducing cost for multi-turn agent sessions.
    ///
    /// The cache breakpoint automatically advances with each new turn so no
    /// manual management is needed.
    #[serde(default = "default_true")]
    pub cache_conversation: bool,

    /// Cache image content blocks in conversation history (Anthropic only).
    ///
    /// Images are token-expensive: even a modest screenshot costs hundreds of
    /// input tokens every turn it remains in context.  Marking the oldest image
    /// blocks with `cache_control` preserves them across turns, saving ~90% on
    /// those tokens for the rest of the session.
    ///
    /// Uses the same TTL tier as `extended_cache_time` controls.  The number
    /// of cached images is bounded by the remaining Anthropic breakpoint budget
    /// (maximum 4 breakpoints total across system, tools, conversation, and
    /// images/tool-results).
    #[serde(default = "default_true")]
    pub cache_images: bool,

    /// Cache large tool results in conversation history (Anthropic only).
    ///
    /// When an agent reads files, runs commands, or fetches documents, those
    /// tool results can consume thousands of tokens on every subsequent turn.
    /// Marking them with `cache_control` once saves ~90% on those tokens for
    /// all following turns.
    ///
    /// A result is eligible when its serialised content exceeds 4 096
    /// characters (~1 024 tokens, the Anthropic minimum cacheable length for
    /// Sonnet-class models).  The oldest eligible results are cached first;
    /// the count is bounded by the remaining breakpoint budget.
    ///
    /// Uses the same TTL tier as `extended_cache_time` controls.
    #[serde(default = "default_true")]
    pub cache_tool_results: bool,

    // ── Provider-specific extras ──────────────────────────────────────────────
    /// Free-form provider-specific options forwarded as-is to the driver.
    /// Useful for headers or parameters not covered by the standard fields.
    #[serde(default)]
    pub driver_options: serde_json::Value,

    // ── Mock provider ─────────────────────────────────────────────────────────
    /// Path to YAML mock-responses file (used when provider = "mock").
    /// Can also be set via the SVEN_MOCK_RESPONSES environment variable.
    pub mock_responses_file: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            name: "gpt-4o".into(),
            // api_key_env is intentionally None here.  resolve_api_key() falls
            // through to the driver registry, which already knows the canonical
            // env-var name for each provider (OPENAI_API_KEY, ANTHROPIC_API_KEY,
            // etc.).  Hard-coding it here would shadow the registry lookup and
            // cause the wrong key to be sent whenever the provider is overridden
            // at the step level (e.g. <!-- sven: provider=anthropic -->).
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
            azure_resource: None,
            azure_deployment: None,
            azure_api_version: None,
            aws_region: None,
            // Comprehensive caching is on by default for every provider that
            // supports it (currently Anthropic).  The flags are no-ops for
            // providers such as OpenAI that cache automatically.  Only the
            // extended (1-hour) TTL remains opt-in because it carries a 2×
            // write cost that is only worthwhile when turns are >5 min apart.
            cache_system_prompt: true,
            extended_cache_time: false,
            cache_tools: true,
            cache_conversation: true,
            cache_images: true,
            cache_tool_results: true,
            driver_options: serde_json::Value::Null,
            mock_responses_file: None,
        }
    }
}

fn default_agent_mode() -> AgentMode {
    AgentMode::Agent
}
fn default_max_tool_rounds() -> u32 {
    200
}
fn default_compaction_threshold() -> f32 {
    0.85
}

/// Strategy used when compacting the session context.
///
/// `Structured` (default) instructs the model to produce a typed Markdown
/// checkpoint with fixed sections (Active Task, Key Decisions, Files &
/// Artifacts, Constraints, Pending Items, Session Narrative).  This produces
/// checkpoints that are easier for the model to navigate on future turns.
///
/// `Narrative` uses the original free-form summarisation prompt and is
/// available for backward-compatibility or when a simpler output is preferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompactionStrategy {
    #[default]
    Structured,
    Narrative,
}

impl std::fmt::Display for CompactionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactionStrategy::Structured => write!(f, "structured"),
            CompactionStrategy::Narrative => write!(f, "narrative"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Default mode when none is specified on the CLI
    #[serde(default = "default_agent_mode")]
    pub default_mode: AgentMode,
    /// Maximum number of autonomous tool-call rounds before stopping
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Token fraction at which proactive compaction triggers (0.0–1.0).
    /// The budget gate compares effective tokens (calibrated estimate + schema
    /// overhead) against the model's usable input budget, which is
    /// context_window minus max_output_tokens.
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: f32,
    /// Number of recent non-system messages preserved verbatim during
    /// compaction.  The oldest messages beyond this tail are summarised by
    /// the LLM.  Higher values retain more recent context but reduce the
    /// compression benefit.
    ///
    /// A value of 6 corresponds to roughly 3 back-and-forth turns
    /// (user + assistant per turn, tool results excluded from the count).
    /// Set to 0 to summarise the full history (original behaviour).
    #[serde(default = "default_compaction_keep_recent")]
    pub compaction_keep_recent: usize,
    /// Compaction checkpoint format.
    ///
    /// `structured` (default): produces a typed Markdown checkpoint with
    /// fixed sections preserving tasks, decisions, files, and constraints.
    /// `narrative`: uses the original free-form summarisation prompt.
    #[serde(default)]
    pub compaction_strategy: CompactionStrategy,
    /// Maximum tokens allowed for a single tool result before it is
    /// deterministically truncated before entering the session.
    ///
    /// Truncation is content-aware: shell output keeps head+tail lines, grep
    /// keeps leading matches, read_file keeps head+tail lines.  A value of
    /// 0 disables per-result truncation entirely.
    #[serde(default = "default_tool_result_token_cap")]
    pub tool_result_token_cap: usize,
    /// Fraction of the context window reserved for tool schemas, the dynamic
    /// context block (git/CI info), and measurement error in the token
    /// approximation.  Reduces the effective compaction trigger threshold.
    ///
    /// Example: threshold=0.85, reserve=0.10 → compaction fires when
    /// calibrated session tokens reach 75% of the input budget.
    #[serde(default = "default_compaction_overhead_reserve")]
    pub compaction_overhead_reserve: f32,
    /// System prompt override; leave None to use the built-in prompt
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Per-step wall-clock timeout in seconds (0 = no limit).
    /// Can be set in config, overridden by frontmatter or CLI flag.
    #[serde(default)]
    pub max_step_timeout_secs: u64,

    /// Total run wall-clock timeout in seconds (0 = no limit).
    #[serde(default)]
    pub max_run_timeout_secs: u64,
}

fn default_compaction_keep_recent() -> usize {
    6
}
fn default_tool_result_token_cap() -> usize {
    4000
}
fn default_compaction_overhead_reserve() -> f32 {
    0.10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_mode: AgentMode::Agent,
            max_tool_rounds: 200,
            compaction_threshold: 0.85,
            compaction_keep_recent: default_compaction_keep_recent(),
            compaction_strategy: CompactionStrategy::Structured,
            tool_result_token_cap: default_tool_result_token_cap(),
            compaction_overhead_reserve: default_compaction_overhead_reserve(),
            system_prompt: None,
            max_step_timeout_secs: 0,
            max_run_timeout_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// Pure research – read-only tools, no writes
    Research,
    /// Generate a structured plan, no code changes
    Plan,
    /// Full agent with read/write tools
    Agent,
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentMode::Research => write!(f, "research"),
            AgentMode::Plan => write!(f, "plan"),
            AgentMode::Agent => write!(f, "agent"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Automatically approve shell commands matching these glob patterns
    pub auto_approve_patterns: Vec<String>,
    /// Block shell commands matching these glob patterns
    pub deny_patterns: Vec<String>,
    /// Timeout in seconds for a single tool call
    pub timeout_secs: u64,
    /// Use Docker sandbox for shell execution
    pub use_docker: bool,
    /// Docker image to use when use_docker is true
    pub docker_image: Option<String>,
    /// Web fetch and search configuration
    #[serde(default)]
    pub web: WebConfig,
    /// Persistent memory configuration
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Linter configuration
    #[serde(default)]
    pub lints: LintsConfig,
    /// Permission gate configuration (risk policy + session cache)
    #[serde(default)]
    pub permissions: PermissionConfig,
    /// Undo/redo history sizing
    #[serde(default)]
    pub undo: UndoConfig,
    /// Tool-result cache sizing
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            auto_approve_patterns: vec![
                "cat *".into(),
                "ls *".into(),
                "find *".into(),
                "rg *".into(),
                "grep *".into(),
            ],
            deny_patterns: vec!["rm -rf /*".into(), "dd if=*".into()],
            timeout_secs: 30,
            use_docker: false,
            docker_image: None,
            web: WebConfig::default(),
            memory: MemoryConfig::default(),
            lints: LintsConfig::default(),
            permissions: PermissionConfig::default(),
            undo: UndoConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

/// Per-tool approval policy plus the session-cache sizing used by the
/// permission gate (`sven_tools::permission::PermissionGate`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionConfig {
    /// Policy applied to tools with no matching pattern: "allow" | "ask" | "deny".
    #[serde(default = "PermissionConfig::default_default_policy")]
    pub default_policy: String,
    /// Capacity of the session allow/deny cache.
    #[serde(default = "PermissionConfig::default_session_cache_capacity")]
    pub session_cache_capacity: usize,
    /// TTL (hours) for session cache entries.
    #[serde(default = "PermissionConfig::default_session_cache_ttl_hours")]
    pub session_cache_ttl_hours: u64,
    /// Unrestricted mode: sandbox AND permission gate both disabled.
    /// Downgrades preflight validator warnings from errors to logs.
    #[serde(default)]
    pub unrestricted: bool,
}

impl PermissionConfig {
    fn default_default_policy() -> String {
        "ask".into()
    }
    fn default_session_cache_capacity() -> usize {
        1000
    }
    fn default_session_cache_ttl_hours() -> u64 {
        24
    }
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            default_policy: Self::default_default_policy(),
            session_cache_capacity: Self::default_session_cache_capacity(),
            session_cache_ttl_hours: Self::default_session_cache_ttl_hours(),
            unrestricted: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndoConfig {
    /// Maximum number of file changes retained in the undo stack.
    #[serde(default = "UndoConfig::default_max_history")]
    pub max_history: usize,
    /// Maximum number of changes retained in the redo stack.
    #[serde(default = "UndoConfig::default_max_redo")]
    pub max_redo: usize,
}

impl UndoConfig {
    fn default_max_history() -> usize {
        100
    }
    fn default_max_redo() -> usize {
        50
    }
}

impl Default for UndoConfig {
    fn default() -> Self {
        Self {
            max_history: Self::default_max_history(),
            max_redo: Self::default_max_redo(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached tool results.
    #[serde(default = "CacheConfig::default_max_entries")]
    pub max_entries: usize,
    /// TTL in seconds for a cached tool result.
    #[serde(default = "CacheConfig::default_ttl_secs")]
    pub ttl_secs: u64,
    /// Results larger than this (bytes) are never cached.
    #[serde(default = "CacheConfig::default_max_entry_bytes")]
    pub max_entry_bytes: usize,
}

impl CacheConfig {
    fn default_max_entries() -> usize {
        100
    }
    fn default_ttl_secs() -> u64 {
        300
    }
    fn default_max_entry_bytes() -> usize {
        100 * 1024
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: Self::default_max_entries(),
            ttl_secs: Self::default_ttl_secs(),
            max_entry_bytes: Self::default_max_entry_bytes(),
        }
    }
}

/// Sizing and timeouts for the multi-agent runner (`sven-team::Runner`),
/// coordinator (`sven-team::Coordinator`), and messenger
/// (`sven-team::Messenger`). Mirrors spec §5's resource caps and §5's
/// per-operation timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamConfig {
    /// Maximum number of concurrently-dispatched coordinator tasks.
    #[serde(default = "TeamConfig::default_max_parallel")]
    pub max_parallel: usize,
    /// Refuse a `delegate` message once the carried delegation depth would
    /// exceed this value.
    #[serde(default = "TeamConfig::default_max_delegation_depth")]
    pub max_delegation_depth: u32,
    /// Soft cap on retained completed agents before `Runner::cleanup` trims
    /// the oldest completed half.
    #[serde(default = "TeamConfig::default_max_retained_agents")]
    pub max_retained_agents: usize,
    /// Soft cap on retained `AgentResult`s.
    #[serde(default = "TeamConfig::default_max_retained_results")]
    pub max_retained_results: usize,
    /// `help_request` handler timeout, in seconds.
    #[serde(default = "TeamConfig::default_help_request_timeout_secs")]
    pub help_request_timeout_secs: u64,
    /// `delegate` handler timeout, in seconds.
    #[serde(default = "TeamConfig::default_delegate_timeout_secs")]
    pub delegate_timeout_secs: u64,
    /// `Messenger::receive_response` overall timeout, in seconds.
    #[serde(default = "TeamConfig::default_messenger_response_timeout_secs")]
    pub messenger_response_timeout_secs: u64,
    /// Default overall timeout for `Runner::wait`, in seconds.
    #[serde(default = "TeamConfig::default_runner_wait_timeout_secs")]
    pub runner_wait_timeout_secs: u64,
    /// Interval between progress ticks emitted by an async-spawned agent, in
    /// seconds.
    #[serde(default = "TeamConfig::default_progress_tick_secs")]
    pub progress_tick_secs: u64,
    /// Directory holding one JSON file per persisted agent id (default:
    /// `~/.config/sven/team/agents/`).
    pub agent_store_dir: Option<String>,
}

impl TeamConfig {
    fn default_max_parallel() -> usize {
        4
    }
    fn default_max_delegation_depth() -> u32 {
        3
    }
    fn default_max_retained_agents() -> usize {
        50
    }
    fn default_max_retained_results() -> usize {
        100
    }
    fn default_help_request_timeout_secs() -> u64 {
        3 * 60
    }
    fn default_delegate_timeout_secs() -> u64 {
        5 * 60
    }
    fn default_messenger_response_timeout_secs() -> u64 {
        5 * 60
    }
    fn default_runner_wait_timeout_secs() -> u64 {
        10 * 60
    }
    fn default_progress_tick_secs() -> u64 {
        2
    }
}

impl Default for TeamConfig {
    fn default() -> Self {
        Self {
            max_parallel: Self::default_max_parallel(),
            max_delegation_depth: Self::default_max_delegation_depth(),
            max_retained_agents: Self::default_max_retained_agents(),
            max_retained_results: Self::default_max_retained_results(),
            help_request_timeout_secs: Self::default_help_request_timeout_secs(),
            delegate_timeout_secs: Self::default_delegate_timeout_secs(),
            messenger_response_timeout_secs: Self::default_messenger_response_timeout_secs(),
            runner_wait_timeout_secs: Self::default_runner_wait_timeout_secs(),
            progress_tick_secs: Self::default_progress_tick_secs(),
            agent_store_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebSearchConfig {
    /// Brave Search API key (also checked via BRAVE_API_KEY env var)
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Search backend configuration
    #[serde(default)]
    pub search: WebSearchConfig,
    /// Default maximum characters for web_fetch (default 50000)
    pub fetch_max_chars: usize,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            search: WebSearchConfig::default(),
            fetch_max_chars: 50_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Path to the memory store directory (default: ~/.config/sven/memory/).
    /// Global entries live in `global.json`; project entries are keyed by
    /// `sha256(project_path)[:8].json`.
    pub memory_dir: Option<String>,
    /// Path to the error-pattern store JSON file (default: ~/.config/sven/errors.json).
    pub error_store_file: Option<String>,
    /// Maximum number of memory entries retained (oldest pruned first).
    #[serde(default = "MemoryConfig::default_max_entries")]
    pub max_entries: usize,
    /// Debounce window (ms) collapsing bursts of writes into one flush.
    #[serde(default = "MemoryConfig::default_debounce_ms")]
    pub debounce_ms: u64,
    /// Error entries older than this (days) with success_rate < 0.3 are pruned.
    #[serde(default = "MemoryConfig::default_error_max_age_days")]
    pub error_max_age_days: i64,
}

impl MemoryConfig {
    fn default_max_entries() -> usize {
        2000
    }
    fn default_debounce_ms() -> u64 {
        2000
    }
    fn default_error_max_age_days() -> i64 {
        90
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            memory_dir: None,
            error_store_file: None,
            max_entries: Self::default_max_entries(),
            debounce_ms: Self::default_debounce_ms(),
            error_max_age_days: Self::default_error_max_age_days(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LintsConfig {
    /// Override the lint command for Rust projects
    pub rust_command: Option<String>,
    /// Override the lint command for TypeScript/JS projects
    pub typescript_command: Option<String>,
    /// Override the lint command for Python projects
    pub python_command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuiConfig {
    /// Colour theme: "dark" | "light" | "solarized"
    pub theme: String,
    /// Show line numbers in code blocks
    pub code_line_numbers: bool,
    /// Width used for markdown wrapping (0 = auto)
    pub wrap_width: u16,
    /// Use plain ASCII borders/indicators instead of Unicode box-drawing and
    /// Braille characters.  Enable this when the terminal font lacks wide
    /// Unicode support (the font renders replacement glyphs / "gibberish").
    /// Can also be forced with the SVEN_ASCII_BORDERS=1 environment variable.
    #[serde(default)]
    pub ascii_borders: bool,
}

impl Default for TuiConfig {
    fn default() -> Self {
        Self {
            theme: "dark".into(),
            code_line_numbers: false,
            wrap_width: 0,
            ascii_borders: false,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
