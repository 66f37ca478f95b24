// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Agent runner (C9): owns the spawn/wait/cancel/resume lifecycle for
//! sub-agents. Builds one [`sven_core::Agent`] per spawn, each with a tool
//! registry scoped to its [`AgentType`], and retains a soft-capped history of
//! finished [`AgentResult`]s.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use sven_config::{AgentMode, Config};
use sven_core::{Agent, AgentEvent, AgentRuntimeContext};
use sven_tools::{
    events::{TodoItem, ToolEvent},
    AskQuestionTool, DeleteFileTool, EditFileTool, GlobFileSearchTool, GrepTool, ListDirTool,
    ReadFileTool, ReadLintsTool, RunTerminalCommandTool, SearchCodebaseTool, SwitchModeTool,
    TodoWriteTool, ToolRegistry, UpdateMemoryTool, WebFetchTool, WebSearchTool, WriteTool,
};

use crate::messenger::Messenger;
use crate::tools::{DelegateTool, HelpRequestTool};
use crate::types::{AgentResult, AgentStatus, AgentType};

/// Narrow capability [`crate::messenger::Messenger`] depends on, so it never
/// needs a back-reference to `Runner` itself. `delegation_depth` is the
/// depth the *new* agent starts at (0 for a fresh top-level spawn, or
/// `message.data["delegation_depth"] + 1` for a chained delegation) — the
/// only place delegation depth is tracked is here and in
/// `messenger::handle_message`, never a standalone counter on `Runner`.
#[async_trait]
pub trait AgentSpawner: Send + Sync {
    async fn spawn_and_run(
        &self,
        agent_type: AgentType,
        prompt: String,
        delegation_depth: u32,
    ) -> anyhow::Result<AgentResult>;
}

/// Lifecycle notifications for agents a [`Runner`] spawns. All methods are
/// no-ops by default, mirroring `sven_tools::executor::ExecutorCallbacks` and
/// `crate::coordinator::UIBroadcaster` — a caller only overrides what it
/// needs. `on_sub_agent_activity`/`on_input` are extension points for a UI
/// that wants finer-grained delegation/question surfacing than the plain
/// `AgentResult` gives; the CLI in `src/main.rs` doesn't currently need them.
pub trait RunnerCallbacks: Send + Sync {
    fn on_start(&self, agent_id: &str, agent_type: &AgentType) {
        let _ = (agent_id, agent_type);
    }
    fn on_complete(&self, result: &AgentResult) {
        let _ = result;
    }
    fn on_progress(&self, agent_id: &str, step: u32, total_steps: u32, description: &str) {
        let _ = (agent_id, step, total_steps, description);
    }
    fn on_scratchpad(&self, agent_id: &str, content: &str) {
        let _ = (agent_id, content);
    }
    fn on_sub_agent_activity(&self, agent_id: &str, agent_type: &AgentType, finished: bool) {
        let _ = (agent_id, agent_type, finished);
    }
    fn on_input(&self, agent_id: &str, prompt: &str) {
        let _ = (agent_id, prompt);
    }
}


#[derive(thiserror::Error, Debug)]
pub enum RunnerError {
    #[error("no such agent: {0}")]
    NotFound(String),
    #[error("wait on agent {0} timed out after {1:?}")]
    WaitTimeout(String, Duration),
    #[error("refusing to spawn: agent type {0:?} is never a delegation target")]
    NotSpawnable(AgentType),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

struct RunningAgent {
    agent_type: AgentType,
    started: Instant,
    handle: tokio::task::JoinHandle<AgentResult>,
    /// Send `()` (or drop) to request cancellation.
    cancel_tx: Option<oneshot::Sender<()>>,
}

/// Owns every in-flight and recently-finished sub-agent spawned during this
/// process's lifetime. Cheap to clone — internals are `Arc`-shared.
#[derive(Clone)]
pub struct Runner {
    model: Arc<dyn sven_model::ModelProvider>,
    config: Arc<Config>,
    max_retained_agents: usize,
    max_retained_results: usize,
    default_wait_timeout: Duration,
    running: Arc<Mutex<HashMap<String, RunningAgent>>>,
    results: Arc<Mutex<HashMap<String, AgentResult>>>,
    max_delegation_depth: u32,
    /// Inter-agent messenger every spawned agent's `delegate`/`help_request`
    /// tools share. Built from a self-referencing [`AgentSpawner`] — see
    /// [`Runner::new`] — so the cell (not the `Runner` clone captured inside
    /// it) is the thing every clone of this `Runner` actually shares; without
    /// it, a clone taken before the cell is filled would keep pointing at a
    /// dead placeholder forever.
    messenger: Arc<std::sync::OnceLock<Arc<Messenger>>>,
    /// How often a `SpawnAsync`-style caller's progress ticker polls the
    /// running agent's scratchpad/progress state.
    progress_tick: Duration,
    /// Lifecycle hooks fired around every spawn this runner performs. `None`
    /// (the default) means no caller is listening.
    callbacks: Option<Arc<dyn RunnerCallbacks>>,
    /// Human-in-the-loop prompt handler for the permission gate. `None` for
    /// unattended sub-agents (the common case); a top-level CLI session
    /// sets this once via [`Runner::with_permission_handler`] so `Ask`
    /// policy tools actually prompt instead of silently falling back to
    /// Allow.
    permission_handler: Option<Arc<dyn sven_tools::permission::PermissionPromptHandler>>,
    /// Durable per-agent-id snapshot store. When set, every
    /// `run_to_completion*` call persists the finished agent's history so a
    /// later [`Runner::resume`] can restore it.
    state_store: Option<Arc<crate::persistence::AgentStateStore>>,
    /// One linear undo/redo stack shared by every write/edit/delete tool
    /// across every agent this runner spawns — a file touched by one
    /// sub-agent can be undone from any other.
    undo_manager: Arc<sven_tools::UndoManager>,
    /// Rendered memory/error-store digest injected into every agent this
    /// runner builds, ahead of the system prompt.
    memory_note: Option<String>,
    /// Learned-facts store. When set, every completed run adds a
    /// project-scoped breadcrumb a later session's `build_memory_note`-style
    /// digest can retrieve.
    memory_store: Option<Arc<sven_memory::MemoryStore>>,
    /// Error-pattern → solution store. When set, a completed run updates the
    /// success rate of whatever known fix it was seeded with (see
    /// [`Runner::with_known_fix`]).
    error_store: Option<Arc<sven_memory::ErrorStore>>,
    /// Id of the [`sven_memory::ErrorStore`] entry whose solution this
    /// session's prompt was seeded with, if any — set once per `Runner` by
    /// the caller that looked it up ahead of the first prompt.
    known_fix_id: Option<String>,
    /// Project directory completed runs are recorded against in
    /// `memory_store`. Defaults to the process's current directory.
    project_dir: Option<std::path::PathBuf>,
}

impl Runner {
    pub fn new(model: Arc<dyn sven_model::ModelProvider>, config: Arc<Config>) -> Self {
        let team = config.team.clone();
        let undo_manager = Arc::new(sven_tools::UndoManager::new(
            config.tools.undo.max_history,
            config.tools.undo.max_redo,
        ));

        // Two-phase construction: `Messenger` needs an `AgentSpawner` to
        // hand its `Delegate`/`HelpRequest` traffic to, but the only
        // spawner that makes sense here is `Runner` itself — which doesn't
        // exist yet. `messenger` starts as an empty, `Arc`-shared cell so
        // every clone of `this` (including the one captured inside the
        // spawner below) reads whatever gets stored into the SAME cell,
        // rather than each carrying its own independent `Arc<Messenger>`
        // snapshot frozen at clone time.
        let messenger = Arc::new(std::sync::OnceLock::new());

        let this = Self {
            model,
            config,
            max_retained_agents: team.max_retained_agents,
            max_retained_results: team.max_retained_results,
            default_wait_timeout: Duration::from_secs(team.runner_wait_timeout_secs),
            running: Arc::new(Mutex::new(HashMap::new())),
            results: Arc::new(Mutex::new(HashMap::new())),
            max_delegation_depth: team.max_delegation_depth,
            messenger,
            progress_tick: Duration::from_secs(team.progress_tick_secs),
            callbacks: None,
            permission_handler: None,
            state_store: None,
            undo_manager,
            memory_note: None,
            memory_store: None,
            error_store: None,
            known_fix_id: None,
            project_dir: None,
        };

        let real_spawner: Arc<dyn AgentSpawner> = Arc::new(this.clone());
        let real_messenger = Arc::new(Messenger::new(
            real_spawner,
            team.max_delegation_depth,
            Duration::from_secs(team.messenger_response_timeout_secs),
        ));
        this.messenger
            .set(real_messenger)
            .unwrap_or_else(|_| panic!("Runner::new fills its messenger cell exactly once"));
        this
    }

    /// Attach a rendered memory/error-store digest to be surfaced to every
    /// agent this runner subsequently builds.
    pub fn with_memory_note(mut self, note: impl Into<String>) -> Self {
        self.memory_note = Some(note.into());
        self
    }

    /// Attach the learned-facts store completed runs should add breadcrumbs
    /// to.
    pub fn with_memory_store(mut self, store: Arc<sven_memory::MemoryStore>) -> Self {
        self.memory_store = Some(store);
        self
    }

    /// Attach the error-pattern store completed runs should update success
    /// rates in.
    pub fn with_error_store(mut self, store: Arc<sven_memory::ErrorStore>) -> Self {
        self.error_store = Some(store);
        self
    }

    /// Record which [`sven_memory::ErrorStore`] entry's solution this
    /// session's prompt was seeded with, so the first completed run can
    /// feed back whether it actually worked.
    pub fn with_known_fix(mut self, entry_id: impl Into<String>) -> Self {
        self.known_fix_id = Some(entry_id.into());
        self
    }

    /// Project directory completed runs are recorded against. Defaults to
    /// the process's current directory if never set.
    pub fn with_project_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.project_dir = Some(dir.into());
        self
    }

    /// Shared undo/redo stack backing every write/edit/delete tool this
    /// runner builds — exposed so a caller (e.g. a CLI `/undo` command) can
    /// act on it directly.
    pub fn undo_manager(&self) -> Arc<sven_tools::UndoManager> {
        Arc::clone(&self.undo_manager)
    }

    /// Attach a durable agent-state store so finished agents can later be
    /// resumed with [`Runner::resume`] / [`Runner::resume_async`].
    pub fn with_state_store(mut self, store: Arc<crate::persistence::AgentStateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    /// Attach a human-in-the-loop prompt handler used by every agent this
    /// runner subsequently builds. Intended for the top-level session agent;
    /// delegated/help sub-agents normally run unattended.
    pub fn with_permission_handler(
        mut self,
        handler: Arc<dyn sven_tools::permission::PermissionPromptHandler>,
    ) -> Self {
        self.permission_handler = Some(handler);
        self
    }

    /// Attach lifecycle hooks (start/complete/progress/scratchpad) fired
    /// around every agent this runner spawns.
    pub fn with_callbacks(mut self, callbacks: Arc<dyn RunnerCallbacks>) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    /// Shared messenger every spawned agent's `delegate`/`help_request`
    /// tools send through.
    pub fn messenger(&self) -> Arc<Messenger> {
        Arc::clone(
            self.messenger
                .get()
                .expect("Runner::new fills the messenger cell before returning"),
        )
    }

    /// Tool profile + operating mode for a given agent type. `Coordinator` is
    /// deliberately absent — it is never a spawn target.
    fn profile(agent_type: &AgentType) -> anyhow::Result<(AgentMode, bool, bool)> {
        // (mode, allow_write_tools, allow_shell)
        match agent_type {
            AgentType::Explore => Ok((AgentMode::Research, false, false)),
            AgentType::Bash => Ok((AgentMode::Agent, false, true)),
            AgentType::General | AgentType::Custom(_) => Ok((AgentMode::Agent, true, true)),
            AgentType::Plan => Ok((AgentMode::Plan, false, false)),
            AgentType::Guide => Ok((AgentMode::Research, false, false)),
            AgentType::Coordinator => Err(RunnerError::NotSpawnable(agent_type.clone()).into()),
        }
    }

    /// Build the tool registry for a spawn of `agent_type`. `mode_lock` and
    /// `tool_event_tx` must be the same instances the `Agent` this registry
    /// is handed to was built with — `TodoWriteTool`/`SwitchModeTool` only
    /// reach the agent's own event loop if the channel is actually shared,
    /// not a second, disconnected one.
    fn build_registry(
        &self,
        agent_type: &AgentType,
        allow_write: bool,
        allow_shell: bool,
        agent_id: &str,
        delegation_depth: u32,
        mode_lock: Arc<Mutex<AgentMode>>,
        tool_event_tx: mpsc::Sender<ToolEvent>,
    ) -> ToolRegistry {
        let todos: Arc<Mutex<Vec<TodoItem>>> = Arc::new(Mutex::new(Vec::new()));

        let mut reg = ToolRegistry::new();
        reg.register(ReadFileTool);
        reg.register(ListDirTool);
        reg.register(GlobFileSearchTool);
        reg.register(GrepTool);
        reg.register(SearchCodebaseTool);
        reg.register(ReadLintsTool);
        reg.register(AskQuestionTool::new());
        reg.register(WebFetchTool);
        reg.register(WebSearchTool {
            api_key: self.config.tools.web.search.api_key.clone(),
        });
        // `UpdateMemoryTool` is the flat key-value scratch file, independent
        // of `sven_memory::MemoryStore`'s directory-based entries — sub-agents
        // get the same default path a top-level agent would.
        reg.register(UpdateMemoryTool { memory_file: None });
        reg.register(TodoWriteTool::new(todos, tool_event_tx.clone()));
        reg.register(SwitchModeTool::new(mode_lock, tool_event_tx));

        let help_request = HelpRequestTool::new(agent_id.to_string());
        help_request.set_messenger(self.messenger());
        reg.register(help_request);

        let delegate = DelegateTool::new(agent_id.to_string(), delegation_depth);
        delegate.set_messenger(self.messenger());
        reg.register(delegate);

        if allow_write {
            reg.register(WriteTool::new().with_undo_manager(Arc::clone(&self.undo_manager)));
            reg.register(EditFileTool::new().with_undo_manager(Arc::clone(&self.undo_manager)));
            reg.register(DeleteFileTool::new().with_undo_manager(Arc::clone(&self.undo_manager)));
        }
        if allow_shell {
            reg.register(RunTerminalCommandTool {
                timeout_secs: self.config.tools.timeout_secs,
            });
        }
        debug!(agent_type = %agent_type, tools = ?reg.names(), "built sub-agent tool registry");
        reg
    }

    fn build_agent(
        &self,
        agent_id: &str,
        agent_type: &AgentType,
        max_turns: Option<u32>,
        delegation_depth: u32,
    ) -> anyhow::Result<(Agent, AgentMode)> {
        let (mode, allow_write, allow_shell) = Self::profile(agent_type)?;

        let mode_lock = Arc::new(Mutex::new(mode));
        let (tx, rx) = mpsc::channel::<ToolEvent>(64);
        let registry = Arc::new(self.build_registry(
            agent_type,
            allow_write,
            allow_shell,
            agent_id,
            delegation_depth,
            Arc::clone(&mode_lock),
            tx,
        ));

        let mut agent_config = self.config.agent.clone();
        if let Some(max_turns) = max_turns {
            agent_config.max_tool_rounds = max_turns;
        }

        let max_context_tokens = self
            .model
            .catalog_context_window()
            .unwrap_or(128_000) as usize;

        // Absent an attached handler (the common case for delegated/help
        // sub-agents, which run unattended) a tool whose policy resolves to
        // `Ask` falls back to Allow — see `PermissionGate`'s documented
        // no-handler behavior — rather than hanging forever waiting on a
        // human who isn't there.
        let policy = sven_tools::policy::ToolPolicy::from_config(&self.config.tools);
        let mut gate = sven_tools::permission::PermissionGate::new(policy, &self.config.tools.permissions);
        if let Some(handler) = &self.permission_handler {
            gate = gate.with_handler(Arc::clone(handler));
        }
        let gate = Arc::new(gate);
        let executor_config = sven_tools::ExecutorConfig {
            default_timeout: Duration::from_secs(self.config.tools.timeout_secs),
            cache_max_entries: self.config.tools.cache.max_entries,
            cache_ttl: Duration::from_secs(self.config.tools.cache.ttl_secs),
            unrestricted: self.config.tools.permissions.unrestricted,
            ..sven_tools::ExecutorConfig::default()
        };
        let executor = Arc::new(sven_tools::Executor::new(registry.clone(), gate, executor_config));

        let mut agent = Agent::new(
            self.model.clone(),
            registry,
            Arc::new(agent_config),
            AgentRuntimeContext::default(),
            mode_lock,
            rx,
            max_context_tokens,
        )
        .with_executor(executor);
        if let Some(note) = &self.memory_note {
            agent.set_memory_note(Some(note.clone()));
        }
        Ok((agent, mode))
    }

    /// Run `agent_type` on `prompt` to completion on the current task,
    /// blocking until it finishes. Prefer [`Runner::spawn`] for concurrent
    /// sub-agents.
    pub async fn run_to_completion(&self, agent_type: AgentType, prompt: String, max_turns: Option<u32>) -> AgentResult {
        self.run_to_completion_with_history(agent_type, prompt, max_turns, Vec::new()).await
    }

    /// Like [`Runner::run_to_completion`] but seeds the agent's session with
    /// `history` first — used by [`Runner::resume`] to restore a saved
    /// conversation before submitting the new prompt.
    pub async fn run_to_completion_with_history(
        &self,
        agent_type: AgentType,
        prompt: String,
        max_turns: Option<u32>,
        history: Vec<sven_model::Message>,
    ) -> AgentResult {
        self.run_to_completion_as(Uuid::new_v4().to_string(), agent_type, prompt, max_turns, history, 0)
            .await
    }

    /// Like [`Runner::run_to_completion`] but for a sub-agent spawned at
    /// `delegation_depth` (the depth the *new* agent's own `delegate` tool
    /// should start counting from). Used by [`Runner`]'s [`AgentSpawner`]
    /// impl, which `Messenger` calls with the depth it already validated.
    async fn run_to_completion_with_depth(
        &self,
        agent_type: AgentType,
        prompt: String,
        max_turns: Option<u32>,
        delegation_depth: u32,
    ) -> AgentResult {
        self.run_to_completion_as(
            Uuid::new_v4().to_string(),
            agent_type,
            prompt,
            max_turns,
            Vec::new(),
            delegation_depth,
        )
        .await
    }

    /// Core of [`Runner::run_to_completion_with_history`], parameterised on
    /// `agent_id` so [`Runner::resume`] can reuse the id of the agent it is
    /// restoring rather than minting a fresh one.
    async fn run_to_completion_as(
        &self,
        agent_id: String,
        agent_type: AgentType,
        prompt: String,
        max_turns: Option<u32>,
        history: Vec<sven_model::Message>,
        delegation_depth: u32,
    ) -> AgentResult {
        let started = Instant::now();
        if let Some(cb) = &self.callbacks {
            cb.on_start(&agent_id, &agent_type);
        }

        let (mut agent, _mode) = match self.build_agent(&agent_id, &agent_type, max_turns, delegation_depth) {
            Ok(a) => a,
            Err(e) => {
                let result = AgentResult {
                    agent_id,
                    agent_type,
                    status: AgentStatus::Failed,
                    output: String::new(),
                    error: Some(e.to_string()),
                    duration: started.elapsed(),
                    completed: true,
                    tool_usage: Vec::new(),
                    completed_at: chrono::Utc::now(),
                };
                if let Some(cb) = &self.callbacks {
                    cb.on_complete(&result);
                }
                return result;
            }
        };
        if !history.is_empty() {
            agent.seed_history(history).await;
        }

        // Periodic "still working" ticker (spec's `SpawnAsync` progress
        // surface): polls the agent's own progress/scratchpad state — last
        // updated by whatever tool called `set_progress`/`set_scratchpad`,
        // e.g. `todo_write` — and forwards it to the runner's callbacks.
        // Aborted as soon as `submit` returns; a no-op entirely if no
        // callbacks are attached.
        let ticker = self.callbacks.clone().map(|cb| {
            let agent_id = agent_id.clone();
            let progress = agent.progress_handle();
            let scratchpad = agent.scratchpad_handle();
            let tick = self.progress_tick;
            tokio::spawn(async move {
                let mut last_scratchpad = String::new();
                loop {
                    tokio::time::sleep(tick).await;
                    let (step, total, description) = progress.lock().await.clone();
                    cb.on_progress(&agent_id, step, total, &description);
                    let pad = scratchpad.lock().await.clone();
                    if pad != last_scratchpad {
                        cb.on_scratchpad(&agent_id, &pad);
                        last_scratchpad = pad;
                    }
                }
            })
        });

        let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
        let submit_result = agent.submit(&prompt, tx).await;
        if let Some(handle) = ticker {
            handle.abort();
        }

        let mut output = String::new();
        let mut tool_usage: HashMap<String, (u32, u32)> = HashMap::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                AgentEvent::TextComplete(text) if !text.is_empty() => {
                    if !output.is_empty() {
                        output.push('\n');
                    }
                    output.push_str(&text);
                }
                AgentEvent::ToolCallFinished { tool_name, is_error, .. } => {
                    let entry = tool_usage.entry(tool_name).or_insert((0, 0));
                    entry.0 += 1;
                    if is_error {
                        entry.1 += 1;
                    }
                }
                AgentEvent::ScratchpadUpdated(content) => {
                    if let Some(cb) = &self.callbacks {
                        cb.on_scratchpad(&agent_id, &content);
                    }
                }
                AgentEvent::Progress { step, total_steps, description } => {
                    if let Some(cb) = &self.callbacks {
                        cb.on_progress(&agent_id, step, total_steps, &description);
                    }
                }
                _ => {}
            }
        }

        if let Some(store) = &self.state_store {
            let snapshot = crate::types::SavedAgentState {
                agent_id: agent_id.clone(),
                agent_type: agent_type.clone(),
                model_id: self.model.model_name().to_string(),
                max_turns: max_turns.unwrap_or(self.config.agent.max_tool_rounds),
                history: agent.history().to_vec(),
                saved_at: chrono::Utc::now(),
            };
            if let Err(e) = store.save(&snapshot) {
                warn!(agent_id = %agent_id, error = %e, "failed to persist agent state");
            }
        }

        let result = match submit_result {
            Ok(()) => AgentResult {
                agent_id,
                agent_type,
                status: AgentStatus::Completed,
                output,
                error: None,
                duration: started.elapsed(),
                completed: true,
                tool_usage: tool_usage
                    .into_iter()
                    .map(|(tool_name, (call_count, error_count))| crate::types::ToolUsage {
                        tool_name,
                        call_count,
                        error_count,
                    })
                    .collect(),
                completed_at: chrono::Utc::now(),
            },
            Err(e) => AgentResult {
                agent_id,
                agent_type,
                status: AgentStatus::Failed,
                output,
                error: Some(e.to_string()),
                duration: started.elapsed(),
                completed: true,
                tool_usage: Vec::new(),
                completed_at: chrono::Utc::now(),
            },
        };

        self.record_memory(&result, &prompt);
        if let Some(cb) = &self.callbacks {
            cb.on_complete(&result);
        }
        result
    }

    /// Feed a finished run back into the learning stores (spec's §4.6
    /// memory/error layer): update the seeded known-fix's success rate, and
    /// leave a project-scoped breadcrumb a later session's pre-prompt digest
    /// can retrieve. A no-op for either store that was never attached.
    fn record_memory(&self, result: &AgentResult, prompt: &str) {
        let success = result.status == AgentStatus::Completed;

        if let (Some(store), Some(id)) = (&self.error_store, &self.known_fix_id) {
            store.record_outcome(id, success);
        }

        if let Some(store) = &self.memory_store {
            let project = self
                .project_dir
                .clone()
                .or_else(|| std::env::current_dir().ok());
            let mut content = format!("{}: {}", if success { "did" } else { "failed to" }, truncate(prompt, 200));
            if success && !result.output.is_empty() {
                content.push_str(&format!(" -> {}", truncate(&result.output, 200)));
            }
            store.add(None, sven_memory::MemoryType::Project, content, project.as_deref());
        }
    }

    /// Load `agent_id`'s saved state (if a state store is configured and a
    /// snapshot exists) and run `prompt` against its restored history,
    /// blocking until completion. Falls back to a fresh agent of `agent_type`
    /// when no snapshot is found, matching the Corruption error-handling
    /// policy ("start fresh rather than refuse to boot").
    pub async fn resume(
        &self,
        agent_id: &str,
        agent_type: AgentType,
        prompt: String,
        max_turns: Option<u32>,
    ) -> AgentResult {
        let history = self
            .state_store
            .as_ref()
            .and_then(|s| s.load(agent_id))
            .map(|s| s.history)
            .unwrap_or_default();
        self.run_to_completion_as(agent_id.to_string(), agent_type, prompt, max_turns, history, 0)
            .await
    }

    /// Like [`Runner::resume`] but runs as a background task and returns
    /// immediately; collect the result with [`Runner::wait`].
    pub async fn resume_async(
        &self,
        agent_id: &str,
        agent_type: AgentType,
        prompt: String,
        max_turns: Option<u32>,
    ) -> Result<String, RunnerError> {
        Self::profile(&agent_type).map_err(|_| RunnerError::NotSpawnable(agent_type.clone()))?;

        let agent_id = agent_id.to_string();
        let history = self
            .state_store
            .as_ref()
            .and_then(|s| s.load(&agent_id))
            .map(|s| s.history)
            .unwrap_or_default();

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let this = self.clone();
        let at = agent_type.clone();
        let id_for_task = agent_id.clone();
        let at_for_cancel = at.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = &mut cancel_rx => AgentResult {
                    agent_id: String::new(),
                    agent_type: at_for_cancel,
                    status: AgentStatus::Cancelled,
                    output: String::new(),
                    error: Some("cancelled before completion".into()),
                    duration: Duration::ZERO,
                    completed: true,
                    tool_usage: Vec::new(),
                    completed_at: chrono::Utc::now(),
                },
                result = this.run_to_completion_as(id_for_task, at, prompt, max_turns, history, 0) => result,
            }
        });

        self.running.lock().await.insert(
            agent_id.clone(),
            RunningAgent {
                agent_type,
                started: Instant::now(),
                handle,
                cancel_tx: Some(cancel_tx),
            },
        );
        self.evict_if_over_capacity().await;
        Ok(agent_id)
    }

    /// Spawn `agent_type` on `prompt` as a background task and return its id
    /// immediately. Use [`Runner::wait`] to collect the result.
    pub async fn spawn(&self, agent_type: AgentType, prompt: String, max_turns: Option<u32>) -> Result<String, RunnerError> {
        Self::profile(&agent_type).map_err(|_| RunnerError::NotSpawnable(agent_type.clone()))?;

        let agent_id = Uuid::new_v4().to_string();
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let this = self.clone();
        let at = agent_type.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = &mut cancel_rx => AgentResult {
                    agent_id: String::new(),
                    agent_type: at.clone(),
                    status: AgentStatus::Cancelled,
                    output: String::new(),
                    error: Some("cancelled before completion".into()),
                    duration: Duration::ZERO,
                    completed: true,
                    tool_usage: Vec::new(),
                    completed_at: chrono::Utc::now(),
                },
                result = this.run_to_completion(at, prompt, max_turns) => result,
            }
        });

        self.running.lock().await.insert(
            agent_id.clone(),
            RunningAgent {
                agent_type,
                started: Instant::now(),
                handle,
                cancel_tx: Some(cancel_tx),
            },
        );
        self.evict_if_over_capacity().await;
        Ok(agent_id)
    }

    pub async fn spawn_multiple(
        &self,
        tasks: Vec<(AgentType, String, Option<u32>)>,
    ) -> Vec<Result<String, RunnerError>> {
        let mut ids = Vec::with_capacity(tasks.len());
        for (agent_type, prompt, max_turns) in tasks {
            ids.push(self.spawn(agent_type, prompt, max_turns).await);
        }
        ids
    }

    /// Block until `agent_id` finishes, with no timeout.
    pub async fn wait(&self, agent_id: &str) -> Result<AgentResult, RunnerError> {
        self.wait_with_timeout(agent_id, None).await
    }

    /// Block until `agent_id` finishes or `timeout` elapses.
    pub async fn wait_with_timeout(&self, agent_id: &str, timeout: Option<Duration>) -> Result<AgentResult, RunnerError> {
        let handle_opt = {
            let mut running = self.running.lock().await;
            running.remove(agent_id)
        };
        let Some(running_agent) = handle_opt else {
            // Already finished and moved into `results`.
            let results = self.results.lock().await;
            return results.get(agent_id).cloned().ok_or_else(|| RunnerError::NotFound(agent_id.to_string()));
        };

        let join = running_agent.handle;
        let result = match timeout {
            Some(t) => match tokio::time::timeout(t, join).await {
                Ok(Ok(mut r)) => {
                    r.agent_id = agent_id.to_string();
                    r
                }
                Ok(Err(e)) => return Err(RunnerError::Other(anyhow::anyhow!("agent task panicked: {e}"))),
                Err(_) => return Err(RunnerError::WaitTimeout(agent_id.to_string(), t)),
            },
            None => match join.await {
                Ok(mut r) => {
                    r.agent_id = agent_id.to_string();
                    r
                }
                Err(e) => return Err(RunnerError::Other(anyhow::anyhow!("agent task panicked: {e}"))),
            },
        };

        self.store_result(agent_id, result.clone()).await;
        Ok(result)
    }

    /// Wait for every currently-running agent, in spawn order. Agents spawned
    /// after this call begins are not included.
    pub async fn wait_all(&self) -> Vec<(String, Result<AgentResult, RunnerError>)> {
        let ids: Vec<String> = self.running.lock().await.keys().cloned().collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let result = self.wait(&id).await;
            out.push((id, result));
        }
        out
    }

    /// Request cancellation of a running agent. A no-op if it already
    /// finished.
    pub async fn cancel(&self, agent_id: &str) -> Result<(), RunnerError> {
        let mut running = self.running.lock().await;
        let entry = running.get_mut(agent_id).ok_or_else(|| RunnerError::NotFound(agent_id.to_string()))?;
        if let Some(tx) = entry.cancel_tx.take() {
            let _ = tx.send(());
        }
        Ok(())
    }

    /// Drop the retained result for `agent_id`, if any.
    pub async fn cleanup(&self, agent_id: &str) {
        self.results.lock().await.remove(agent_id);
    }

    /// Previously-completed result, if still retained.
    pub async fn result(&self, agent_id: &str) -> Option<AgentResult> {
        self.results.lock().await.get(agent_id).cloned()
    }

    /// Insert `result` and, on overflow, trim the oldest completed half —
    /// not just the minimum needed to reach the cap — so a burst of spawns
    /// doesn't repeatedly nibble the cache down one entry at a time.
    async fn store_result(&self, agent_id: &str, result: AgentResult) {
        let mut results = self.results.lock().await;
        results.insert(agent_id.to_string(), result);
        if results.len() > self.max_retained_results {
            let mut by_age: Vec<(String, chrono::DateTime<chrono::Utc>)> = results
                .iter()
                .map(|(id, r)| (id.clone(), r.completed_at))
                .collect();
            by_age.sort_by_key(|(_, completed_at)| *completed_at);
            let evict = by_age.len() / 2;
            for (id, _) in by_age.into_iter().take(evict) {
                results.remove(&id);
            }
        }
    }

    /// Trim the oldest-started running agents once the soft cap is exceeded.
    /// Only candidates that have already finished (`is_finished()`) are
    /// evicted — a genuinely still-running agent is never force-dropped here.
    async fn evict_if_over_capacity(&self) {
        let mut running = self.running.lock().await;
        if running.len() <= self.max_retained_agents {
            return;
        }
        let mut finished_ids: Vec<(String, Instant)> = running
            .iter()
            .filter(|(_, r)| r.handle.is_finished())
            .map(|(id, r)| (id.clone(), r.started))
            .collect();
        finished_ids.sort_by_key(|(_, started)| *started);
        let overflow = running.len() - self.max_retained_agents;
        for (id, _) in finished_ids.into_iter().take(overflow) {
            if let Some(r) = running.remove(&id) {
                warn!(agent_id = %id, agent_type = %r.agent_type, "evicting retained agent past soft cap");
            }
        }
    }
}

#[async_trait]
impl AgentSpawner for Runner {
    // Delegation depth is carried per-message in `Message::data`
    // ("delegation_depth") and checked there by `messenger::handle_message`
    // against `Messenger`'s own `max_delegation_depth` — not here. A
    // runner-wide counter would make two unrelated, concurrently-spawned
    // top-level agents contend for the same depth budget and could
    // spuriously trip "maximum depth exceeded" despite neither being
    // nested in an actual delegation chain, so this impl just runs the
    // agent at the depth the messenger already validated and leaves
    // enforcement entirely to it.
    async fn spawn_and_run(
        &self,
        agent_type: AgentType,
        prompt: String,
        delegation_depth: u32,
    ) -> anyhow::Result<AgentResult> {
        Ok(self.run_to_completion_with_depth(agent_type, prompt, None, delegation_depth).await)
    }
}

/// Truncate `s` to at most `max` chars, appending "..." if it was cut.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max).collect::<String>())
    }
}

/// Deterministic [`AgentSpawner`] used by messenger and coordinator tests: it
/// never touches a model or the filesystem, just echoes the prompt back.
#[cfg(test)]
pub struct MockSpawner {
    fail: bool,
}

#[cfg(test)]
impl MockSpawner {
    pub fn echo() -> Self {
        Self { fail: false }
    }

    pub fn failing() -> Self {
        Self { fail: true }
    }
}

#[cfg(test)]
#[async_trait]
impl AgentSpawner for MockSpawner {
    async fn spawn_and_run(&self, agent_type: AgentType, prompt: String, _delegation_depth: u32) -> anyhow::Result<AgentResult> {
        if self.fail {
            anyhow::bail!("mock spawn failure");
        }
        Ok(AgentResult {
            agent_id: Uuid::new_v4().to_string(),
            agent_type,
            status: AgentStatus::Completed,
            output: prompt,
            error: None,
            duration: Duration::from_millis(1),
            completed: true,
            tool_usage: Vec::new(),
            completed_at: chrono::Utc::now(),
        })
    }
}
