// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cli;

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use sven_config::Config;
use sven_memory::{ErrorStore, MemoryStore};
use sven_team::{AgentResult, AgentStatus, AgentType, Coordinator, CoordinatorTask, NullBroadcaster, Runner};
use sven_tools::permission::{PermissionDecision, PermissionPromptHandler, PermissionRequest};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(cmd) = &cli.command {
        let config = sven_config::load(cli.config.as_deref())?;
        match cmd {
            Commands::ShowConfig => {
                println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
                return Ok(());
            }
            Commands::Sessions => {
                print_sessions(&config);
                return Ok(());
            }
            Commands::Batch { file } => {
                let config = Arc::new(config);
                return run_batch(&cli, config, file).await;
            }
        }
    }

    let config = Arc::new(sven_config::load(cli.config.as_deref())?);
    run_session(cli, config).await
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

fn state_store_dir(config: &Config) -> PathBuf {
    config
        .team
        .agent_store_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(sven_team::AgentStateStore::default_dir)
}

fn print_sessions(config: &Config) {
    let store = sven_team::AgentStateStore::new(state_store_dir(config));
    let mut ids = store.list_ids();
    ids.sort();
    if ids.is_empty() {
        println!("no saved sessions");
    }
    for id in ids {
        println!("{id}");
    }
}

/// A tool invocation an unattended run can't ask about — prompts on stderr
/// (stdout carries the agent's actual output), blocking on a stdin read.
struct StdinPromptHandler;

#[async_trait]
impl PermissionPromptHandler for StdinPromptHandler {
    async fn prompt(&self, request: &PermissionRequest) -> PermissionDecision {
        let tool_name = request.tool_name.clone();
        let args = request.args.clone();
        let risk = request.risk_level;
        let reason = request.reason.clone();
        tokio::task::spawn_blocking(move || {
            eprintln!("\n[{risk:?}] {tool_name}: {reason}");
            eprintln!("  {args}");
            eprint!("Allow? [y/N/a=allow for session] ");
            let _ = std::io::stderr().flush();
            let mut line = String::new();
            if std::io::stdin().lock().read_line(&mut line).is_err() {
                return PermissionDecision::Deny;
            }
            match line.trim().to_lowercase().as_str() {
                "y" | "yes" => PermissionDecision::Allow,
                "a" | "always" => PermissionDecision::AllowSession,
                _ => PermissionDecision::Deny,
            }
        })
        .await
        .unwrap_or(PermissionDecision::Deny)
    }
}

/// Maps a CLI-provided string onto the fixed [`AgentType`] roster, falling
/// back to [`AgentType::Custom`] for anything else. `AgentType` itself has
/// no `FromStr` impl — the mapping is a CLI-layer concern, not a runtime one.
fn parse_agent_type(s: &str) -> AgentType {
    match s.to_lowercase().as_str() {
        "explore" => AgentType::Explore,
        "bash" => AgentType::Bash,
        "general" => AgentType::General,
        "plan" => AgentType::Plan,
        "guide" => AgentType::Guide,
        other => AgentType::Custom(other.to_string()),
    }
}

/// Build the memory/error-store digest surfaced to the agent ahead of its
/// system prompt: the top relevant memory entries for `query`, a known fix
/// if `query` matches a recorded error pattern, and this project's
/// accumulated learning notes. Returns the digest and, if a known fix
/// matched, its id — so the caller can seed [`Runner::with_known_fix`] and
/// later feed back whether the fix actually worked.
fn build_memory_note(
    config: &Config,
    memory: &MemoryStore,
    errors: &ErrorStore,
    query: &str,
) -> (Option<String>, Option<String>) {
    let cwd = std::env::current_dir().ok();

    let mut sections = Vec::new();
    let mut known_fix_id = None;

    let hits = memory.search(query, None, cwd.as_deref(), 5);
    if !hits.is_empty() {
        let mut block = String::from("Relevant memory:\n");
        for hit in &hits {
            block.push_str(&format!("- {}\n", hit.entry.content));
        }
        sections.push(block);
    }

    if let Some(entry) = errors.find_solution(query) {
        sections.push(format!(
            "Known fix for a similar error ({}): {}\n",
            entry.error_type, entry.solution
        ));
        known_fix_id = Some(entry.id);
    }

    if let Some(project) = cwd {
        let memory_dir = config
            .memory
            .memory_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".config/sven/memory")
            });
        let learning = sven_memory::project_learning::load(&memory_dir, &project);
        if !learning.notes.is_empty() {
            let mut block = String::from("Project learning:\n");
            for note in &learning.notes {
                block.push_str(&format!("- {}\n", note.content));
            }
            sections.push(block);
        }
    }

    let note = if sections.is_empty() { None } else { Some(sections.join("\n")) };
    (note, known_fix_id)
}

/// One entry in a `sven batch` task file.
#[derive(serde::Deserialize)]
struct BatchTaskSpec {
    task_id: String,
    agent_type: String,
    prompt: String,
    max_turns: Option<u32>,
}

/// Dispatch every task in `file` through a [`Coordinator`], bounded by
/// `team.max_parallel`. Unattended: batch tasks never have a human to prompt,
/// so every tool call runs under `--yolo` semantics regardless of the flag.
async fn run_batch(cli: &Cli, config: Arc<Config>, file: &std::path::Path) -> anyhow::Result<()> {
    let specs: Vec<BatchTaskSpec> = serde_json::from_slice(
        &std::fs::read(file).with_context(|| format!("reading {}", file.display()))?,
    )
    .with_context(|| format!("parsing {} as a JSON task list", file.display()))?;

    let model_cfg = match &cli.model {
        Some(m) => sven_model::resolve_model_from_config(&config, m),
        None => config.model.clone(),
    };
    let model: Arc<dyn sven_model::ModelProvider> =
        Arc::from(sven_model::from_config(&model_cfg).context("building model provider")?);

    let state_store = Arc::new(sven_team::AgentStateStore::new(state_store_dir(&config)));
    let runner = Arc::new(
        Runner::new(model, Arc::clone(&config))
            .with_state_store(state_store)
            .with_project_dir(std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))),
    );
    let coordinator = Coordinator::new(runner, config.team.max_parallel, Arc::new(NullBroadcaster));

    let task_ids: Vec<String> = specs.iter().map(|s| s.task_id.clone()).collect();
    let tasks = specs
        .into_iter()
        .map(|s| CoordinatorTask {
            task_id: s.task_id,
            agent_type: parse_agent_type(&s.agent_type),
            prompt: s.prompt,
            max_turns: s.max_turns,
        })
        .collect();

    // `run_batch` preserves input order (not completion order), so zipping
    // back with `task_ids` labels each result with the task that produced it
    // rather than the runner-minted agent id.
    let results = coordinator.run_batch(tasks).await;
    let mut any_failed = false;
    for (task_id, result) in task_ids.iter().zip(&results) {
        any_failed |= result.status == AgentStatus::Failed;
        println!("--- {task_id} ---");
        print_result(&result.agent_id, result);
    }
    if any_failed {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_session(cli: Cli, config: Arc<Config>) -> anyhow::Result<()> {
    let model_cfg = match &cli.model {
        Some(m) => sven_model::resolve_model_from_config(&config, m),
        None => config.model.clone(),
    };
    let model: Arc<dyn sven_model::ModelProvider> =
        Arc::from(sven_model::from_config(&model_cfg).context("building model provider")?);

    let agent_type = parse_agent_type(&cli.agent_type);
    let agent_id = cli.resume.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let state_store = Arc::new(sven_team::AgentStateStore::new(state_store_dir(&config)));
    let memory_store = Arc::new(MemoryStore::load(&config.memory));
    let error_store = Arc::new(ErrorStore::load(&config.memory));
    let mut runner = Runner::new(model, Arc::clone(&config))
        .with_state_store(Arc::clone(&state_store))
        .with_memory_store(Arc::clone(&memory_store))
        .with_error_store(Arc::clone(&error_store))
        .with_project_dir(std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    if !cli.yolo {
        runner = runner.with_permission_handler(Arc::new(StdinPromptHandler));
    } else {
        warn!("--yolo: every tool call will be allowed without a prompt");
    }

    if let Some(prompt) = cli.prompt.as_deref() {
        let (note, known_fix_id) = build_memory_note(&config, &memory_store, &error_store, prompt);
        if let Some(note) = note {
            runner = runner.with_memory_note(note);
        }
        if let Some(id) = known_fix_id {
            runner = runner.with_known_fix(id);
        }
    }

    info!(agent_id = %agent_id, agent_type = %agent_type, model = %model_cfg.name, "session starting");

    if let Some(prompt) = cli.prompt.clone() {
        let result = runner.resume(&agent_id, agent_type, prompt, cli.max_turns).await;
        print_result(&agent_id, &result);
        flush_memory(&memory_store, &error_store).await;
        return if result.status == AgentStatus::Failed {
            std::process::exit(1);
        } else {
            Ok(())
        };
    }

    println!("sven session {agent_id} ({agent_type}) — type 'exit' to quit, '/undo' or '/redo' to revert a file change");
    let stdin = std::io::stdin();
    loop {
        eprint!("> ");
        std::io::stderr().flush().ok();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break; // EOF
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit") {
            break;
        }
        if line == "/undo" {
            match runner.undo_manager().undo() {
                Ok(Some(change)) => println!("undid {} on {}", change.tool_name, change.path.display()),
                Ok(None) => println!("nothing to undo"),
                Err(e) => println!("undo failed: {e}"),
            }
            continue;
        }
        if line == "/redo" {
            match runner.undo_manager().redo() {
                Ok(Some(change)) => println!("redid {} on {}", change.tool_name, change.path.display()),
                Ok(None) => println!("nothing to redo"),
                Err(e) => println!("redo failed: {e}"),
            }
            continue;
        }

        let result = runner
            .resume(&agent_id, agent_type.clone(), line.to_string(), cli.max_turns)
            .await;
        print_result(&agent_id, &result);
    }

    flush_memory(&memory_store, &error_store).await;
    Ok(())
}

/// Best-effort durability on the way out: a dropped debounce timer from the
/// last `add`/`record_outcome` call would otherwise lose up to
/// `debounce_ms` of learning when the process exits right after it.
async fn flush_memory(memory: &MemoryStore, errors: &ErrorStore) {
    if let Err(e) = memory.flush().await {
        warn!(error = %e, "failed to flush memory store");
    }
    if let Err(e) = errors.flush().await {
        warn!(error = %e, "failed to flush error store");
    }
}

fn print_result(agent_id: &str, result: &AgentResult) {
    match result.status {
        AgentStatus::Completed => println!("{}", result.output),
        AgentStatus::Failed => eprintln!(
            "agent {agent_id} failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        ),
        AgentStatus::Cancelled => eprintln!("agent {agent_id} cancelled"),
        AgentStatus::Pending | AgentStatus::Running => {
            eprintln!("agent {agent_id} did not reach a terminal state")
        }
    }
    if !result.tool_usage.is_empty() {
        let summary: Vec<String> = result
            .tool_usage
            .iter()
            .map(|u| format!("{}×{}", u.tool_name, u.call_count))
            .collect();
        eprintln!("tools: {}", summary.join(", "));
    }
}
