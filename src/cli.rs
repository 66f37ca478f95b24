// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "sven",
    version,
    about = "Headless multi-agent coding runtime: runner, messenger, tool executor, permission gate, memory"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Initial prompt to run. Omit to start an interactive session reading
    /// prompts from stdin, one per line, until EOF or "exit"/"quit".
    #[arg(value_name = "PROMPT")]
    pub prompt: Option<String>,

    /// Agent type for this session: general | explore | bash | plan | guide,
    /// or any other string to run as a custom type.
    #[arg(long, short = 't', default_value = "general")]
    pub agent_type: String,

    /// Model override: "provider/model", a bare provider id (e.g. "groq"),
    /// a bare model name, or a key under `providers:` in the config file.
    #[arg(long, short = 'M', env = "SVEN_MODEL")]
    pub model: Option<String>,

    /// Resume a previously-saved session by agent id instead of starting a
    /// fresh one. The id is also used as the persistence key for this run.
    #[arg(long, value_name = "AGENT_ID")]
    pub resume: Option<String>,

    /// Path to config file (overrides auto-discovery).
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Maximum autonomous tool-call rounds for this run (overrides config).
    #[arg(long)]
    pub max_turns: Option<u32>,

    /// Skip permission prompts and allow every tool call unattended.
    /// Dangerous outside a sandbox — there is no human to catch a bad
    /// `delete_file` or shell command.
    #[arg(long)]
    pub yolo: bool,

    /// Increase log verbosity (-v debug, -vv trace). Logs go to stderr.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the resolved configuration as YAML and exit.
    ShowConfig,
    /// List agent ids persisted under the team state store.
    Sessions,
    /// Run a batch of independent tasks concurrently (bounded by
    /// `team.max_parallel`) and print each result. Tasks are read from a
    /// JSON file: an array of `{task_id, agent_type, prompt, max_turns?}`.
    Batch {
        /// Path to the JSON task list.
        file: PathBuf,
    },
}
