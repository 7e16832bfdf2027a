// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use diligent_config::AgentMode;

#[derive(Parser, Debug)]
#[command(
    name = "diligent",
    about = "LLM agent orchestration with resumable tree-structured sessions",
    version
)]
pub struct Cli {
    /// The task to run.  Omit when using a subcommand.
    pub prompt: Vec<String>,

    /// Resume a session instead of starting fresh: `--resume` picks the most
    /// recently modified session, `--resume=<id>` a specific one.
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "")]
    pub resume: Option<String>,

    /// Agent mode: default | plan | execute.
    #[arg(long)]
    pub mode: Option<AgentMode>,

    /// Model id or alias (overrides config and DILIGENT_MODEL).
    #[arg(long)]
    pub model: Option<String>,

    /// Explicit config file path (merged on top of discovered layers).
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Log to stderr (RUST_LOG controls the filter).
    #[arg(long, short = 'v')]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List sessions in this project, newest first.
    Sessions,
    /// Print the merged configuration and exit.
    ShowConfig,
}

impl Cli {
    pub fn prompt_text(&self) -> String {
        self.prompt.join(" ")
    }
}
