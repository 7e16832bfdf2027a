// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use diligent_core::{
    AgentEvent, KnowledgeStore, SaveKnowledgeTool, SessionManager, WorkspacePaths,
};
use diligent_tools::{builtin::register_builtin, ToolRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let project_root = std::env::current_dir().context("resolving working directory")?;

    if let Some(cmd) = &cli.command {
        match cmd {
            Commands::Sessions => {
                print_sessions(&project_root);
                return Ok(());
            }
            Commands::ShowConfig => {
                let config = load_config(&cli, &project_root)?;
                println!("{}", serde_json::to_string_pretty(&config)?);
                return Ok(());
            }
        }
    }

    let prompt = cli.prompt_text();
    if prompt.trim().is_empty() {
        anyhow::bail!("no prompt given; run `diligent --help` for usage");
    }

    let mut config = load_config(&cli, &project_root)?;
    let (model, provider) = diligent_model::from_config(&config)?;

    let paths = WorkspacePaths::new(&project_root);
    let mut registry = ToolRegistry::new();
    register_builtin(&mut registry)?;
    if config.knowledge.enabled {
        let store = KnowledgeStore::new(paths.knowledge_file());
        // Prior knowledge rides along in the system prompt, newest first,
        // within the configured injection budget.
        if let Some(preamble) =
            diligent_core::knowledge_preamble(&store.load(), config.knowledge.injection_budget)
        {
            config.instructions.push(preamble);
        }
        registry.register(SaveKnowledgeTool::new(store, None))?;
    }
    let tools = Arc::new(registry);

    // An explicit --resume wins; otherwise session.autoResume picks up the
    // most recent session when one exists.
    let resume_target = match &cli.resume {
        Some(id) => Some((!id.is_empty()).then_some(id.clone())),
        None if config.session.auto_resume && !SessionManager::list(&project_root).is_empty() => {
            Some(None)
        }
        None => None,
    };

    let manager = match resume_target {
        Some(id) => SessionManager::resume(
            config,
            provider,
            &model,
            tools,
            &project_root,
            id.as_deref(),
        )?,
        None => SessionManager::create(config, provider, &model, tools, &project_root)?,
    };

    if let Some(mode) = cli.mode {
        manager
            .append_mode_change(mode, diligent_core::ModeChangedBy::Cli)
            .await?;
    }

    let stream = manager.run(&prompt).await;
    let mut failed = false;
    while let Some(event) = stream.next().await {
        render_event(&event, &mut failed);
    }
    println!();

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn render_event(event: &AgentEvent, failed: &mut bool) {
    match event {
        AgentEvent::MessageDelta { delta, .. } => {
            print!("{delta}");
            let _ = std::io::stdout().flush();
        }
        AgentEvent::ToolStart {
            tool_name, input, ..
        } => {
            println!("\n[tool] {tool_name} {input}");
        }
        AgentEvent::ToolEnd {
            tool_name,
            is_error,
            ..
        } => {
            if *is_error {
                println!("[tool] {tool_name} failed");
            }
        }
        AgentEvent::StatusChange {
            retry: Some(retry), ..
        } => {
            eprintln!(
                "[retry] attempt {} in {} ms: {}",
                retry.attempt, retry.delay_ms, retry.message
            );
        }
        AgentEvent::CompactionEnd {
            tokens_before,
            tokens_after,
            ..
        } => {
            eprintln!("[compacted] ~{tokens_before} -> ~{tokens_after} tokens");
        }
        AgentEvent::LoopDetected { tool_name, .. } => {
            eprintln!("[loop detected] repeating calls to {tool_name}");
        }
        AgentEvent::Error { error, fatal } => {
            eprintln!("error ({}): {}", error.name, error.message);
            if *fatal {
                *failed = true;
            }
        }
        _ => {}
    }
}

fn print_sessions(project_root: &std::path::Path) {
    let sessions = SessionManager::list(project_root);
    if sessions.is_empty() {
        println!("no sessions");
        return;
    }
    for s in sessions {
        println!(
            "{}  {:>3} msgs  {}  {}",
            s.id,
            s.message_count,
            s.modified.format("%Y-%m-%d %H:%M"),
            s.first_user_message.as_deref().unwrap_or("-"),
        );
    }
}

fn load_config(cli: &Cli, project_root: &std::path::Path) -> anyhow::Result<diligent_config::Config> {
    let mut config = diligent_config::load(project_root, cli.config.as_deref())?;
    if let Some(model) = &cli.model {
        config.model = Some(model.clone());
    }
    Ok(config)
}

fn init_logging(verbose: bool) {
    if !verbose {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
