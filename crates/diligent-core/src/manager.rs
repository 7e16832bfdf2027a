// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use diligent_config::{AgentMode, Config};
use diligent_model::{
    catalog, looks_like_context_overflow, Message, Provider, RetryPolicy,
};
use diligent_tools::{ApproveFn, ToolRegistry};

use crate::agent::{run_agent, AgentLoopConfig};
use crate::compact::{
    accumulate_file_ops, compaction_entry, estimate_after, estimate_tokens, select_cut_point,
    should_compact, summarize,
};
use crate::context::{build_context, linear_path, BuiltContext};
use crate::entry::{generate_session_id, EntryBody, ModeChangedBy, SessionEntry, SteeringSource};
use crate::events::{agent_stream, AgentEvent, AgentStream, SerializedError};
use crate::paths::WorkspacePaths;
use crate::prompts;
use crate::store::{
    find_session_file, list_sessions, read_session, DeferredWriter, SessionHeader, SessionSummary,
};

const DEFAULT_CONTEXT_WINDOW: u32 = 200_000;

struct SessionState {
    session_id: String,
    entries: Vec<SessionEntry>,
    leaf_id: Option<String>,
    mode: AgentMode,
    running: bool,
    follow_ups: Vec<String>,
    cancel: CancellationToken,
}

/// Mediator between the agent loop, persistence, and compaction.
///
/// Owns the in-memory entry list and leaf pointer exclusively; every append
/// goes through [`append_entry`](Self::append_entry), which updates the tree
/// and chains the disk write onto the serialized writer queue.
#[derive(Clone)]
pub struct SessionManager {
    config: Arc<Config>,
    provider: Arc<dyn Provider>,
    model: String,
    tools: Arc<ToolRegistry>,
    paths: WorkspacePaths,
    state: Arc<Mutex<SessionState>>,
    /// Tokio mutex: waiters are FIFO, so appends hit the file in the order
    /// they were requested regardless of caller timing.
    writer: Arc<tokio::sync::Mutex<DeferredWriter>>,
    steering: Arc<Mutex<Vec<Message>>>,
    approve: Option<ApproveFn>,
}

impl SessionManager {
    /// Fresh session with a deferred writer; nothing touches disk until the
    /// first assistant message.
    pub fn create(
        config: Config,
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        tools: Arc<ToolRegistry>,
        project_root: &std::path::Path,
    ) -> anyhow::Result<Self> {
        let paths = WorkspacePaths::new(project_root);
        paths.ensure_layout()?;
        let session_id = generate_session_id(Utc::now());
        let header = SessionHeader::new(&session_id, project_root.display().to_string());
        let writer = DeferredWriter::new(&paths.sessions_dir(), header);
        let mode = config.mode;
        Ok(Self {
            config: Arc::new(config),
            provider,
            model: model.into(),
            tools,
            paths,
            state: Arc::new(Mutex::new(SessionState {
                session_id,
                entries: Vec::new(),
                leaf_id: None,
                mode,
                running: false,
                follow_ups: Vec::new(),
                cancel: CancellationToken::new(),
            })),
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            steering: Arc::new(Mutex::new(Vec::new())),
            approve: None,
        })
    }

    /// Resume an existing session by id, or the most recently modified one.
    pub fn resume(
        config: Config,
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        tools: Arc<ToolRegistry>,
        project_root: &std::path::Path,
        session_id: Option<&str>,
    ) -> anyhow::Result<Self> {
        let paths = WorkspacePaths::new(project_root);
        paths.ensure_layout()?;
        let path = find_session_file(&paths.sessions_dir(), session_id)?;
        let (header, entries) = read_session(&path).context("resuming session")?;
        let leaf_id = entries.last().map(|e| e.id.clone());
        let writer = DeferredWriter::resumed(path, header.clone());
        let mode = config.mode;
        Ok(Self {
            config: Arc::new(config),
            provider,
            model: model.into(),
            tools,
            paths,
            state: Arc::new(Mutex::new(SessionState {
                session_id: header.id,
                entries,
                leaf_id,
                mode,
                running: false,
                follow_ups: Vec::new(),
                cancel: CancellationToken::new(),
            })),
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            steering: Arc::new(Mutex::new(Vec::new())),
            approve: None,
        })
    }

    /// Enumerate sessions under the project, newest first.
    pub fn list(project_root: &std::path::Path) -> Vec<SessionSummary> {
        list_sessions(&WorkspacePaths::new(project_root).sessions_dir())
    }

    pub fn session_id(&self) -> String {
        self.state.lock().unwrap().session_id.clone()
    }

    pub fn paths(&self) -> &WorkspacePaths {
        &self.paths
    }

    pub fn set_approve(&mut self, approve: ApproveFn) {
        self.approve = Some(approve);
    }

    pub fn mode(&self) -> AgentMode {
        self.state.lock().unwrap().mode
    }

    /// Entries currently in memory (test and debug-viewer accessor).
    pub fn entries(&self) -> Vec<SessionEntry> {
        self.state.lock().unwrap().entries.clone()
    }

    /// The conversation as replayed from the current leaf.
    pub fn current_context(&self) -> BuiltContext {
        let state = self.state.lock().unwrap();
        build_context(&state.entries, state.leaf_id.as_deref())
    }

    /// Abort the active run, if any.  Idempotent.
    pub fn cancel(&self) {
        self.state.lock().unwrap().cancel.cancel();
    }

    /// Append an entry under the current leaf and chain the disk write.
    pub async fn append_entry(&self, body: EntryBody) -> anyhow::Result<String> {
        let entry = {
            let mut state = self.state.lock().unwrap();
            let entry = SessionEntry::new(state.leaf_id.clone(), body);
            state.leaf_id = Some(entry.id.clone());
            state.entries.push(entry.clone());
            entry
        };
        let id = entry.id.clone();
        self.writer.lock().await.append(&entry).await?;
        Ok(id)
    }

    /// Set the display name shown by session listings.
    pub async fn set_name(&self, name: impl Into<String>) -> anyhow::Result<()> {
        self.append_entry(EntryBody::SessionInfo {
            name: Some(name.into()),
        })
        .await?;
        Ok(())
    }

    pub async fn append_mode_change(
        &self,
        mode: AgentMode,
        changed_by: ModeChangedBy,
    ) -> anyhow::Result<()> {
        self.state.lock().unwrap().mode = mode;
        self.append_entry(EntryBody::ModeChange { mode, changed_by })
            .await?;
        Ok(())
    }

    // ─── Steering ─────────────────────────────────────────────────────────────

    /// Inject an out-of-band user message into the running loop.  The entry
    /// is persisted immediately; the running agent picks the message up at
    /// its next drain point.
    pub async fn steer(&self, text: &str) -> anyhow::Result<()> {
        let message = format!("[Steering] {text}");
        self.append_entry(EntryBody::Steering {
            message: message.clone(),
            source: SteeringSource::Steer,
        })
        .await?;
        self.steering.lock().unwrap().push(Message::user(message));
        Ok(())
    }

    /// Like [`steer`](Self::steer), but when no run is active the message is
    /// held as a follow-up for the caller to start a new run with.
    pub async fn follow_up(&self, text: &str) -> anyhow::Result<()> {
        let message = format!("[Steering] {text}");
        self.append_entry(EntryBody::Steering {
            message: message.clone(),
            source: SteeringSource::FollowUp,
        })
        .await?;
        let mut state = self.state.lock().unwrap();
        if state.running {
            drop(state);
            self.steering.lock().unwrap().push(Message::user(message));
        } else {
            state.follow_ups.push(text.to_string());
        }
        Ok(())
    }

    pub fn has_follow_up(&self) -> bool {
        !self.state.lock().unwrap().follow_ups.is_empty()
    }

    pub fn take_follow_ups(&self) -> Vec<String> {
        std::mem::take(&mut self.state.lock().unwrap().follow_ups)
    }

    // ─── Running ──────────────────────────────────────────────────────────────

    /// Persist `user_message`, then drive the agent loop (with compaction on
    /// both the proactive and reactive paths) against the rebuilt context.
    ///
    /// The returned stream always completes via `agent_end`, failure paths
    /// included.
    pub async fn run(&self, user_message: &str) -> AgentStream {
        let outer = agent_stream();
        {
            let mut state = self.state.lock().unwrap();
            state.running = true;
            state.cancel = CancellationToken::new();
        }

        if let Err(err) = self.ensure_model_entry().await {
            self.fail_run(&outer, err);
            return outer;
        }
        if let Err(err) = self
            .append_entry(EntryBody::Message {
                message: Message::user(user_message),
            })
            .await
        {
            self.fail_run(&outer, err);
            return outer;
        }

        let manager = self.clone();
        let out = outer.clone();
        tokio::spawn(async move {
            if let Err(err) = manager.run_with_compaction(&out).await {
                manager.fail_run(&out, err);
            }
            manager.state.lock().unwrap().running = false;
        });
        outer
    }

    fn fail_run(&self, out: &AgentStream, err: anyhow::Error) {
        warn!(error = %err, "session run failed");
        out.push(AgentEvent::Error {
            error: SerializedError::from_anyhow(&err),
            fatal: true,
        });
        out.push(AgentEvent::AgentEnd {
            messages: self.current_context().messages,
        });
        self.state.lock().unwrap().running = false;
    }

    async fn run_with_compaction(&self, out: &AgentStream) -> anyhow::Result<()> {
        let window = catalog::context_window(&self.model, DEFAULT_CONTEXT_WINDOW) as usize;
        let compaction = &self.config.compaction;

        // Proactive path: compact before the loop when the estimate has
        // eaten into the reserve.
        if compaction.enabled {
            let estimated = estimate_tokens(&self.current_context().messages);
            if should_compact(estimated, window, compaction.reserve_tokens) {
                debug!(estimated, window, "proactive compaction");
                self.compact(out, estimated).await?;
            }
        }

        let inner = run_agent(self.loop_config(), self.current_context().messages);
        match self.proxy(inner, out, compaction.enabled, false).await? {
            ProxyOutcome::Completed => Ok(()),
            ProxyOutcome::ContextOverflow => {
                // Reactive path: the provider rejected the context outright.
                // Compact and re-invoke the loop exactly once.
                let estimated = estimate_tokens(&self.current_context().messages);
                debug!(estimated, "reactive compaction after context overflow");
                self.compact(out, estimated).await?;
                let inner = run_agent(self.loop_config(), self.current_context().messages);
                self.proxy(inner, out, false, true).await?;
                Ok(())
            }
        }
    }

    /// Forward inner agent events to the outer stream, persisting assistant
    /// messages and tool results as they finalize.  When `allow_reactive`,
    /// a fatal error that reads like a context overflow is swallowed and
    /// reported to the caller instead of being forwarded.
    ///
    /// `resumed` marks the re-invoked loop after reactive compaction: its
    /// leading `agent_start`/busy events are suppressed so outer consumers
    /// see exactly one agent lifecycle.
    async fn proxy(
        &self,
        inner: AgentStream,
        out: &AgentStream,
        allow_reactive: bool,
        resumed: bool,
    ) -> anyhow::Result<ProxyOutcome> {
        let mut suppress_prefix = resumed;
        while let Some(event) = inner.next().await {
            if suppress_prefix {
                match &event {
                    AgentEvent::AgentStart | AgentEvent::StatusChange { .. } => continue,
                    _ => suppress_prefix = false,
                }
            }
            match &event {
                AgentEvent::Error { error, fatal: true }
                    if allow_reactive && looks_like_context_overflow(&error.message) =>
                {
                    // Drain the inner stream's trailing status/agent_end
                    // without forwarding; the re-invoked loop will produce
                    // the real terminal.
                    while inner.next().await.is_some() {}
                    return Ok(ProxyOutcome::ContextOverflow);
                }
                AgentEvent::MessageEnd { message, .. } => {
                    self.append_entry(EntryBody::Message {
                        message: Message::Assistant(message.clone()),
                    })
                    .await?;
                }
                AgentEvent::TurnEnd { tool_results, .. } => {
                    for tr in tool_results {
                        self.append_entry(EntryBody::Message {
                            message: Message::ToolResult(tr.clone()),
                        })
                        .await?;
                    }
                }
                _ => {}
            }
            out.push(event);
        }
        Ok(ProxyOutcome::Completed)
    }

    /// Summarize the stale prefix of the current path and append the
    /// compaction entry.  No-op when the path has no viable cut point.
    async fn compact(&self, out: &AgentStream, estimated: usize) -> anyhow::Result<()> {
        let (to_summarize, first_kept, prior_summary, prior_details, tokens_before, kept_ids) = {
            let state = self.state.lock().unwrap();
            let path = linear_path(&state.entries, state.leaf_id.as_deref());
            let Some(plan) = select_cut_point(&path, self.config.compaction.keep_recent_tokens)
            else {
                debug!("no viable compaction cut point; skipping");
                return Ok(());
            };
            let messages: Vec<Message> = plan
                .to_summarize
                .iter()
                .filter_map(|e| match &e.body {
                    EntryBody::Message { message } => Some(message.clone()),
                    EntryBody::Steering { message, .. } => Some(Message::user(message.clone())),
                    _ => None,
                })
                .collect();
            let first_kept = plan.to_keep[0].id.clone();
            let prior_summary = plan.prior.map(|(s, _)| s.to_string());
            let prior_details = plan.prior.map(|(_, d)| d.clone());
            let tokens_before = estimate_tokens(&build_context(
                &state.entries,
                state.leaf_id.as_deref(),
            ).messages);
            let kept_ids: Vec<String> = plan.to_keep.iter().map(|e| e.id.clone()).collect();
            (messages, first_kept, prior_summary, prior_details, tokens_before, kept_ids)
        };

        out.push(AgentEvent::CompactionStart {
            estimated_tokens: estimated,
        });

        let cancel = self.state.lock().unwrap().cancel.clone();
        let summary = summarize(
            Arc::clone(&self.provider),
            &self.model,
            &to_summarize,
            prior_summary.as_deref(),
            cancel,
        )
        .await?;

        let details = accumulate_file_ops(&to_summarize, prior_details.as_ref());
        let (tokens_after, entry) = {
            let state = self.state.lock().unwrap();
            let kept: Vec<&SessionEntry> = state
                .entries
                .iter()
                .filter(|e| kept_ids.contains(&e.id))
                .collect();
            let tokens_after = estimate_after(&summary, &details, &kept);
            let entry = compaction_entry(
                state.leaf_id.clone(),
                summary.clone(),
                first_kept,
                tokens_before,
                tokens_after,
                details,
            );
            (tokens_after, entry)
        };

        // Append through the normal path so the entry becomes the new leaf
        // and the write is chained in order.
        {
            let mut state = self.state.lock().unwrap();
            state.leaf_id = Some(entry.id.clone());
            state.entries.push(entry.clone());
        }
        self.writer.lock().await.append(&entry).await?;

        out.push(AgentEvent::CompactionEnd {
            tokens_before,
            tokens_after,
            summary,
        });
        Ok(())
    }

    /// Record the active provider+model when the path disagrees (fresh
    /// sessions, resumes under a different config).
    async fn ensure_model_entry(&self) -> anyhow::Result<()> {
        let current = self.current_context().current_model;
        let provider_name = self.provider.name().to_string();
        let up_to_date = current
            .map(|m| m.provider == provider_name && m.model_id == self.model)
            .unwrap_or(false);
        if !up_to_date {
            self.append_entry(EntryBody::ModelChange {
                provider: provider_name,
                model_id: self.model.clone(),
            })
            .await?;
        }
        Ok(())
    }

    fn loop_config(&self) -> AgentLoopConfig {
        let steering = Arc::clone(&self.steering);
        let (mode, cancel) = {
            let state = self.state.lock().unwrap();
            (state.mode, state.cancel.clone())
        };
        let base_prompt = prompts::system_prompt(
            AgentMode::Default,
            self.config.system_prompt.as_deref(),
            &self.config.instructions,
        );
        let mut cfg = AgentLoopConfig::new(
            &self.model,
            Arc::clone(&self.provider),
            Arc::clone(&self.tools),
        );
        cfg.system_prompt = base_prompt;
        cfg.cancel = cancel;
        cfg.max_turns = self.config.max_turns;
        cfg.retry = RetryPolicy {
            max_attempts: self.config.max_retries,
            ..RetryPolicy::default()
        };
        cfg.mode = mode;
        cfg.approve = self.approve.clone();
        cfg.steering = Some(Arc::new(move || {
            std::mem::take(&mut *steering.lock().unwrap())
        }));
        cfg
    }
}

enum ProxyOutcome {
    Completed,
    ContextOverflow,
}

// Scenario coverage for the manager (run, steering, proactive and reactive
// compaction) lives in `tests.rs`.

#[cfg(test)]
mod tests {
    use super::*;
    use diligent_model::ScriptedProvider;

    fn manager(dir: &std::path::Path) -> SessionManager {
        let provider = Arc::new(ScriptedProvider::always_text("ok"));
        SessionManager::create(
            Config::default(),
            provider,
            "mock-model",
            Arc::new(ToolRegistry::new()),
            dir,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn create_initializes_layout_without_session_file() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        assert!(m.paths().sessions_dir().is_dir());
        assert!(SessionManager::list(dir.path()).is_empty(), "no file before first reply");
    }

    #[tokio::test]
    async fn append_entry_advances_the_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let a = m
            .append_entry(EntryBody::Message {
                message: Message::user("one"),
            })
            .await
            .unwrap();
        let b = m
            .append_entry(EntryBody::Message {
                message: Message::user("two"),
            })
            .await
            .unwrap();
        let entries = m.entries();
        assert_eq!(entries[0].parent_id, None);
        assert_eq!(entries[1].parent_id, Some(a));
        assert_eq!(m.state.lock().unwrap().leaf_id, Some(b));
    }

    #[tokio::test]
    async fn follow_up_without_active_run_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        m.follow_up("also do this").await.unwrap();
        assert!(m.has_follow_up());
        assert_eq!(m.take_follow_ups(), vec!["also do this"]);
        assert!(!m.has_follow_up());
    }

    #[tokio::test]
    async fn mode_change_updates_state_and_appends_entry() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        m.append_mode_change(AgentMode::Plan, ModeChangedBy::Cli)
            .await
            .unwrap();
        assert_eq!(m.mode(), AgentMode::Plan);
        assert!(m
            .entries()
            .iter()
            .any(|e| matches!(e.body, EntryBody::ModeChange { mode: AgentMode::Plan, .. })));
    }

    #[tokio::test]
    async fn resume_fails_on_missing_session() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::always_text("ok"));
        let result = SessionManager::resume(
            Config::default(),
            provider,
            "mock-model",
            Arc::new(ToolRegistry::new()),
            dir.path(),
            Some("20990101000000-ffffff"),
        );
        assert!(result.is_err());
    }
}
