// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use diligent_model::Message;

use crate::entry::{EntryBody, SessionEntry};

/// Highest session-file version this build can read.  Files written by a
/// newer build are rejected rather than half-parsed.
pub const SESSION_FILE_VERSION: u32 = 1;

/// First line of every session file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHeader {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: u32,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_session: Option<String>,
}

impl SessionHeader {
    pub fn new(id: impl Into<String>, cwd: impl Into<String>) -> Self {
        Self {
            kind: "session".into(),
            version: SESSION_FILE_VERSION,
            id: id.into(),
            timestamp: Utc::now(),
            cwd: cwd.into(),
            parent_session: None,
        }
    }
}

/// Read and validate one session file.
///
/// The header is strict (wrong type or a newer version is an error);
/// entry lines are tolerant: a malformed line is skipped with a warning so
/// one bad write does not strand a whole session.
pub fn read_session(path: &Path) -> anyhow::Result<(SessionHeader, Vec<SessionEntry>)> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());

    let header_line = lines.next().context("session file is empty")?;
    let header: SessionHeader =
        serde_json::from_str(header_line).context("parsing session header")?;
    if header.kind != "session" {
        bail!("not a session file (type = {:?})", header.kind);
    }
    if header.version > SESSION_FILE_VERSION {
        bail!(
            "session file version {} is newer than supported version {}",
            header.version,
            SESSION_FILE_VERSION
        );
    }

    let mut entries = Vec::new();
    for line in lines {
        match serde_json::from_str::<SessionEntry>(line) {
            Ok(e) => entries.push(e),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping malformed session entry");
            }
        }
    }
    Ok((header, entries))
}

/// Summary row for session listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub cwd: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub message_count: usize,
    pub first_user_message: Option<String>,
}

/// Enumerate sessions in a directory, most recently modified first.
/// Corrupt files are skipped with a warning.
pub fn list_sessions(sessions_dir: &Path) -> Vec<SessionSummary> {
    let Ok(read_dir) = std::fs::read_dir(sessions_dir) else {
        return Vec::new();
    };
    let mut summaries: Vec<SessionSummary> = Vec::new();
    for entry in read_dir.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let (header, entries) = match read_session(&path) {
            Ok(ok) => ok,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping corrupt session file");
                continue;
            }
        };
        let modified = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from)
            .unwrap_or(header.timestamp);
        let message_count = entries
            .iter()
            .filter(|e| matches!(e.body, EntryBody::Message { .. }))
            .count();
        let first_user_message = entries.iter().find_map(|e| match &e.body {
            EntryBody::Message { message } => message.as_user_text().map(truncate_preview),
            _ => None,
        });
        summaries.push(SessionSummary {
            id: header.id,
            cwd: header.cwd,
            created: header.timestamp,
            modified,
            message_count,
            first_user_message,
        });
    }
    summaries.sort_by(|a, b| b.modified.cmp(&a.modified));
    summaries
}

fn truncate_preview(text: &str) -> String {
    if text.chars().count() <= 100 {
        text.to_string()
    } else {
        text.chars().take(100).collect()
    }
}

/// Find a session file by id, or the most recently modified one.
pub fn find_session_file(
    sessions_dir: &Path,
    session_id: Option<&str>,
) -> anyhow::Result<PathBuf> {
    if let Some(id) = session_id {
        let path = sessions_dir.join(format!("{id}.jsonl"));
        if !path.is_file() {
            bail!("no session with id {id}");
        }
        return Ok(path);
    }
    let latest = list_sessions(sessions_dir)
        .into_iter()
        .next()
        .context("no sessions to resume")?;
    Ok(sessions_dir.join(format!("{}.jsonl", latest.id)))
}

// ─── Deferred writer ──────────────────────────────────────────────────────────

/// Append-only session writer with deferred materialization.
///
/// The file is only created once the first assistant message is appended:
/// an invocation that is abandoned before the model ever answers leaves no
/// file behind.  Until then the header and every entry are buffered in
/// memory and flushed together.
pub struct DeferredWriter {
    path: PathBuf,
    header: SessionHeader,
    materialized: bool,
    buffered: Vec<String>,
}

impl DeferredWriter {
    pub fn new(sessions_dir: &Path, header: SessionHeader) -> Self {
        let path = sessions_dir.join(format!("{}.jsonl", header.id));
        Self {
            path,
            header,
            materialized: false,
            buffered: Vec::new(),
        }
    }

    /// Writer for a resumed session: the file already exists and is flushed.
    pub fn resumed(path: PathBuf, header: SessionHeader) -> Self {
        Self {
            path,
            header,
            materialized: true,
            buffered: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_materialized(&self) -> bool {
        self.materialized
    }

    /// Append one entry, materializing the file first if this entry proves a
    /// real session exists (the first assistant message).
    pub async fn append(&mut self, entry: &SessionEntry) -> anyhow::Result<()> {
        let line = serde_json::to_string(entry).context("serializing session entry")?;
        let is_assistant = matches!(
            &entry.body,
            EntryBody::Message { message: Message::Assistant(_) }
        );
        if !self.materialized {
            self.buffered.push(line);
            if is_assistant {
                self.materialize().await?;
            }
            return Ok(());
        }
        self.append_raw(&format!("{line}\n")).await
    }

    async fn materialize(&mut self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut content =
            serde_json::to_string(&self.header).context("serializing session header")?;
        content.push('\n');
        for line in self.buffered.drain(..) {
            content.push_str(&line);
            content.push('\n');
        }
        tokio::fs::write(&self.path, content)
            .await
            .with_context(|| format!("writing {}", self.path.display()))?;
        self.materialized = true;
        Ok(())
    }

    async fn append_raw(&self, chunk: &str) -> anyhow::Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;
        file.write_all(chunk.as_bytes())
            .await
            .with_context(|| format!("appending to {}", self.path.display()))?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
