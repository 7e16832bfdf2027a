// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use diligent_tools::{Tool, ToolContext, ToolOutput};

use crate::entry::generate_entry_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeKind {
    Pattern,
    Decision,
    Discovery,
    Preference,
    Correction,
}

impl KnowledgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pattern => "pattern",
            Self::Decision => "decision",
            Self::Discovery => "discovery",
            Self::Preference => "preference",
            Self::Correction => "correction",
        }
    }
}

/// One line of `knowledge.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: KnowledgeKind,
    pub content: String,
    /// 0.0–1.0.
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

/// Append-only JSONL knowledge store.
#[derive(Debug, Clone)]
pub struct KnowledgeStore {
    path: PathBuf,
}

impl KnowledgeStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn append(&self, record: &KnowledgeRecord) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(record).context("serializing knowledge record")?;
        line.push('\n');
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("appending to {}", self.path.display()))?;
        Ok(())
    }

    /// Load all records; malformed lines are skipped with a warning.
    pub fn load(&self) -> Vec<KnowledgeRecord> {
        let Ok(text) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        let mut records = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(r) => records.push(r),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "skipping malformed knowledge line");
                }
            }
        }
        records
    }
}

/// Format stored knowledge for injection into the system prompt, newest
/// records first, within a token budget (chars/4).  `None` when the store is
/// empty or the budget is zero.
pub fn knowledge_preamble(records: &[KnowledgeRecord], budget_tokens: u32) -> Option<String> {
    if records.is_empty() || budget_tokens == 0 {
        return None;
    }
    let budget_chars = budget_tokens as usize * 4;
    let mut lines = vec!["Project knowledge from earlier sessions:".to_string()];
    let mut used = lines[0].len();
    for record in records.iter().rev() {
        let line = format!("- [{}] {}", record.kind.as_str(), record.content);
        if used + line.len() > budget_chars {
            break;
        }
        used += line.len();
        lines.push(line);
    }
    if lines.len() == 1 {
        return None;
    }
    Some(lines.join("\n"))
}

/// Builtin tool that lets the model persist a knowledge record.  The entry id
/// is surfaced through metadata so the agent loop can emit `knowledge_saved`.
pub struct SaveKnowledgeTool {
    store: KnowledgeStore,
    session_id: Option<String>,
}

impl SaveKnowledgeTool {
    pub fn new(store: KnowledgeStore, session_id: Option<String>) -> Self {
        Self { store, session_id }
    }
}

#[async_trait]
impl Tool for SaveKnowledgeTool {
    fn name(&self) -> &str {
        "save_knowledge"
    }

    fn description(&self) -> &str {
        "Persist a durable piece of project knowledge (a pattern, decision, \
         discovery, preference, or correction) so future sessions can use it. \
         Save facts that are non-obvious and likely to matter again; do not \
         save things derivable from the code itself."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "type": {
                    "type": "string",
                    "description": "pattern | decision | discovery | preference | correction"
                },
                "content": { "type": "string", "description": "The knowledge itself" },
                "confidence": {
                    "type": "number",
                    "description": "How certain this is, 0.0-1.0 (default 0.8)"
                },
                "tags": {
                    "type": "array",
                    "description": "Optional topic tags"
                }
            },
            "required": ["type", "content"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> ToolOutput {
        let kind = match args["type"].as_str() {
            Some(s) => match serde_json::from_value::<KnowledgeKind>(json!(s)) {
                Ok(k) => k,
                Err(_) => {
                    return ToolOutput::error(format!(
                        "Error: unknown knowledge type '{s}' (expected pattern, decision, \
                         discovery, preference, or correction)"
                    ))
                }
            },
            None => return ToolOutput::error("Error: missing 'type' argument"),
        };
        let Some(content) = args["content"].as_str() else {
            return ToolOutput::error("Error: missing 'content' argument");
        };
        let confidence = args["confidence"].as_f64().unwrap_or(0.8).clamp(0.0, 1.0);
        let tags = args["tags"].as_array().map(|a| {
            a.iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect::<Vec<_>>()
        });

        let record = KnowledgeRecord {
            id: generate_entry_id(),
            timestamp: Utc::now(),
            session_id: self.session_id.clone(),
            kind,
            content: content.to_string(),
            confidence,
            supersedes: None,
            tags,
        };
        match self.store.append(&record) {
            Ok(()) => ToolOutput::ok(format!("Saved knowledge {}", record.id))
                .with_metadata("knowledge_id", json!(record.id))
                .with_metadata("knowledge_content", json!(record.content)),
            Err(e) => ToolOutput::error(format!("Error: cannot save knowledge: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
