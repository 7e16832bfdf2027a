// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use diligent_model::{
    ContentBlock, Message, Provider, ProviderRequest, UserContent,
};

use crate::context::summary_message;
use crate::entry::{CompactionDetails, EntryBody, SessionEntry};

// ─── Summarization prompts ────────────────────────────────────────────────────

const INITIAL_SUMMARY_PROMPT: &str = "\
You are a context compaction assistant. Summarise the conversation history \
below in a concise, information-dense way. Preserve all technical details, \
decisions, file paths, code fragments, error messages, and tool outputs that \
may matter for future work. The summary will replace the original history, \
so anything you drop is gone.";

const ITERATIVE_SUMMARY_PROMPT: &str = "\
You are a context compaction assistant. An earlier portion of this \
conversation was already summarised; that summary is given below, followed \
by the conversation that happened since. Produce ONE updated summary that \
PRESERVES the prior summary's content and integrates the new history into \
it. Keep it concise and information-dense; preserve technical details, \
decisions, file paths, and error messages.";

// ─── Token estimation ─────────────────────────────────────────────────────────

/// Approximate token count of one message: character count / 4.
///
/// Assistant messages count text and thinking blocks plus, per tool call,
/// the serialized input and the tool name.  Deliberately cheap; the reserve
/// margin absorbs the approximation error.
pub fn estimate_message_tokens(message: &Message) -> usize {
    let chars = match message {
        Message::User(u) => match &u.content {
            UserContent::Text(t) => t.len(),
            UserContent::Blocks(_) => u.content.text_len(),
        },
        Message::Assistant(a) => a
            .content
            .iter()
            .map(|b| match b {
                ContentBlock::Text { text } => text.len(),
                ContentBlock::Thinking { thinking } => thinking.len(),
                ContentBlock::ToolCall { name, input, .. } => {
                    name.len() + input.to_string().len()
                }
                ContentBlock::Image { .. } => 0,
            })
            .sum(),
        Message::ToolResult(tr) => tr.content.len(),
    };
    chars / 4
}

/// Sum of per-message estimates.  Monotonic: adding messages never lowers it.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Proactive trigger: the estimate has eaten into the reserve.
pub fn should_compact(estimated_tokens: usize, context_window: usize, reserve_tokens: usize) -> bool {
    estimated_tokens > context_window.saturating_sub(reserve_tokens)
}

// ─── Cut-point selection ──────────────────────────────────────────────────────

/// The partition produced by cut-point selection.
#[derive(Debug)]
pub struct CompactionPlan<'a> {
    /// Entries folded into the summary (pre-cut).
    pub to_summarize: Vec<&'a SessionEntry>,
    /// Entries kept verbatim (post-cut); the first is a user-role message.
    pub to_keep: Vec<&'a SessionEntry>,
    /// Prior compaction on the path, for the iterative prompt and file-op
    /// merging.
    pub prior: Option<(&'a str, &'a CompactionDetails)>,
}

/// Choose where to cut the path for compaction.
///
/// Scanning starts after the most recent prior compaction entry.  Walking
/// backward from the end, per-message token estimates accumulate until
/// `keep_recent_tokens` is reached; the cut is then snapped forward to the
/// nearest user-role message so a turn is never split.  Returns `None` when
/// there is nothing to summarize.
pub fn select_cut_point<'a>(
    path: &[&'a SessionEntry],
    keep_recent_tokens: usize,
) -> Option<CompactionPlan<'a>> {
    let prior_index = path
        .iter()
        .rposition(|e| matches!(e.body, EntryBody::Compaction { .. }));
    let prior = prior_index.and_then(|k| match &path[k].body {
        EntryBody::Compaction { summary, details, .. } => {
            Some((summary.as_str(), details))
        }
        _ => None,
    });
    let start = prior_index.map(|k| k + 1).unwrap_or(0);
    let slice = &path[start..];
    if slice.is_empty() {
        return None;
    }

    // Walk backward until the kept tail is big enough.
    let mut accumulated = 0usize;
    let mut cut = slice.len();
    for (i, entry) in slice.iter().enumerate().rev() {
        if let EntryBody::Message { message } = &entry.body {
            accumulated += estimate_message_tokens(message);
        }
        cut = i;
        if accumulated >= keep_recent_tokens {
            break;
        }
    }
    if accumulated < keep_recent_tokens {
        // The whole slice fits in the kept tail; nothing to summarize.
        return None;
    }

    // Never cut mid-turn: the kept slice must begin at a user message.
    let snapped = (cut..slice.len()).find(|i| {
        matches!(&slice[*i].body, EntryBody::Message { message } if message.is_user())
    })?;
    if snapped == 0 {
        return None;
    }

    Some(CompactionPlan {
        to_summarize: slice[..snapped].to_vec(),
        to_keep: slice[snapped..].to_vec(),
        prior,
    })
}

// ─── Summary generation ───────────────────────────────────────────────────────

/// Serialize messages into plain text for the summarization prompt.
fn serialize_history(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| match m {
            Message::User(u) => match &u.content {
                UserContent::Text(t) => format!("User: {t}"),
                UserContent::Blocks(_) => "User: [multimodal message]".to_string(),
            },
            Message::Assistant(a) => {
                let mut parts = Vec::new();
                let text = a.text();
                if !text.is_empty() {
                    parts.push(text);
                }
                for (_, name, input) in a.tool_calls() {
                    parts.push(format!("[tool_call: {name}({input})]"));
                }
                format!("Assistant: {}", parts.join(" "))
            }
            Message::ToolResult(tr) => format!("Tool: [tool_result: {}]", tr.content),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Run one tool-free model call to produce the (initial or iterative)
/// summary of `messages`.
pub async fn summarize(
    provider: Arc<dyn Provider>,
    model: &str,
    messages: &[Message],
    prior_summary: Option<&str>,
    cancel: CancellationToken,
) -> anyhow::Result<String> {
    let history = serialize_history(messages);
    let prompt = match prior_summary {
        Some(prior) => format!(
            "{ITERATIVE_SUMMARY_PROMPT}\n\n## Prior Summary\n{prior}\n\n## New History\n{history}"
        ),
        None => format!("{INITIAL_SUMMARY_PROMPT}\n\n---\n\n{history}"),
    };

    let mut req = ProviderRequest::new(model, vec![Message::user(prompt)]);
    req.cancel = cancel;
    let stream = provider.stream(req);
    let result = stream
        .result()
        .await
        .map_err(|e| anyhow::anyhow!("{e:#}"))
        .context("compaction summary call failed")?;
    let summary = result.message.text();
    if summary.trim().is_empty() {
        anyhow::bail!("compaction summary call returned no text");
    }
    debug!(chars = summary.len(), "compaction summary generated");
    Ok(summary)
}

// ─── File-op accumulation ─────────────────────────────────────────────────────

/// Collect read/modified file paths from the summarized messages, merged
/// (set union, first-seen order) with the prior compaction's lists.
///
/// Tool results are paired with the tool call of the same id to find the
/// tool name and its `path` argument.
pub fn accumulate_file_ops(messages: &[Message], prior: Option<&CompactionDetails>) -> CompactionDetails {
    let mut details = prior.cloned().unwrap_or_default();

    // Index tool calls by id so results can find their origin.
    let mut calls: std::collections::HashMap<&str, (&str, &serde_json::Value)> =
        std::collections::HashMap::new();
    for m in messages {
        if let Message::Assistant(a) = m {
            for (id, name, input) in a.tool_calls() {
                calls.insert(id, (name, input));
            }
        }
    }

    for m in messages {
        let Message::ToolResult(tr) = m else { continue };
        if tr.is_error {
            continue;
        }
        let Some((name, input)) = calls.get(tr.tool_call_id.as_str()) else {
            continue;
        };
        let Some(path) = input.get("path").and_then(|p| p.as_str()) else {
            continue;
        };
        let target = match *name {
            "read_file" => &mut details.read_files,
            "write_file" | "edit_file" => &mut details.modified_files,
            _ => continue,
        };
        if !target.iter().any(|p| p == path) {
            target.push(path.to_string());
        }
    }
    details
}

// ─── Entry construction ───────────────────────────────────────────────────────

/// Build the compaction entry to append.  `parent_id` is the current leaf;
/// the entry becomes the new leaf.
pub fn compaction_entry(
    parent_id: Option<String>,
    summary: String,
    first_kept_entry_id: String,
    tokens_before: usize,
    tokens_after: usize,
    details: CompactionDetails,
) -> SessionEntry {
    SessionEntry::new(parent_id, EntryBody::Compaction {
        summary,
        first_kept_entry_id,
        tokens_before,
        tokens_after,
        details,
    })
}

/// Token estimate of the rebuilt context after compaction: the synthetic
/// summary message plus the kept tail.
pub fn estimate_after(summary: &str, details: &CompactionDetails, kept: &[&SessionEntry]) -> usize {
    let mut messages = vec![summary_message(summary, details)];
    for e in kept {
        if let EntryBody::Message { message } = &e.body {
            messages.push(message.clone());
        }
    }
    estimate_tokens(&messages)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
