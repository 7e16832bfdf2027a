// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, HashSet};

use tracing::warn;

use diligent_model::Message;

use crate::entry::{CompactionDetails, EntryBody, SessionEntry};

/// The provider+model pair active at the end of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub provider: String,
    pub model_id: String,
}

/// A linear conversation reconstructed from the entry tree.
#[derive(Debug, Clone, Default)]
pub struct BuiltContext {
    pub messages: Vec<Message>,
    pub current_model: Option<ModelRef>,
}

/// Select the leaf-to-root chain and return it in chronological order.
///
/// The leaf is the entry with `leaf_id`, or the last entry when no leaf is
/// given.  Branches that are not on this chain are ignored: they stay on
/// disk, but the runtime never reconciles them.  A cycle (corrupt file)
/// terminates the walk with a warning instead of spinning.
pub fn linear_path<'a>(
    entries: &'a [SessionEntry],
    leaf_id: Option<&str>,
) -> Vec<&'a SessionEntry> {
    let by_id: HashMap<&str, &SessionEntry> =
        entries.iter().map(|e| (e.id.as_str(), e)).collect();
    let leaf = match leaf_id {
        Some(id) => by_id.get(id).copied(),
        None => entries.last(),
    };
    let Some(leaf) = leaf else {
        return Vec::new();
    };

    let mut path = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut cursor = Some(leaf);
    while let Some(entry) = cursor {
        if !seen.insert(entry.id.as_str()) {
            warn!(entry_id = %entry.id, "cycle in session parent chain; truncating path");
            break;
        }
        path.push(entry);
        cursor = entry
            .parent_id
            .as_deref()
            .and_then(|pid| by_id.get(pid).copied());
    }
    path.reverse();
    path
}

/// Rebuild the conversation for the given leaf.
///
/// When the path contains a compaction entry, everything before its
/// `first_kept_entry_id` is replaced by a synthetic summary message; the
/// kept slice (which precedes the compaction entry on the path) and
/// everything after the compaction entry are replayed verbatim.
pub fn build_context(entries: &[SessionEntry], leaf_id: Option<&str>) -> BuiltContext {
    let path = linear_path(entries, leaf_id);
    let mut ctx = BuiltContext::default();

    // Most recent compaction wins; older ones are already folded into it.
    let compaction_index = path
        .iter()
        .rposition(|e| matches!(e.body, EntryBody::Compaction { .. }));

    let replay_from = match compaction_index {
        Some(k) => {
            if let EntryBody::Compaction {
                summary,
                details,
                first_kept_entry_id,
                ..
            } = &path[k].body
            {
                ctx.messages.push(summary_message(summary, details));
                // The post-summary slice begins at the recorded kept entry.
                // A kept id not on this path (foreign branch) degrades to
                // replaying only what follows the compaction entry.
                path.iter()
                    .position(|e| &e.id == first_kept_entry_id)
                    .unwrap_or(k + 1)
            } else {
                k + 1
            }
        }
        None => 0,
    };

    for (i, entry) in path.iter().enumerate().skip(replay_from) {
        // Skip the compaction entry itself within the kept slice.
        if Some(i) == compaction_index {
            continue;
        }
        match &entry.body {
            EntryBody::Message { message } => ctx.messages.push(message.clone()),
            EntryBody::Steering { message, .. } => {
                ctx.messages.push(Message::user(message.clone()));
            }
            EntryBody::ModelChange { provider, model_id } => {
                ctx.current_model = Some(ModelRef {
                    provider: provider.clone(),
                    model_id: model_id.clone(),
                });
            }
            // Structural entries contribute nothing to the conversation.
            EntryBody::Compaction { .. }
            | EntryBody::SessionInfo { .. }
            | EntryBody::ModeChange { .. } => {}
        }
    }

    // model_change entries before the compaction cut still bind.
    if ctx.current_model.is_none() {
        for entry in path[..replay_from.min(path.len())].iter().rev() {
            if let EntryBody::ModelChange { provider, model_id } = &entry.body {
                ctx.current_model = Some(ModelRef {
                    provider: provider.clone(),
                    model_id: model_id.clone(),
                });
                break;
            }
        }
    }

    ctx
}

/// The synthetic first user message standing in for compacted history.
pub fn summary_message(summary: &str, details: &CompactionDetails) -> Message {
    let mut text = format!("[Session Summary]\n{summary}");
    if !details.read_files.is_empty() {
        text.push_str("\n\n## Files Read\n");
        for f in &details.read_files {
            text.push_str(&format!("- {f}\n"));
        }
    }
    if !details.modified_files.is_empty() {
        text.push_str("\n\n## Files Modified\n");
        for f in &details.modified_files {
            text.push_str(&format!("- {f}\n"));
        }
    }
    Message::user(text)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{ModeChangedBy, SteeringSource};
    use diligent_config::AgentMode;

    fn msg_entry(parent: Option<&str>, text: &str) -> SessionEntry {
        SessionEntry::new(parent.map(String::from), EntryBody::Message {
            message: Message::user(text),
        })
    }

    fn chain(texts: &[&str]) -> Vec<SessionEntry> {
        let mut out: Vec<SessionEntry> = Vec::new();
        for t in texts {
            let parent = out.last().map(|e: &SessionEntry| e.id.as_str());
            out.push(msg_entry(parent, t));
        }
        out
    }

    // ── Path selection ────────────────────────────────────────────────────────

    #[test]
    fn empty_entries_build_empty_context() {
        let ctx = build_context(&[], None);
        assert!(ctx.messages.is_empty());
        assert!(ctx.current_model.is_none());
    }

    #[test]
    fn default_leaf_is_last_entry() {
        let entries = chain(&["a", "b", "c"]);
        let ctx = build_context(&entries, None);
        let texts: Vec<_> = ctx.messages.iter().filter_map(|m| m.as_user_text()).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[test]
    fn explicit_leaf_selects_its_branch() {
        // a → b, and a → b2 (fork).  Leaf b2 must not include b.
        let a = msg_entry(None, "a");
        let b = msg_entry(Some(&a.id), "b");
        let b2 = msg_entry(Some(&a.id), "b2");
        let entries = vec![a, b, b2.clone()];
        let ctx = build_context(&entries, Some(&b2.id));
        let texts: Vec<_> = ctx.messages.iter().filter_map(|m| m.as_user_text()).collect();
        assert_eq!(texts, vec!["a", "b2"]);
    }

    #[test]
    fn unknown_leaf_id_yields_empty_context() {
        let entries = chain(&["a"]);
        let ctx = build_context(&entries, Some("ffffffff"));
        assert!(ctx.messages.is_empty());
    }

    #[test]
    fn cycle_terminates_instead_of_spinning() {
        let mut a = msg_entry(None, "a");
        let b = msg_entry(Some(&a.id), "b");
        a.parent_id = Some(b.id.clone());
        let entries = vec![a, b];
        // Must return, not hang.
        let path = linear_path(&entries, None);
        assert!(path.len() <= 2);
    }

    #[test]
    fn linear_path_has_no_duplicate_ids() {
        let entries = chain(&["a", "b", "c", "d"]);
        let path = linear_path(&entries, None);
        let mut ids: Vec<_> = path.iter().map(|e| e.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }

    // ── Replay ────────────────────────────────────────────────────────────────

    #[test]
    fn steering_entries_contribute_user_messages() {
        let a = msg_entry(None, "a");
        let s = SessionEntry::new(Some(a.id.clone()), EntryBody::Steering {
            message: "[Steering] change focus".into(),
            source: SteeringSource::Steer,
        });
        let ctx = build_context(&[a, s], None);
        assert_eq!(ctx.messages.len(), 2);
        assert_eq!(ctx.messages[1].as_user_text(), Some("[Steering] change focus"));
    }

    #[test]
    fn model_change_updates_current_model() {
        let a = msg_entry(None, "a");
        let m = SessionEntry::new(Some(a.id.clone()), EntryBody::ModelChange {
            provider: "anthropic".into(),
            model_id: "claude-opus-4-6".into(),
        });
        let ctx = build_context(&[a, m], None);
        assert_eq!(
            ctx.current_model,
            Some(ModelRef {
                provider: "anthropic".into(),
                model_id: "claude-opus-4-6".into()
            })
        );
        assert_eq!(ctx.messages.len(), 1, "model_change is not a message");
    }

    #[test]
    fn mode_change_entries_are_ignored_in_replay() {
        let a = msg_entry(None, "a");
        let m = SessionEntry::new(Some(a.id.clone()), EntryBody::ModeChange {
            mode: AgentMode::Plan,
            changed_by: ModeChangedBy::Cli,
        });
        let ctx = build_context(&[a, m], None);
        assert_eq!(ctx.messages.len(), 1);
    }

    // ── Compaction injection ──────────────────────────────────────────────────

    fn compaction_entry(parent: &str, summary: &str, kept: &str) -> SessionEntry {
        SessionEntry::new(Some(parent.to_string()), EntryBody::Compaction {
            summary: summary.into(),
            first_kept_entry_id: kept.into(),
            tokens_before: 100,
            tokens_after: 10,
            details: CompactionDetails {
                read_files: vec!["src/lib.rs".into()],
                modified_files: vec!["src/main.rs".into()],
            },
        })
    }

    #[test]
    fn compaction_replaces_summarized_prefix_and_keeps_the_rest() {
        let mut entries = chain(&["old1", "old2", "recent"]);
        // "recent" is the first kept entry; old1/old2 are summarized away.
        let c = compaction_entry(&entries[2].id, "the work so far", &entries[2].id);
        let after = msg_entry(Some(&c.id), "after");
        entries.push(c);
        entries.push(after);

        let ctx = build_context(&entries, None);
        let texts: Vec<_> = ctx.messages.iter().filter_map(|m| m.as_user_text()).collect();
        assert_eq!(texts.len(), 3, "summary + kept slice + post-compaction entries");
        assert!(texts[0].starts_with("[Session Summary]\nthe work so far"));
        assert_eq!(texts[1], "recent");
        assert_eq!(texts[2], "after");
        assert!(!texts.iter().any(|t| t.contains("old1")));
    }

    #[test]
    fn summary_message_lists_file_details() {
        let details = CompactionDetails {
            read_files: vec!["a.rs".into(), "b.rs".into()],
            modified_files: vec!["c.rs".into()],
        };
        let m = summary_message("sum", &details);
        let text = m.as_user_text().unwrap();
        assert!(text.contains("## Files Read"));
        assert!(text.contains("- a.rs"));
        assert!(text.contains("## Files Modified"));
        assert!(text.contains("- c.rs"));
    }

    #[test]
    fn summary_message_omits_empty_sections() {
        let m = summary_message("sum", &CompactionDetails::default());
        let text = m.as_user_text().unwrap();
        assert!(!text.contains("## Files Read"));
        assert!(!text.contains("## Files Modified"));
    }

    #[test]
    fn latest_compaction_wins_over_older_ones() {
        let mut entries = chain(&["one"]);
        let c1 = compaction_entry(&entries[0].id, "first summary", &entries[0].id);
        let mid = msg_entry(Some(&c1.id), "mid");
        let c2 = compaction_entry(&mid.id, "second summary", &mid.id);
        let tail = msg_entry(Some(&c2.id), "tail");
        entries.extend([c1, mid, c2, tail]);

        let ctx = build_context(&entries, None);
        let texts: Vec<_> = ctx.messages.iter().filter_map(|m| m.as_user_text()).collect();
        assert!(texts[0].contains("second summary"));
        assert!(!texts[0].contains("first summary"));
        assert_eq!(texts[1..], ["mid", "tail"]);
    }

    #[test]
    fn model_change_before_compaction_still_binds() {
        let a = msg_entry(None, "a");
        let m = SessionEntry::new(Some(a.id.clone()), EntryBody::ModelChange {
            provider: "openai".into(),
            model_id: "gpt-4o".into(),
        });
        let c = compaction_entry(&m.id, "sum", &m.id);
        let tail = msg_entry(Some(&c.id), "tail");
        let ctx = build_context(&[a, m, c, tail], None);
        assert_eq!(ctx.current_model.unwrap().model_id, "gpt-4o");
    }
}
