// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use diligent_config::AgentMode;
use diligent_model::Message;

/// One persisted line of a session file (after the header).
///
/// Entries form a forest via `parent_id`: appending never rewrites, so a
/// fork is just a second child of the same parent.  In the common case the
/// chain is linear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    /// 8 lowercase hex chars, freshly generated.
    pub id: String,
    #[serde(rename = "parentId")]
    pub parent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub body: EntryBody,
}

impl SessionEntry {
    pub fn new(parent_id: Option<String>, body: EntryBody) -> Self {
        Self {
            id: generate_entry_id(),
            parent_id,
            timestamp: Utc::now(),
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EntryBody {
    /// A conversation message (any role).
    Message { message: Message },
    /// The active provider+model changed.
    ModelChange { provider: String, model_id: String },
    /// Optional display name for session listings.
    SessionInfo { name: Option<String> },
    /// A compaction checkpoint; `first_kept_entry_id` marks where the
    /// post-summary slice of the path begins.
    Compaction {
        summary: String,
        first_kept_entry_id: String,
        tokens_before: usize,
        tokens_after: usize,
        details: CompactionDetails,
    },
    ModeChange { mode: AgentMode, changed_by: ModeChangedBy },
    /// Out-of-band user input injected mid-run.
    Steering { message: String, source: SteeringSource },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionDetails {
    pub read_files: Vec<String>,
    pub modified_files: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeChangedBy {
    Cli,
    Command,
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SteeringSource {
    Steer,
    FollowUp,
}

/// Fresh 8-hex-char entry id.
pub fn generate_entry_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Fresh session id: `YYYYMMDDHHMMSS-<6hex>`.
pub fn generate_session_id(now: DateTime<Utc>) -> String {
    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..6];
    format!("{}-{}", now.format("%Y%m%d%H%M%S"), suffix)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_ids_are_eight_hex_chars() {
        for _ in 0..20 {
            let id = generate_entry_id();
            assert_eq!(id.len(), 8);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn entry_ids_are_unique() {
        let a = generate_entry_id();
        let b = generate_entry_id();
        assert_ne!(a, b);
    }

    #[test]
    fn session_id_has_timestamp_prefix_and_hex_suffix() {
        let now = "2026-08-01T12:34:56Z".parse::<DateTime<Utc>>().unwrap();
        let id = generate_session_id(now);
        assert!(id.starts_with("20260801123456-"));
        let suffix = id.split('-').nth(1).unwrap();
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn message_entry_serializes_with_flat_envelope() {
        let e = SessionEntry::new(None, EntryBody::Message {
            message: Message::user("hello"),
        });
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "message");
        assert_eq!(v["parentId"], serde_json::Value::Null);
        assert_eq!(v["message"]["role"], "user");
        assert!(v["id"].is_string());
        assert!(v["timestamp"].is_string());
    }

    #[test]
    fn compaction_entry_uses_camel_case_fields() {
        let e = SessionEntry::new(
            Some("aabbccdd".into()),
            EntryBody::Compaction {
                summary: "sum".into(),
                first_kept_entry_id: "11223344".into(),
                tokens_before: 1000,
                tokens_after: 100,
                details: CompactionDetails {
                    read_files: vec!["a.rs".into()],
                    modified_files: vec![],
                },
            },
        );
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "compaction");
        assert_eq!(v["firstKeptEntryId"], "11223344");
        assert_eq!(v["tokensBefore"], 1000);
        assert_eq!(v["details"]["readFiles"][0], "a.rs");
    }

    #[test]
    fn entry_round_trips_through_json() {
        let entries = vec![
            SessionEntry::new(None, EntryBody::Message {
                message: Message::user("q"),
            }),
            SessionEntry::new(
                Some("00000000".into()),
                EntryBody::ModelChange {
                    provider: "anthropic".into(),
                    model_id: "claude-sonnet-4-5".into(),
                },
            ),
            SessionEntry::new(
                Some("00000001".into()),
                EntryBody::Steering {
                    message: "[Steering] focus".into(),
                    source: SteeringSource::Steer,
                },
            ),
            SessionEntry::new(
                Some("00000002".into()),
                EntryBody::ModeChange {
                    mode: AgentMode::Plan,
                    changed_by: ModeChangedBy::Cli,
                },
            ),
        ];
        for e in entries {
            let line = serde_json::to_string(&e).unwrap();
            let back: SessionEntry = serde_json::from_str(&line).unwrap();
            assert_eq!(back, e);
        }
    }

    #[test]
    fn steering_source_tags_are_snake_case() {
        let e = SessionEntry::new(None, EntryBody::Steering {
            message: "m".into(),
            source: SteeringSource::FollowUp,
        });
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["source"], "follow_up");
    }
}
