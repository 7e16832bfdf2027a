// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Content blocks ───────────────────────────────────────────────────────────

/// A single typed block inside a message.
///
/// Tool-call inputs are kept as raw [`Value`] objects; they are validated by
/// the tool layer at dispatch time, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        /// Data URL (`data:<mime>;base64,<b64>`).
        source: String,
    },
    Thinking {
        thinking: String,
    },
    ToolCall {
        /// Opaque call id minted by the model (forwarded verbatim).
        id: String,
        name: String,
        input: Value,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn thinking(thinking: impl Into<String>) -> Self {
        Self::Thinking {
            thinking: thinking.into(),
        }
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::ToolCall {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

/// Why the model stopped emitting output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    ToolUse,
    MaxTokens,
    Error,
    Aborted,
}

/// Token accounting for one assistant message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub cache_read: u64,
    #[serde(default)]
    pub cache_write: u64,
}

impl TokenUsage {
    /// Field-wise sum, used when accumulating usage across turns.
    pub fn add(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
    }
}

/// User message content: either a plain string or a list of content blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl UserContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            Self::Blocks(_) => None,
        }
    }

    /// Character count of all text content, used by token estimation.
    pub fn text_len(&self) -> usize {
        match self {
            Self::Text(t) => t.len(),
            Self::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => text.len(),
                    ContentBlock::Thinking { thinking } => thinking.len(),
                    _ => 0,
                })
                .sum(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub content: UserContent,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    /// Model id that produced this message.
    pub model: String,
    pub usage: TokenUsage,
    pub stop_reason: StopReason,
    pub timestamp: DateTime<Utc>,
}

impl AssistantMessage {
    /// Concatenation of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// The tool-call blocks in content order.
    pub fn tool_calls(&self) -> Vec<(&str, &str, &Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolCall { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultMessage {
    /// References the `ContentBlock::ToolCall` id on the same linear path.
    pub tool_call_id: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
    pub timestamp: DateTime<Utc>,
}

/// A single message in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
    ToolResult(ToolResultMessage),
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User(UserMessage {
            content: UserContent::Text(text.into()),
            timestamp: Utc::now(),
        })
    }

    pub fn assistant(message: AssistantMessage) -> Self {
        Self::Assistant(message)
    }

    /// Plain assistant text message; used by tests and synthetic notices.
    pub fn assistant_text(model: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Assistant(AssistantMessage {
            content: vec![ContentBlock::text(text)],
            model: model.into(),
            usage: TokenUsage::default(),
            stop_reason: StopReason::EndTurn,
            timestamp: Utc::now(),
        })
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult(ToolResultMessage {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error,
            timestamp: Utc::now(),
        })
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Self::User(_))
    }

    /// Plain text of a user message, if it has the string form.
    pub fn as_user_text(&self) -> Option<&str> {
        match self {
            Self::User(u) => u.content.as_text(),
            _ => None,
        }
    }
}

// ─── Tool schemas ─────────────────────────────────────────────────────────────

/// A tool definition forwarded to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the input object.
    pub json_schema: Value,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
