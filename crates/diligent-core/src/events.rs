// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::Serialize;
use serde_json::Value;

use diligent_model::{
    AssistantMessage, EventStream, Message, ProviderError, TokenUsage, ToolResultMessage,
};

/// Events emitted by the agent loop.  Consumers (CLI, persistence, the debug
/// viewer) iterate or subscribe to these to drive their output.
///
/// `item_id` groups the streaming events of one assistant message or one
/// tool call; it is monotonic within a single loop invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AgentEvent {
    AgentStart,
    /// Terminal event; carries the full final conversation.
    AgentEnd {
        messages: Vec<Message>,
    },
    TurnStart {
        turn_id: String,
    },
    TurnEnd {
        turn_id: String,
        message: AssistantMessage,
        tool_results: Vec<ToolResultMessage>,
    },
    MessageStart {
        item_id: u64,
        message: AssistantMessage,
    },
    MessageDelta {
        item_id: u64,
        message: AssistantMessage,
        delta: String,
    },
    MessageEnd {
        item_id: u64,
        message: AssistantMessage,
    },
    ToolStart {
        item_id: u64,
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
    ToolUpdate {
        item_id: u64,
        tool_call_id: String,
        tool_name: String,
        partial_result: String,
    },
    ToolEnd {
        item_id: u64,
        tool_call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    StatusChange {
        status: AgentStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry: Option<RetryStatus>,
    },
    Usage {
        usage: TokenUsage,
        cost: f64,
    },
    Error {
        error: SerializedError,
        fatal: bool,
    },
    CompactionStart {
        estimated_tokens: usize,
    },
    CompactionEnd {
        tokens_before: usize,
        tokens_after: usize,
        summary: String,
    },
    KnowledgeSaved {
        knowledge_id: String,
        content: String,
    },
    LoopDetected {
        pattern_length: usize,
        tool_name: String,
    },
    SteeringInjected {
        message_count: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Busy,
    Retry,
}

/// Payload of a `status_change` with status `retry`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStatus {
    pub attempt: u32,
    pub delay_ms: u64,
    pub message: String,
}

/// Serializable form of an uncaught failure.  Surviving serialization is the
/// point: this is what crosses the `agent_end` boundary and what the session
/// manager's reactive-compaction matcher inspects.
#[derive(Debug, Clone, Serialize)]
pub struct SerializedError {
    pub message: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl SerializedError {
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        // Keep the typed kind visible when the failure is a provider error.
        let name = err
            .downcast_ref::<ProviderError>()
            .map(|pe| pe.kind().to_string())
            .unwrap_or_else(|| "error".to_string());
        Self {
            message: format!("{err:#}"),
            name,
            stack: None,
        }
    }

    pub fn from_provider(err: &ProviderError) -> Self {
        Self {
            message: err.to_string(),
            name: err.kind().to_string(),
            stack: None,
        }
    }
}

pub type AgentStream = EventStream<AgentEvent, Vec<Message>>;

/// Construct an agent event stream completing on `agent_end`.
pub fn agent_stream() -> AgentStream {
    EventStream::new(
        |e| matches!(e, AgentEvent::AgentEnd { .. }),
        |e| match e {
            AgentEvent::AgentEnd { messages } => Ok(messages.clone()),
            _ => anyhow::bail!("non-terminal event reached extract"),
        },
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
