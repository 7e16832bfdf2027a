// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    error::ProviderError,
    stream::EventStream,
    types::{AssistantMessage, ContentBlock, Message, StopReason, TokenUsage, ToolSchema},
};

/// One model call as seen by a driver.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: String,
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Observed mid-network; a cancelled request terminates with a
    /// synthesised non-retryable error.
    pub cancel: CancellationToken,
}

impl ProviderRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            system_prompt: String::new(),
            messages,
            tools: Vec::new(),
            max_tokens: None,
            temperature: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Terminal value of a provider stream.
#[derive(Debug, Clone)]
pub struct ProviderResult {
    pub message: AssistantMessage,
}

/// Uniform streaming event emitted by every driver.
///
/// Between `Start` and `Done`/`Error`, deltas reflect the final message's
/// content blocks in order: each block begins with its start (tool calls) or
/// first delta (text/thinking) and is closed by its end event before the next
/// block begins.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    Start,
    TextDelta { delta: String },
    TextEnd { text: String },
    ThinkingDelta { delta: String },
    ThinkingEnd { thinking: String },
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: String, delta: String },
    ToolCallEnd { id: String, name: String, input: Value },
    Usage { usage: TokenUsage },
    Done { stop_reason: StopReason, message: AssistantMessage },
    Error { error: ProviderError },
}

pub type ProviderStream = EventStream<ProviderEvent, ProviderResult>;

/// Construct a provider stream whose terminal transition is `Done`/`Error`.
pub fn provider_stream() -> ProviderStream {
    EventStream::new(
        |e| matches!(e, ProviderEvent::Done { .. } | ProviderEvent::Error { .. }),
        |e| match e {
            ProviderEvent::Done { message, .. } => Ok(ProviderResult {
                message: message.clone(),
            }),
            ProviderEvent::Error { error } => Err(error.clone().into()),
            _ => anyhow::bail!("non-terminal event reached extract"),
        },
    )
}

/// A model provider.  `stream` returns immediately; the driver pushes events
/// from a spawned task so the caller can consume, observe, and await the
/// terminal result concurrently.
pub trait Provider: Send + Sync {
    /// Vendor name for status display and logs.
    fn name(&self) -> &str;

    fn stream(&self, req: ProviderRequest) -> ProviderStream;
}

// ─── Message assembly ─────────────────────────────────────────────────────────

/// Incremental assembler shared by the drivers.
///
/// Vendor SSE parsers feed deltas in arrival order; the assembler maintains
/// the current in-progress block, closes it with the proper `*End` event when
/// the block type changes, and produces the fully-assembled
/// [`AssistantMessage`] for the terminal `Done` event.  This is what keeps
/// the block-ordering invariant uniform across vendors.
pub struct MessageAssembler {
    model: String,
    blocks: Vec<ContentBlock>,
    usage: TokenUsage,
    current: Option<Current>,
}

enum Current {
    Text(String),
    Thinking(String),
    Tool { id: String, name: String, args: String },
}

impl MessageAssembler {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            blocks: Vec::new(),
            usage: TokenUsage::default(),
            current: None,
        }
    }

    fn close_current(&mut self, out: &mut Vec<ProviderEvent>) {
        match self.current.take() {
            None => {}
            Some(Current::Text(text)) => {
                out.push(ProviderEvent::TextEnd { text: text.clone() });
                self.blocks.push(ContentBlock::Text { text });
            }
            Some(Current::Thinking(thinking)) => {
                out.push(ProviderEvent::ThinkingEnd {
                    thinking: thinking.clone(),
                });
                self.blocks.push(ContentBlock::Thinking { thinking });
            }
            Some(Current::Tool { id, name, args }) => {
                let input = parse_tool_args(&id, &name, &args);
                out.push(ProviderEvent::ToolCallEnd {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                });
                self.blocks.push(ContentBlock::ToolCall { id, name, input });
            }
        }
    }

    pub fn text_delta(&mut self, delta: &str) -> Vec<ProviderEvent> {
        let mut out = Vec::new();
        if delta.is_empty() {
            return out;
        }
        if !matches!(self.current, Some(Current::Text(_))) {
            self.close_current(&mut out);
            self.current = Some(Current::Text(String::new()));
        }
        if let Some(Current::Text(buf)) = &mut self.current {
            buf.push_str(delta);
        }
        out.push(ProviderEvent::TextDelta {
            delta: delta.to_string(),
        });
        out
    }

    pub fn thinking_delta(&mut self, delta: &str) -> Vec<ProviderEvent> {
        let mut out = Vec::new();
        if delta.is_empty() {
            return out;
        }
        if !matches!(self.current, Some(Current::Thinking(_))) {
            self.close_current(&mut out);
            self.current = Some(Current::Thinking(String::new()));
        }
        if let Some(Current::Thinking(buf)) = &mut self.current {
            buf.push_str(delta);
        }
        out.push(ProviderEvent::ThinkingDelta {
            delta: delta.to_string(),
        });
        out
    }

    pub fn tool_call_start(&mut self, id: &str, name: &str) -> Vec<ProviderEvent> {
        let mut out = Vec::new();
        self.close_current(&mut out);
        self.current = Some(Current::Tool {
            id: id.to_string(),
            name: name.to_string(),
            args: String::new(),
        });
        out.push(ProviderEvent::ToolCallStart {
            id: id.to_string(),
            name: name.to_string(),
        });
        out
    }

    /// Append a fragment of the in-progress tool call's JSON arguments.
    /// Fragments arriving with no open tool call are dropped with a warning
    /// (seen when a vendor omits the block-start frame).
    pub fn tool_call_delta(&mut self, delta: &str) -> Vec<ProviderEvent> {
        match &mut self.current {
            Some(Current::Tool { id, args, .. }) => {
                args.push_str(delta);
                vec![ProviderEvent::ToolCallDelta {
                    id: id.clone(),
                    delta: delta.to_string(),
                }]
            }
            _ => {
                warn!("tool-call arguments delta with no open tool call; dropping");
                Vec::new()
            }
        }
    }

    pub fn add_usage(&mut self, usage: TokenUsage) -> Vec<ProviderEvent> {
        self.usage.add(&usage);
        vec![ProviderEvent::Usage { usage }]
    }

    /// Close the open block and produce the end events plus the terminal
    /// `Done` carrying the assembled assistant message.
    pub fn finish(mut self, stop_reason: StopReason) -> Vec<ProviderEvent> {
        let mut out = Vec::new();
        self.close_current(&mut out);
        let message = AssistantMessage {
            content: self.blocks,
            model: self.model,
            usage: self.usage,
            stop_reason,
            timestamp: chrono::Utc::now(),
        };
        out.push(ProviderEvent::Done {
            stop_reason,
            message,
        });
        out
    }
}

/// Models occasionally emit empty or syntactically broken argument JSON.
/// Substituting `{}` keeps the turn dispatchable; the tool layer will report
/// a validation error the model can react to.
fn parse_tool_args(id: &str, name: &str, args: &str) -> Value {
    if args.trim().is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str(args) {
        Ok(v @ Value::Object(_)) => v,
        Ok(other) => {
            warn!(tool_call_id = %id, tool_name = %name, "tool arguments are not an object: {other}");
            Value::Object(Default::default())
        }
        Err(e) => {
            warn!(tool_call_id = %id, tool_name = %name, error = %e, "invalid tool argument JSON; substituting {{}}");
            Value::Object(Default::default())
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
