// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    error::ProviderError,
    provider::{provider_stream, MessageAssembler, Provider, ProviderEvent, ProviderRequest, ProviderStream},
    types::{ContentBlock, Message, StopReason, TokenUsage, UserContent},
};

pub struct AnthropicProvider {
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            client: reqwest::Client::new(),
        }
    }
}

impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn stream(&self, req: ProviderRequest) -> ProviderStream {
        let stream = provider_stream();
        let out = stream.clone();
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let api_key = self.api_key.clone();

        tokio::spawn(async move {
            let Some(key) = api_key else {
                out.push(ProviderEvent::Error {
                    error: ProviderError::Auth {
                        message: "no Anthropic API key configured".into(),
                    },
                });
                return;
            };

            let mut body = json!({
                "model": req.model,
                "messages": build_wire_messages(&req.messages),
                "max_tokens": req.max_tokens.unwrap_or(8192),
                "stream": true,
            });
            if let Some(t) = req.temperature {
                body["temperature"] = json!(t);
            }
            if !req.system_prompt.is_empty() {
                body["system"] = json!(req.system_prompt);
            }
            if !req.tools.is_empty() {
                let tools: Vec<Value> = req
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.json_schema,
                        })
                    })
                    .collect();
                body["tools"] = json!(tools);
            }

            debug!(model = %req.model, messages = req.messages.len(), "sending anthropic request");

            let send = client
                .post(format!("{base_url}/v1/messages"))
                .header("x-api-key", key)
                .header("anthropic-version", "2023-06-01")
                .json(&body)
                .send();
            let resp = tokio::select! {
                _ = req.cancel.cancelled() => {
                    out.push(ProviderEvent::Error { error: ProviderError::cancelled() });
                    return;
                }
                r = send => r,
            };
            let resp = match resp {
                Ok(r) => r,
                Err(e) => {
                    out.push(ProviderEvent::Error {
                        error: ProviderError::from_transport(&e),
                    });
                    return;
                }
            };

            if !resp.status().is_success() {
                let status = resp.status().as_u16();
                let retry_ms = header_string(&resp, "retry-after-ms");
                let retry_secs = header_string(&resp, "retry-after");
                let text = resp.text().await.unwrap_or_default();
                out.push(ProviderEvent::Error {
                    error: ProviderError::from_status(
                        status,
                        &text,
                        retry_ms.as_deref(),
                        retry_secs.as_deref(),
                    ),
                });
                return;
            }

            out.push(ProviderEvent::Start);
            let mut asm = MessageAssembler::new(&req.model);
            let mut stop_reason = StopReason::EndTurn;
            // SSE lines can be split across TCP chunks, so we carry a
            // remainder buffer forward.  Only complete lines are parsed.
            let mut buf = String::new();
            let mut byte_stream = resp.bytes_stream();

            loop {
                let chunk = tokio::select! {
                    _ = req.cancel.cancelled() => {
                        out.push(ProviderEvent::Error { error: ProviderError::cancelled() });
                        return;
                    }
                    c = byte_stream.next() => c,
                };
                let chunk = match chunk {
                    Some(Ok(b)) => b,
                    Some(Err(e)) => {
                        out.push(ProviderEvent::Error {
                            error: ProviderError::Network {
                                message: e.to_string(),
                            },
                        });
                        return;
                    }
                    None => break,
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let Ok(v) = serde_json::from_str::<Value>(data.trim()) else {
                        continue;
                    };
                    match parse_sse_event(&v) {
                        WireEvent::TextDelta(t) => push_all(&out, asm.text_delta(&t)),
                        WireEvent::ThinkingDelta(t) => push_all(&out, asm.thinking_delta(&t)),
                        WireEvent::ToolCallStart { id, name } => {
                            push_all(&out, asm.tool_call_start(&id, &name))
                        }
                        WireEvent::ToolCallArgs(a) => push_all(&out, asm.tool_call_delta(&a)),
                        WireEvent::Usage(u) => push_all(&out, asm.add_usage(u)),
                        WireEvent::Stop {
                            stop_reason: sr,
                            output_tokens,
                        } => {
                            if let Some(sr) = sr {
                                stop_reason = sr;
                            }
                            if output_tokens > 0 {
                                push_all(
                                    &out,
                                    asm.add_usage(TokenUsage {
                                        output: output_tokens,
                                        ..Default::default()
                                    }),
                                );
                            }
                        }
                        WireEvent::Done => {
                            push_all(&out, asm.finish(stop_reason));
                            return;
                        }
                        WireEvent::Ignore => {}
                    }
                }
            }

            // Connection closed without message_stop: finish with what we have
            // rather than leaving the stream dangling.
            warn!("anthropic stream ended without message_stop");
            push_all(&out, asm.finish(stop_reason));
        });

        stream
    }
}

fn push_all(out: &ProviderStream, events: Vec<ProviderEvent>) {
    for e in events {
        out.push(e);
    }
}

fn header_string(resp: &reqwest::Response, name: &str) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

// ─── SSE parsing ──────────────────────────────────────────────────────────────

/// One parsed frame of the Anthropic event stream, reduced to what the
/// assembler needs.
#[derive(Debug, Clone, PartialEq)]
enum WireEvent {
    TextDelta(String),
    ThinkingDelta(String),
    ToolCallStart { id: String, name: String },
    ToolCallArgs(String),
    Usage(TokenUsage),
    /// `message_delta` carries the final stop reason and the output token
    /// count in one frame.
    Stop {
        stop_reason: Option<StopReason>,
        output_tokens: u64,
    },
    Done,
    Ignore,
}

fn parse_sse_event(v: &Value) -> WireEvent {
    match v["type"].as_str().unwrap_or("") {
        "content_block_start" => {
            let block = &v["content_block"];
            if block["type"].as_str() == Some("tool_use") {
                WireEvent::ToolCallStart {
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                }
            } else {
                WireEvent::Ignore
            }
        }
        "content_block_delta" => {
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => {
                    WireEvent::TextDelta(delta["text"].as_str().unwrap_or("").to_string())
                }
                "input_json_delta" => {
                    WireEvent::ToolCallArgs(delta["partial_json"].as_str().unwrap_or("").to_string())
                }
                "thinking_delta" => {
                    WireEvent::ThinkingDelta(delta["thinking"].as_str().unwrap_or("").to_string())
                }
                // signature_delta carries an opaque integrity blob; never
                // surface it as text.
                _ => WireEvent::Ignore,
            }
        }
        "message_start" => {
            if let Some(usage) = v["message"].get("usage") {
                WireEvent::Usage(TokenUsage {
                    input: usage["input_tokens"].as_u64().unwrap_or(0),
                    output: 0,
                    cache_read: usage["cache_read_input_tokens"].as_u64().unwrap_or(0),
                    cache_write: usage["cache_creation_input_tokens"].as_u64().unwrap_or(0),
                })
            } else {
                WireEvent::Ignore
            }
        }
        "message_delta" => WireEvent::Stop {
            stop_reason: v["delta"]["stop_reason"].as_str().map(map_stop_reason),
            output_tokens: v["usage"]["output_tokens"].as_u64().unwrap_or(0),
        },
        "message_stop" => WireEvent::Done,
        _ => WireEvent::Ignore,
    }
}

fn map_stop_reason(s: &str) -> StopReason {
    match s {
        "end_turn" => StopReason::EndTurn,
        "tool_use" => StopReason::ToolUse,
        "max_tokens" => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    }
}

// ─── Wire format ──────────────────────────────────────────────────────────────

/// Convert the conversation into Anthropic's messages array.
///
/// Tool results become `tool_result` blocks in user-role messages; runs of
/// consecutive tool results are coalesced into a single user message, which
/// the API requires when one assistant turn issued several tool calls.
/// Thinking blocks are not replayed.
pub(crate) fn build_wire_messages(messages: &[Message]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    let mut pending_results: Vec<Value> = Vec::new();

    let flush_results = |pending: &mut Vec<Value>, out: &mut Vec<Value>| {
        if !pending.is_empty() {
            out.push(json!({ "role": "user", "content": std::mem::take(pending) }));
        }
    };

    for m in messages {
        match m {
            Message::ToolResult(tr) => {
                pending_results.push(json!({
                    "type": "tool_result",
                    "tool_use_id": tr.tool_call_id,
                    "content": tr.content,
                    "is_error": tr.is_error,
                }));
            }
            Message::User(u) => {
                flush_results(&mut pending_results, &mut out);
                let content = match &u.content {
                    UserContent::Text(t) => json!(t),
                    UserContent::Blocks(blocks) => {
                        let arr: Vec<Value> = blocks
                            .iter()
                            .filter_map(|b| match b {
                                ContentBlock::Text { text } => {
                                    Some(json!({ "type": "text", "text": text }))
                                }
                                ContentBlock::Image { source } => Some(image_block(source)),
                                _ => None,
                            })
                            .collect();
                        json!(arr)
                    }
                };
                out.push(json!({ "role": "user", "content": content }));
            }
            Message::Assistant(a) => {
                flush_results(&mut pending_results, &mut out);
                let blocks: Vec<Value> = a
                    .content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } if !text.is_empty() => {
                            Some(json!({ "type": "text", "text": text }))
                        }
                        ContentBlock::ToolCall { id, name, input } => Some(json!({
                            "type": "tool_use",
                            "id": id,
                            "name": name,
                            "input": input,
                        })),
                        _ => None,
                    })
                    .collect();
                if !blocks.is_empty() {
                    out.push(json!({ "role": "assistant", "content": blocks }));
                }
            }
        }
    }
    flush_results(&mut pending_results, &mut out);
    out
}

fn image_block(source: &str) -> Value {
    match source.strip_prefix("data:").and_then(|rest| rest.split_once(";base64,")) {
        Some((mime, data)) => json!({
            "type": "image",
            "source": { "type": "base64", "media_type": mime, "data": data }
        }),
        None => json!({
            "type": "image",
            "source": { "type": "url", "url": source }
        }),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssistantMessage, UserMessage};
    use chrono::Utc;
    use serde_json::json;

    // ── parse_sse_event ───────────────────────────────────────────────────────

    #[test]
    fn text_delta_is_parsed() {
        let v = json!({
            "type": "content_block_delta",
            "delta": { "type": "text_delta", "text": "world" }
        });
        assert_eq!(parse_sse_event(&v), WireEvent::TextDelta("world".into()));
    }

    #[test]
    fn thinking_delta_is_parsed() {
        let v = json!({
            "type": "content_block_delta",
            "delta": { "type": "thinking_delta", "thinking": "step 1" }
        });
        assert_eq!(parse_sse_event(&v), WireEvent::ThinkingDelta("step 1".into()));
    }

    #[test]
    fn signature_delta_is_ignored() {
        let v = json!({
            "type": "content_block_delta",
            "delta": { "type": "signature_delta", "signature": "EqRk..." }
        });
        assert_eq!(parse_sse_event(&v), WireEvent::Ignore);
    }

    #[test]
    fn tool_use_block_start_carries_id_and_name() {
        let v = json!({
            "type": "content_block_start",
            "index": 1,
            "content_block": { "type": "tool_use", "id": "toolu_01", "name": "bash" }
        });
        assert_eq!(
            parse_sse_event(&v),
            WireEvent::ToolCallStart {
                id: "toolu_01".into(),
                name: "bash".into()
            }
        );
    }

    #[test]
    fn input_json_delta_accumulates_arguments() {
        let v = json!({
            "type": "content_block_delta",
            "delta": { "type": "input_json_delta", "partial_json": "{\"cmd\":" }
        });
        assert_eq!(parse_sse_event(&v), WireEvent::ToolCallArgs("{\"cmd\":".into()));
    }

    #[test]
    fn message_start_yields_input_and_cache_usage() {
        let v = json!({
            "type": "message_start",
            "message": { "usage": {
                "input_tokens": 100,
                "cache_read_input_tokens": 80,
                "cache_creation_input_tokens": 20
            }}
        });
        assert_eq!(
            parse_sse_event(&v),
            WireEvent::Usage(TokenUsage {
                input: 100,
                output: 0,
                cache_read: 80,
                cache_write: 20
            })
        );
    }

    #[test]
    fn message_delta_carries_stop_reason_and_output_tokens() {
        let v = json!({
            "type": "message_delta",
            "delta": { "stop_reason": "tool_use" },
            "usage": { "output_tokens": 88 }
        });
        assert_eq!(
            parse_sse_event(&v),
            WireEvent::Stop {
                stop_reason: Some(StopReason::ToolUse),
                output_tokens: 88
            }
        );
        let v = json!({ "type": "message_delta", "delta": { "stop_reason": "max_tokens" } });
        assert_eq!(
            parse_sse_event(&v),
            WireEvent::Stop {
                stop_reason: Some(StopReason::MaxTokens),
                output_tokens: 0
            }
        );
    }

    #[test]
    fn message_stop_is_done_and_ping_is_ignored() {
        assert_eq!(parse_sse_event(&json!({ "type": "message_stop" })), WireEvent::Done);
        assert_eq!(parse_sse_event(&json!({ "type": "ping" })), WireEvent::Ignore);
    }

    // ── Wire format ───────────────────────────────────────────────────────────

    #[test]
    fn plain_user_message_serialized_as_string_content() {
        let msgs = build_wire_messages(&[Message::user("hello")]);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["role"], "user");
        assert_eq!(msgs[0]["content"], "hello");
    }

    #[test]
    fn assistant_tool_call_becomes_tool_use_block() {
        let m = Message::Assistant(AssistantMessage {
            content: vec![
                ContentBlock::text("running it"),
                ContentBlock::tool_call("t1", "bash", json!({"command": "ls"})),
            ],
            model: "m".into(),
            usage: TokenUsage::default(),
            stop_reason: StopReason::ToolUse,
            timestamp: Utc::now(),
        });
        let msgs = build_wire_messages(&[m]);
        let content = msgs[0]["content"].as_array().unwrap();
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["type"], "tool_use");
        assert_eq!(content[1]["id"], "t1");
        assert_eq!(content[1]["input"]["command"], "ls");
    }

    #[test]
    fn consecutive_tool_results_coalesce_into_one_user_message() {
        let msgs = build_wire_messages(&[
            Message::tool_result("t1", "out1", false),
            Message::tool_result("t2", "out2", true),
            Message::user("next question"),
        ]);
        assert_eq!(msgs.len(), 2, "two tool results must form one user message");
        let blocks = msgs[0]["content"].as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0]["tool_use_id"], "t1");
        assert_eq!(blocks[1]["tool_use_id"], "t2");
        assert_eq!(blocks[1]["is_error"], true);
        assert_eq!(msgs[1]["content"], "next question");
    }

    #[test]
    fn trailing_tool_results_are_flushed() {
        let msgs = build_wire_messages(&[Message::tool_result("t1", "out", false)]);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["role"], "user");
        assert_eq!(msgs[0]["content"][0]["type"], "tool_result");
    }

    #[test]
    fn thinking_blocks_are_not_replayed() {
        let m = Message::Assistant(AssistantMessage {
            content: vec![ContentBlock::thinking("private"), ContentBlock::text("public")],
            model: "m".into(),
            usage: TokenUsage::default(),
            stop_reason: StopReason::EndTurn,
            timestamp: Utc::now(),
        });
        let msgs = build_wire_messages(&[m]);
        let text = serde_json::to_string(&msgs).unwrap();
        assert!(!text.contains("private"));
        assert!(text.contains("public"));
    }

    #[test]
    fn user_image_block_uses_base64_source() {
        let m = Message::User(UserMessage {
            content: UserContent::Blocks(vec![
                ContentBlock::text("look"),
                ContentBlock::Image {
                    source: "data:image/png;base64,iVBORw0KGgo=".into(),
                },
            ]),
            timestamp: Utc::now(),
        });
        let msgs = build_wire_messages(&[m]);
        let img = &msgs[0]["content"][1];
        assert_eq!(img["source"]["type"], "base64");
        assert_eq!(img["source"]["media_type"], "image/png");
        assert_eq!(img["source"]["data"], "iVBORw0KGgo=");
    }

    #[test]
    fn https_image_uses_url_source() {
        let m = Message::User(UserMessage {
            content: UserContent::Blocks(vec![ContentBlock::Image {
                source: "https://example.com/a.jpg".into(),
            }]),
            timestamp: Utc::now(),
        });
        let msgs = build_wire_messages(&[m]);
        assert_eq!(msgs[0]["content"][0]["source"]["type"], "url");
    }
}
