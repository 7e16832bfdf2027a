// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;

use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    error::ProviderError,
    provider::{provider_stream, MessageAssembler, Provider, ProviderEvent, ProviderRequest, ProviderStream},
    types::{ContentBlock, Message, StopReason, TokenUsage, UserContent},
};

/// Driver for the OpenAI chat-completions wire format, which is also the
/// format spoken by most local inference servers.
pub struct OpenAiProvider {
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com".into()),
            client: reqwest::Client::new(),
        }
    }
}

/// Accumulates one tool call across interleaved chunks.  OpenAI splits a
/// call's id/name/arguments over many deltas, keyed by a parallel-call index.
#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args: String,
}

impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
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
                        message: "no OpenAI API key configured".into(),
                    },
                });
                return;
            };

            let mut body = json!({
                "model": req.model,
                "messages": build_wire_messages(&req.system_prompt, &req.messages),
                "stream": true,
                "stream_options": { "include_usage": true },
            });
            if let Some(mt) = req.max_tokens {
                body["max_tokens"] = json!(mt);
            }
            if let Some(t) = req.temperature {
                body["temperature"] = json!(t);
            }
            if !req.tools.is_empty() {
                let tools: Vec<Value> = req
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.json_schema,
                            }
                        })
                    })
                    .collect();
                body["tools"] = json!(tools);
            }

            debug!(model = %req.model, messages = req.messages.len(), "sending openai request");

            let send = client
                .post(format!("{base_url}/v1/chat/completions"))
                .bearer_auth(key)
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
                let retry_ms = resp
                    .headers()
                    .get("retry-after-ms")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let retry_secs = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
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
            // Chunks for different parallel tool calls interleave by index;
            // they are buffered here and flushed in index order before finish
            // so the assembled blocks stay deterministic.
            let mut pending: BTreeMap<u64, PendingToolCall> = BTreeMap::new();
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
                    let data = data.trim();
                    if data == "[DONE]" {
                        flush_tool_calls(&out, &mut asm, std::mem::take(&mut pending));
                        push_all(&out, asm.finish(stop_reason));
                        return;
                    }
                    let Ok(v) = serde_json::from_str::<Value>(data) else {
                        continue;
                    };
                    apply_chunk(&v, &out, &mut asm, &mut pending, &mut stop_reason);
                }
            }

            warn!("openai stream ended without [DONE]");
            flush_tool_calls(&out, &mut asm, pending);
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

/// Fold one parsed chunk into the assembler / pending tool-call state.
fn apply_chunk(
    v: &Value,
    out: &ProviderStream,
    asm: &mut MessageAssembler,
    pending: &mut BTreeMap<u64, PendingToolCall>,
    stop_reason: &mut StopReason,
) {
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        push_all(
            out,
            asm.add_usage(TokenUsage {
                input: usage["prompt_tokens"].as_u64().unwrap_or(0),
                output: usage["completion_tokens"].as_u64().unwrap_or(0),
                cache_read: usage["prompt_tokens_details"]["cached_tokens"]
                    .as_u64()
                    .unwrap_or(0),
                cache_write: 0,
            }),
        );
    }
    let Some(choice) = v["choices"].get(0) else {
        return;
    };
    if let Some(fr) = choice["finish_reason"].as_str() {
        *stop_reason = match fr {
            "tool_calls" => StopReason::ToolUse,
            "length" => StopReason::MaxTokens,
            _ => StopReason::EndTurn,
        };
    }
    let delta = &choice["delta"];
    if let Some(text) = delta["content"].as_str() {
        push_all(out, asm.text_delta(text));
    }
    if let Some(thinking) = delta["reasoning_content"].as_str() {
        push_all(out, asm.thinking_delta(thinking));
    }
    if let Some(calls) = delta["tool_calls"].as_array() {
        for call in calls {
            let index = call["index"].as_u64().unwrap_or(0);
            let entry = pending.entry(index).or_default();
            if let Some(id) = call["id"].as_str() {
                entry.id = id.to_string();
            }
            if let Some(name) = call["function"]["name"].as_str() {
                entry.name.push_str(name);
            }
            if let Some(args) = call["function"]["arguments"].as_str() {
                entry.args.push_str(args);
            }
        }
    }
}

/// Emit buffered tool calls in index order.  Calls without a name cannot be
/// dispatched and are dropped; an empty id gets a synthetic fallback so the
/// turn stays completable.
fn flush_tool_calls(
    out: &ProviderStream,
    asm: &mut MessageAssembler,
    pending: BTreeMap<u64, PendingToolCall>,
) {
    for (i, (_, call)) in pending.into_iter().enumerate() {
        if call.name.is_empty() {
            warn!(tool_call_id = %call.id, "dropping tool call with empty name from model");
            continue;
        }
        let id = if call.id.is_empty() {
            warn!(tool_name = %call.name, "tool call had empty id; generating synthetic id");
            format!("call_synthetic_{i}")
        } else {
            call.id
        };
        push_all(out, asm.tool_call_start(&id, &call.name));
        push_all(out, asm.tool_call_delta(&call.args));
    }
}

// ─── Wire format ──────────────────────────────────────────────────────────────

/// Convert the conversation into the chat-completions messages array.
/// Assistant tool calls become a `tool_calls` array; tool results use the
/// dedicated `tool` role (no coalescing needed for this vendor).
pub(crate) fn build_wire_messages(system_prompt: &str, messages: &[Message]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    if !system_prompt.is_empty() {
        out.push(json!({ "role": "system", "content": system_prompt }));
    }
    for m in messages {
        match m {
            Message::User(u) => {
                let content = match &u.content {
                    UserContent::Text(t) => json!(t),
                    UserContent::Blocks(blocks) => {
                        let arr: Vec<Value> = blocks
                            .iter()
                            .filter_map(|b| match b {
                                ContentBlock::Text { text } => {
                                    Some(json!({ "type": "text", "text": text }))
                                }
                                ContentBlock::Image { source } => Some(json!({
                                    "type": "image_url",
                                    "image_url": { "url": source }
                                })),
                                _ => None,
                            })
                            .collect();
                        json!(arr)
                    }
                };
                out.push(json!({ "role": "user", "content": content }));
            }
            Message::Assistant(a) => {
                let text = a.text();
                let tool_calls: Vec<Value> = a
                    .tool_calls()
                    .into_iter()
                    .map(|(id, name, input)| {
                        json!({
                            "id": id,
                            "type": "function",
                            "function": { "name": name, "arguments": input.to_string() }
                        })
                    })
                    .collect();
                let mut msg = json!({ "role": "assistant" });
                msg["content"] = if text.is_empty() { Value::Null } else { json!(text) };
                if !tool_calls.is_empty() {
                    msg["tool_calls"] = json!(tool_calls);
                }
                out.push(msg);
            }
            Message::ToolResult(tr) => {
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": tr.tool_call_id,
                    "content": tr.content,
                }));
            }
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
