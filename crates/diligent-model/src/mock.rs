// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use serde_json::Value;

use crate::{
    error::ProviderError,
    provider::{provider_stream, MessageAssembler, Provider, ProviderEvent, ProviderRequest, ProviderStream},
    types::{StopReason, TokenUsage},
};

/// A pre-scripted provider.  Each `stream` call pops the next event script
/// from the front of the queue, so tests can specify exact event sequences
/// (including tool calls and typed failures) without network access.
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Vec<ProviderEvent>>>,
    calls: AtomicU32,
    /// The last request seen, so tests can inspect what was sent.
    pub last_request: Mutex<Option<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Vec<ProviderEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            calls: AtomicU32::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// Provider that always answers with a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![text_events(&reply.into())])
    }

    /// Provider that requests one tool call, then answers with text.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        input: Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            tool_call_events(&tool_id.into(), &tool_name.into(), input),
            text_events(&final_text.into()),
        ])
    }

    /// Number of `stream` invocations so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// System prompt of the most recent request, for prompt-shape assertions.
    pub fn last_system_prompt(&self) -> Option<String> {
        self.last_request
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| r.system_prompt.clone())
    }
}

impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn stream(&self, req: ProviderRequest) -> ProviderStream {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(req);
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            scripts
                .pop_front()
                // Default fallback when all scripts are consumed.
                .unwrap_or_else(|| text_events("[no more scripts]"))
        };
        let stream = provider_stream();
        for event in events {
            stream.push(event);
        }
        stream
    }
}

// ─── Script builders ─────────────────────────────────────────────────────────

/// Full well-formed event sequence for a text-only reply.
pub fn text_events(text: &str) -> Vec<ProviderEvent> {
    let mut asm = MessageAssembler::new("mock-model");
    let mut events = vec![ProviderEvent::Start];
    events.extend(asm.text_delta(text));
    events.extend(asm.add_usage(TokenUsage {
        input: 10,
        output: 5,
        ..Default::default()
    }));
    events.extend(asm.finish(StopReason::EndTurn));
    events
}

/// Full well-formed event sequence for a single tool call.
pub fn tool_call_events(id: &str, name: &str, input: Value) -> Vec<ProviderEvent> {
    let mut asm = MessageAssembler::new("mock-model");
    let mut events = vec![ProviderEvent::Start];
    events.extend(asm.tool_call_start(id, name));
    events.extend(asm.tool_call_delta(&input.to_string()));
    events.extend(asm.add_usage(TokenUsage {
        input: 10,
        output: 5,
        ..Default::default()
    }));
    events.extend(asm.finish(StopReason::ToolUse));
    events
}

/// Event sequence that fails with the given typed error.
pub fn error_events(error: ProviderError) -> Vec<ProviderEvent> {
    vec![ProviderEvent::Start, ProviderEvent::Error { error }]
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;
    use serde_json::json;

    #[tokio::test]
    async fn always_text_resolves_with_reply() {
        let p = ScriptedProvider::always_text("hello world");
        let s = p.stream(ProviderRequest::new("m", vec![Message::user("hi")]));
        let result = s.result().await.unwrap();
        assert_eq!(result.message.text(), "hello world");
        assert_eq!(p.calls(), 1);
    }

    #[tokio::test]
    async fn tool_then_text_pops_scripts_in_order() {
        let p = ScriptedProvider::tool_then_text("c1", "echo", json!({"message": "hi"}), "done");

        let first = p.stream(ProviderRequest::new("m", vec![]));
        let r1 = first.result().await.unwrap();
        let calls = r1.message.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "echo");
        assert_eq!(calls[0].2, &json!({"message": "hi"}));
        assert_eq!(r1.message.stop_reason, StopReason::ToolUse);

        let second = p.stream(ProviderRequest::new("m", vec![]));
        assert_eq!(second.result().await.unwrap().message.text(), "done");
    }

    #[tokio::test]
    async fn exhausted_scripts_fall_back_to_placeholder() {
        let p = ScriptedProvider::new(vec![]);
        let s = p.stream(ProviderRequest::new("m", vec![]));
        assert!(s.result().await.unwrap().message.text().contains("no more scripts"));
    }

    #[tokio::test]
    async fn error_script_fails_the_stream() {
        let p = ScriptedProvider::new(vec![error_events(ProviderError::Overloaded {
            message: "529".into(),
        })]);
        let s = p.stream(ProviderRequest::new("m", vec![]));
        let err = s.result().await.unwrap_err();
        assert_eq!(err.downcast_ref::<ProviderError>().unwrap().kind(), "overloaded");
    }

    #[tokio::test]
    async fn last_request_records_what_was_sent() {
        let p = ScriptedProvider::always_text("x");
        let mut req = ProviderRequest::new("m", vec![Message::user("question")]);
        req.system_prompt = "be terse".into();
        let _ = p.stream(req);
        assert_eq!(p.last_system_prompt().as_deref(), Some("be terse"));
        let guard = p.last_request.lock().unwrap();
        assert_eq!(guard.as_ref().unwrap().messages.len(), 1);
    }
}
