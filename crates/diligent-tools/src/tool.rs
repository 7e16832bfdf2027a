// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

/// How to cut a tool's output when it exceeds the size ceilings.
///
/// Each tool declares its own default; a single result can override it via
/// [`ToolOutput::truncate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TruncateDirection {
    /// Keep the first N bytes/lines.  Default for file reads, where the top
    /// of the file (imports, declarations) matters most.
    #[default]
    Head,
    /// Keep the last N bytes/lines.  Default for shell output, where the
    /// final result matters most.
    Tail,
    /// Keep 40% head + omission marker + 60% tail.
    HeadTail,
}

/// Outcome of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// Approve this single invocation.
    Once,
    /// Approve this and future invocations of the same tool.
    Always,
    Reject,
}

/// What a tool is asking permission for, in user-displayable form.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub tool_name: String,
    pub summary: String,
}

pub type ApproveFn = Arc<dyn Fn(&ApprovalRequest) -> ApprovalDecision + Send + Sync>;
pub type OnUpdateFn = Arc<dyn Fn(String) + Send + Sync>;

/// Per-invocation context handed to [`Tool::execute`].
#[derive(Clone)]
pub struct ToolContext {
    /// The model-minted call id this execution answers.
    pub tool_call_id: String,
    /// Checked by long-running tools between units of work.
    pub cancel: CancellationToken,
    /// Consulted by tools with side effects; absent means auto-approve.
    pub approve: Option<ApproveFn>,
    /// Streams partial output to the agent loop (`tool_update` events).
    pub on_update: Option<OnUpdateFn>,
}

impl ToolContext {
    pub fn new(tool_call_id: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            cancel: CancellationToken::new(),
            approve: None,
            on_update: None,
        }
    }

    /// Ask for approval; `Once` when no approver is installed.
    pub fn request_approval(&self, tool_name: &str, summary: impl Into<String>) -> ApprovalDecision {
        match &self.approve {
            Some(f) => f(&ApprovalRequest {
                tool_name: tool_name.to_string(),
                summary: summary.into(),
            }),
            None => ApprovalDecision::Once,
        }
    }

    /// Report partial output, if anyone is listening.
    pub fn update(&self, partial: impl Into<String>) {
        if let Some(f) = &self.on_update {
            f(partial.into());
        }
    }
}

/// The result of executing a tool.
///
/// Errors are non-fatal by convention: they are flagged in `metadata` under
/// `"error": true` and flow back into the conversation so the model can
/// recover, rather than terminating the loop.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub output: String,
    pub metadata: Option<Map<String, Value>>,
    /// Per-result override of the tool's declared truncate direction.
    pub truncate: Option<TruncateDirection>,
}

impl ToolOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            metadata: None,
            truncate: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let mut metadata = Map::new();
        metadata.insert("error".into(), Value::Bool(true));
        Self {
            output: message.into(),
            metadata: Some(metadata),
            truncate: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("error"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }
}

/// Trait every built-in and user-defined tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the input object.
    fn parameters_schema(&self) -> Value;
    /// How this tool's output should be cut when oversized.
    fn truncate_direction(&self) -> TruncateDirection {
        TruncateDirection::Head
    }
    /// Execute the tool.  Failures are reported via [`ToolOutput::error`].
    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutput;
}

/// Validate `input` against a tool's (intentionally small) JSON Schema
/// subset: top-level object type, `required` fields, per-property primitive
/// types, and `additionalProperties: false`.
pub fn validate_against_schema(schema: &Value, input: &Value) -> Result<(), String> {
    let Some(obj) = input.as_object() else {
        return Err("input must be a JSON object".into());
    };
    let properties = schema.get("properties").and_then(Value::as_object);

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for r in required {
            let name = r.as_str().unwrap_or("");
            if !obj.contains_key(name) {
                return Err(format!("missing required property '{name}'"));
            }
        }
    }

    if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
        if let Some(props) = properties {
            for key in obj.keys() {
                if !props.contains_key(key) {
                    return Err(format!("unknown property '{key}'"));
                }
            }
        }
    }

    if let Some(props) = properties {
        for (key, value) in obj {
            let Some(decl) = props.get(key) else { continue };
            let Some(expected) = decl.get("type").and_then(Value::as_str) else {
                continue;
            };
            let ok = match expected {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                return Err(format!("property '{key}' must be of type {expected}"));
            }
        }
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
