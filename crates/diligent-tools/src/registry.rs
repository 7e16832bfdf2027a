// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::tool::{validate_against_schema, Tool, ToolContext, ToolOutput};
use crate::truncate::truncate_output;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("tool '{0}' is already registered")]
    Duplicate(String),
}

/// Insertion-ordered mapping from tool name to implementation.
///
/// Order matters: the schemas sent to the model list tools in registration
/// order, and the models pay attention to it.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Register a tool.  Duplicate names fail eagerly so a misconfigured
    /// tool set is caught at startup, not at dispatch time.
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), RegistryError> {
        let name = tool.name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.by_name.insert(name, self.tools.len());
        self.tools.push(Arc::new(tool));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.by_name.get(name).map(|i| Arc::clone(&self.tools[*i]))
    }

    /// Tool names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    /// `(name, description, schema)` triples in registration order, for the
    /// provider request.
    pub fn schemas(&self) -> Vec<(String, String, Value)> {
        self.tools
            .iter()
            .map(|t| {
                (
                    t.name().to_string(),
                    t.description().to_string(),
                    t.parameters_schema(),
                )
            })
            .collect()
    }

    /// Dispatch one tool call: look up, validate, execute, auto-truncate.
    ///
    /// Every failure mode produces an error [`ToolOutput`] rather than an
    /// `Err`; tool problems flow back to the model as conversation content.
    pub async fn execute(&self, name: &str, input: Value, ctx: &ToolContext) -> ToolOutput {
        let Some(tool) = self.get(name) else {
            return ToolOutput::error(format!("Error: Unknown tool '{name}'"));
        };
        if let Err(reason) = validate_against_schema(&tool.parameters_schema(), &input) {
            return ToolOutput::error(format!(
                "Error: Invalid arguments for tool '{name}': {reason}"
            ));
        }

        debug!(tool = name, call_id = %ctx.tool_call_id, "executing tool");
        let mut out = tool.execute(input, ctx).await;

        let direction = out.truncate.unwrap_or_else(|| tool.truncate_direction());
        let truncation = truncate_output(&out.output, direction);
        if truncation.truncated {
            out.output = truncation.output;
            out = out.with_metadata("truncated", Value::Bool(true));
            if let Some(path) = truncation.spill_path {
                out = out.with_metadata(
                    "full_output_path",
                    Value::String(path.display().to_string()),
                );
            }
        }
        out
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
