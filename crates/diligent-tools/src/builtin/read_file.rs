// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolContext, ToolOutput, TruncateDirection};

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file. Returns the content with 1-based line numbers. \
         Use offset/limit to read a window of a large file; oversized output is \
         truncated keeping the head."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path to read" },
                "offset": {
                    "type": "integer",
                    "description": "First line to return, 1-based (optional)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return (optional)"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn truncate_direction(&self) -> TruncateDirection {
        TruncateDirection::Head
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> ToolOutput {
        let Some(path) = args["path"].as_str() else {
            return ToolOutput::error("Error: missing 'path' argument");
        };
        let offset = args["offset"].as_u64().unwrap_or(1).max(1) as usize;
        let limit = args["limit"].as_u64().map(|l| l as usize);

        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) => return ToolOutput::error(format!("Error: cannot read {path}: {e}")),
        };

        let lines: Vec<&str> = content.lines().collect();
        if offset > lines.len() && !lines.is_empty() {
            return ToolOutput::error(format!(
                "Error: offset {offset} is past the end of {path} ({} lines)",
                lines.len()
            ));
        }
        let end = match limit {
            Some(l) => (offset - 1 + l).min(lines.len()),
            None => lines.len(),
        };
        let numbered: Vec<String> = lines[offset - 1..end]
            .iter()
            .enumerate()
            .map(|(i, l)| format!("{:>6}\t{l}", offset + i))
            .collect();
        ToolOutput::ok(numbered.join("\n"))
    }
}
