// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{ApprovalDecision, Tool, ToolContext, ToolOutput};

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating it (and any parent directories) if \
         needed, or replacing it entirely. For partial changes to an existing \
         file prefer edit_file."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path to write" },
                "content": { "type": "string", "description": "Full file content" }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutput {
        let Some(path) = args["path"].as_str() else {
            return ToolOutput::error("Error: missing 'path' argument");
        };
        let Some(content) = args["content"].as_str() else {
            return ToolOutput::error("Error: missing 'content' argument");
        };

        if ctx.request_approval(self.name(), format!("write {path}")) == ApprovalDecision::Reject {
            return ToolOutput::error("Error: write rejected by user");
        }

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return ToolOutput::error(format!("Error: cannot create {}: {e}", parent.display()));
                }
            }
        }
        match tokio::fs::write(path, content).await {
            Ok(()) => ToolOutput::ok(format!("Wrote {} bytes to {path}", content.len()))
                .with_metadata("path", json!(path)),
            Err(e) => ToolOutput::error(format!("Error: cannot write {path}: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_file_and_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c.txt");
        let out = WriteFileTool
            .execute(
                json!({"path": path.to_str().unwrap(), "content": "data"}),
                &ToolContext::new("t1"),
            )
            .await;
        assert!(!out.is_error(), "{}", out.output);
        assert_eq!(std::fs::read_to_string(path).unwrap(), "data");
    }

    #[tokio::test]
    async fn overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "old").unwrap();
        WriteFileTool
            .execute(
                json!({"path": path.to_str().unwrap(), "content": "new"}),
                &ToolContext::new("t1"),
            )
            .await;
        assert_eq!(std::fs::read_to_string(path).unwrap(), "new");
    }

    #[tokio::test]
    async fn missing_content_is_error() {
        let out = WriteFileTool
            .execute(json!({"path": "/tmp/x"}), &ToolContext::new("t1"))
            .await;
        assert!(out.is_error());
    }
}
