// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolContext, ToolOutput};

pub struct LsTool;

#[async_trait]
impl Tool for LsTool {
    fn name(&self) -> &str {
        "ls"
    }

    fn description(&self) -> &str {
        "List the entries of a directory, sorted by name. Directories carry a \
         trailing '/'."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list (default: cwd)"
                }
            },
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> ToolOutput {
        let path = args["path"].as_str().unwrap_or(".").to_string();
        let mut read_dir = match tokio::fs::read_dir(&path).await {
            Ok(rd) => rd,
            Err(e) => return ToolOutput::error(format!("Error: cannot list {path}: {e}")),
        };

        let mut entries: Vec<String> = Vec::new();
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push(if is_dir { format!("{name}/") } else { name });
        }
        entries.sort();

        if entries.is_empty() {
            ToolOutput::ok("(empty directory)")
        } else {
            ToolOutput::ok(entries.join("\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "x").unwrap();
        std::fs::create_dir(dir.path().join("a_dir")).unwrap();
        let out = LsTool
            .execute(json!({"path": dir.path().to_str().unwrap()}), &ToolContext::new("t1"))
            .await;
        assert_eq!(out.output, "a_dir/\nb.txt");
    }

    #[tokio::test]
    async fn empty_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let out = LsTool
            .execute(json!({"path": dir.path().to_str().unwrap()}), &ToolContext::new("t1"))
            .await;
        assert_eq!(out.output, "(empty directory)");
    }

    #[tokio::test]
    async fn missing_directory_is_error() {
        let out = LsTool
            .execute(json!({"path": "/no/such/dir"}), &ToolContext::new("t1"))
            .await;
        assert!(out.is_error());
    }
}
