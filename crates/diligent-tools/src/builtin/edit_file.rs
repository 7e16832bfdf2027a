// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{ApprovalDecision, Tool, ToolContext, ToolOutput};

pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace an exact string in a file. old_string must match exactly once \
         unless replace_all is set; include enough surrounding context to make \
         the match unique."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File to modify" },
                "old_string": { "type": "string", "description": "Exact text to replace" },
                "new_string": { "type": "string", "description": "Replacement text" },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace every occurrence (default false)"
                }
            },
            "required": ["path", "old_string", "new_string"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutput {
        let (Some(path), Some(old), Some(new)) = (
            args["path"].as_str(),
            args["old_string"].as_str(),
            args["new_string"].as_str(),
        ) else {
            return ToolOutput::error("Error: path, old_string and new_string are required");
        };
        let replace_all = args["replace_all"].as_bool().unwrap_or(false);
        if old.is_empty() {
            return ToolOutput::error("Error: old_string must not be empty");
        }
        if old == new {
            return ToolOutput::error("Error: old_string and new_string are identical");
        }

        if ctx.request_approval(self.name(), format!("edit {path}")) == ApprovalDecision::Reject {
            return ToolOutput::error("Error: edit rejected by user");
        }

        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) => return ToolOutput::error(format!("Error: cannot read {path}: {e}")),
        };

        let occurrences = content.matches(old).count();
        if occurrences == 0 {
            return ToolOutput::error(format!("Error: old_string not found in {path}"));
        }
        if occurrences > 1 && !replace_all {
            return ToolOutput::error(format!(
                "Error: old_string matches {occurrences} times in {path}; \
                 add context to make it unique or set replace_all"
            ));
        }

        let updated = if replace_all {
            content.replace(old, new)
        } else {
            content.replacen(old, new, 1)
        };
        match tokio::fs::write(path, updated).await {
            Ok(()) => ToolOutput::ok(format!(
                "Replaced {} occurrence(s) in {path}",
                if replace_all { occurrences } else { 1 }
            ))
            .with_metadata("path", json!(path)),
            Err(e) => ToolOutput::error(format!("Error: cannot write {path}: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(content: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, content).unwrap();
        let p = path.display().to_string();
        (dir, p)
    }

    #[tokio::test]
    async fn replaces_unique_match() {
        let (_d, path) = temp_file("fn main() { old(); }");
        let out = EditFileTool
            .execute(
                json!({"path": path, "old_string": "old()", "new_string": "new()"}),
                &ToolContext::new("t1"),
            )
            .await;
        assert!(!out.is_error(), "{}", out.output);
        assert!(std::fs::read_to_string(&path).unwrap().contains("new()"));
    }

    #[tokio::test]
    async fn ambiguous_match_is_error_without_replace_all() {
        let (_d, path) = temp_file("x x x");
        let out = EditFileTool
            .execute(
                json!({"path": path, "old_string": "x", "new_string": "y"}),
                &ToolContext::new("t1"),
            )
            .await;
        assert!(out.is_error());
        assert!(out.output.contains("3 times"));
    }

    #[tokio::test]
    async fn replace_all_handles_ambiguous_match() {
        let (_d, path) = temp_file("x x x");
        let out = EditFileTool
            .execute(
                json!({"path": path, "old_string": "x", "new_string": "y", "replace_all": true}),
                &ToolContext::new("t1"),
            )
            .await;
        assert!(!out.is_error());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "y y y");
    }

    #[tokio::test]
    async fn missing_match_is_error() {
        let (_d, path) = temp_file("abc");
        let out = EditFileTool
            .execute(
                json!({"path": path, "old_string": "zzz", "new_string": "y"}),
                &ToolContext::new("t1"),
            )
            .await;
        assert!(out.is_error());
        assert!(out.output.contains("not found"));
    }
}
