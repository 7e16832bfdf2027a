// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::builtin::glob::{glob_to_regex, is_ignored_dir};
use crate::tool::{Tool, ToolContext, ToolOutput};

pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents for a regular expression. Returns 'path:line: text' \
         matches, leading matches first. Restrict the file set with the glob \
         parameter (e.g. '**/*.rs'). Binary files and VCS directories are skipped."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for"
                },
                "root": {
                    "type": "string",
                    "description": "Directory to search from (default: cwd)"
                },
                "glob": {
                    "type": "string",
                    "description": "Glob filter for file paths (optional)"
                },
                "max_matches": {
                    "type": "integer",
                    "description": "Maximum matches to return (default 200)"
                }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> ToolOutput {
        let Some(pattern) = args["pattern"].as_str() else {
            return ToolOutput::error("Error: missing 'pattern' argument");
        };
        let root = args["root"].as_str().unwrap_or(".").to_string();
        let max = args["max_matches"].as_u64().unwrap_or(200) as usize;

        let re = match regex::Regex::new(pattern) {
            Ok(r) => r,
            Err(e) => return ToolOutput::error(format!("Error: bad pattern: {e}")),
        };
        let path_filter = match args["glob"].as_str() {
            Some(g) => match glob_to_regex(g) {
                Ok(r) => Some(r),
                Err(e) => return ToolOutput::error(format!("Error: bad glob: {e}")),
            },
            None => None,
        };

        let mut matches: Vec<String> = Vec::new();
        'files: for entry in WalkDir::new(&root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_ignored_dir(e))
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let rel = entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            if let Some(f) = &path_filter {
                if !f.is_match(&rel) {
                    continue;
                }
            }
            let Ok(bytes) = std::fs::read(entry.path()) else {
                continue;
            };
            // Binary heuristic: NUL byte in the first kilobyte.
            if bytes.iter().take(1024).any(|b| *b == 0) {
                continue;
            }
            let content = String::from_utf8_lossy(&bytes);
            for (i, line) in content.lines().enumerate() {
                if re.is_match(line) {
                    matches.push(format!("{}:{}: {}", entry.path().display(), i + 1, line));
                    if matches.len() >= max {
                        break 'files;
                    }
                }
            }
        }

        if matches.is_empty() {
            ToolOutput::ok("(no matches)")
        } else {
            ToolOutput::ok(matches.join("\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}\nfn helper() {}").unwrap();
        std::fs::write(dir.path().join("notes.md"), "fn is not rust here").unwrap();
        std::fs::write(dir.path().join("blob.bin"), [0u8, 159, 146, 150]).unwrap();
        dir
    }

    #[tokio::test]
    async fn finds_matches_with_line_numbers() {
        let dir = fixture();
        let out = GrepTool
            .execute(
                json!({"pattern": "fn \\w+", "root": dir.path().to_str().unwrap()}),
                &ToolContext::new("t1"),
            )
            .await;
        assert!(out.output.contains("main.rs:1: fn main() {}"));
        assert!(out.output.contains("main.rs:2: fn helper() {}"));
    }

    #[tokio::test]
    async fn glob_filter_restricts_files() {
        let dir = fixture();
        let out = GrepTool
            .execute(
                json!({
                    "pattern": "fn",
                    "root": dir.path().to_str().unwrap(),
                    "glob": "**/*.rs"
                }),
                &ToolContext::new("t1"),
            )
            .await;
        assert!(out.output.contains("main.rs"));
        assert!(!out.output.contains("notes.md"));
    }

    #[tokio::test]
    async fn binary_files_are_skipped() {
        let dir = fixture();
        let out = GrepTool
            .execute(
                json!({"pattern": ".", "root": dir.path().to_str().unwrap()}),
                &ToolContext::new("t1"),
            )
            .await;
        assert!(!out.output.contains("blob.bin"));
    }

    #[tokio::test]
    async fn max_matches_caps_results() {
        let dir = fixture();
        let out = GrepTool
            .execute(
                json!({
                    "pattern": "fn",
                    "root": dir.path().to_str().unwrap(),
                    "max_matches": 1
                }),
                &ToolContext::new("t1"),
            )
            .await;
        assert_eq!(out.output.lines().count(), 1);
    }

    #[tokio::test]
    async fn invalid_regex_is_error() {
        let out = GrepTool
            .execute(json!({"pattern": "(unclosed"}), &ToolContext::new("t1"))
            .await;
        assert!(out.is_error());
    }
}
