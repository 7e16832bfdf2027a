// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::SystemTime;

use async_trait::async_trait;
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::tool::{Tool, ToolContext, ToolOutput};

pub struct GlobTool;

/// Compile a glob pattern (`*`, `?`, `**`) into an anchored regex over
/// slash-separated relative paths.  `**` crosses directory separators,
/// `*` and `?` do not.
pub(crate) fn glob_to_regex(pattern: &str) -> Result<regex::Regex, regex::Error> {
    let mut re = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // Swallow a following '/' so `**/x` also matches `x` at
                    // the search root.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        re.push_str("(?:.*/)?");
                    } else {
                        re.push_str(".*");
                    }
                } else {
                    re.push_str("[^/]*");
                }
            }
            '?' => re.push_str("[^/]"),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    regex::Regex::new(&re)
}

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Find files whose path matches a glob pattern ('src/**/*.rs', '*.toml'). \
         Matching is against the path relative to root; results are sorted by \
         modification time, newest first."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern, e.g. '**/*.rs' or 'Cargo.toml'"
                },
                "root": {
                    "type": "string",
                    "description": "Directory to search from (default: cwd)"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of paths to return (default 200)"
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
        let max = args["max_results"].as_u64().unwrap_or(200) as usize;

        let re = match glob_to_regex(pattern) {
            Ok(r) => r,
            Err(e) => return ToolOutput::error(format!("Error: bad pattern: {e}")),
        };

        let mut matches: Vec<(std::path::PathBuf, SystemTime)> = Vec::new();
        for entry in WalkDir::new(&root)
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
            if re.is_match(&rel) {
                let mtime = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                matches.push((entry.path().to_path_buf(), mtime));
            }
        }
        matches.sort_by(|a, b| b.1.cmp(&a.1));
        matches.truncate(max);

        if matches.is_empty() {
            ToolOutput::ok("(no matches)")
        } else {
            ToolOutput::ok(
                matches
                    .iter()
                    .map(|(p, _)| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        }
    }
}

pub(crate) fn is_ignored_dir(entry: &walkdir::DirEntry) -> bool {
    entry.file_type().is_dir()
        && matches!(
            entry.file_name().to_str().unwrap_or(""),
            ".git" | "node_modules" | "target" | ".diligent"
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Pattern compilation ───────────────────────────────────────────────────

    #[test]
    fn star_does_not_cross_directories() {
        let re = glob_to_regex("*.rs").unwrap();
        assert!(re.is_match("main.rs"));
        assert!(!re.is_match("src/main.rs"));
    }

    #[test]
    fn double_star_crosses_directories() {
        let re = glob_to_regex("**/*.rs").unwrap();
        assert!(re.is_match("src/deep/main.rs"));
        assert!(re.is_match("main.rs"), "**/ must also match the root level");
    }

    #[test]
    fn question_mark_matches_single_char() {
        let re = glob_to_regex("f?.txt").unwrap();
        assert!(re.is_match("f1.txt"));
        assert!(!re.is_match("f12.txt"));
    }

    #[test]
    fn literal_dots_are_escaped() {
        let re = glob_to_regex("a.rs").unwrap();
        assert!(!re.is_match("axrs"));
    }

    // ── Search ────────────────────────────────────────────────────────────────

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/sub")).unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "x").unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "x").unwrap();
        std::fs::write(dir.path().join("src/sub/lib.rs"), "x").unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/config.rs"), "x").unwrap();
        dir
    }

    #[tokio::test]
    async fn finds_nested_rust_files() {
        let dir = fixture();
        let out = GlobTool
            .execute(
                json!({"pattern": "**/*.rs", "root": dir.path().to_str().unwrap()}),
                &ToolContext::new("t1"),
            )
            .await;
        assert!(out.output.contains("main.rs"));
        assert!(out.output.contains("lib.rs"));
    }

    #[tokio::test]
    async fn git_directory_is_skipped() {
        let dir = fixture();
        let out = GlobTool
            .execute(
                json!({"pattern": "**/*.rs", "root": dir.path().to_str().unwrap()}),
                &ToolContext::new("t1"),
            )
            .await;
        assert!(!out.output.contains(".git"));
    }

    #[tokio::test]
    async fn no_match_reports_no_matches() {
        let dir = fixture();
        let out = GlobTool
            .execute(
                json!({"pattern": "*.zig", "root": dir.path().to_str().unwrap()}),
                &ToolContext::new("t1"),
            )
            .await;
        assert_eq!(out.output, "(no matches)");
    }

    #[tokio::test]
    async fn max_results_is_respected() {
        let dir = fixture();
        let out = GlobTool
            .execute(
                json!({"pattern": "**/*", "root": dir.path().to_str().unwrap(), "max_results": 1}),
                &ToolContext::new("t1"),
            )
            .await;
        assert_eq!(out.output.lines().count(), 1);
    }
}
