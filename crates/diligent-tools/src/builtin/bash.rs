// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

use crate::tool::{ApprovalDecision, Tool, ToolContext, ToolOutput, TruncateDirection};

pub struct BashTool {
    pub timeout_secs: u64,
}

impl Default for BashTool {
    fn default() -> Self {
        Self { timeout_secs: 120 }
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Executes a shell command and returns its combined output.\n\
         Use for terminal operations (git, build tools, package managers). \
         Do NOT use it for file operations: use read_file instead of cat/head/tail, \
         grep instead of shell grep, and edit_file instead of sed.\n\
         Independent commands belong in separate calls; chain dependent commands \
         with '&&'. Non-zero exit codes are reported as errors with the exit code \
         in the output. Long output is truncated keeping the tail."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "workdir": {
                    "type": "string",
                    "description": "Working directory (optional, defaults to cwd)"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Execution timeout in seconds (optional)"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn truncate_direction(&self) -> TruncateDirection {
        TruncateDirection::Tail
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutput {
        let Some(command) = args["command"].as_str().map(str::to_string) else {
            return ToolOutput::error("Error: missing 'command' argument");
        };
        let workdir = args["workdir"].as_str().map(str::to_string);
        let timeout = args["timeout_secs"].as_u64().unwrap_or(self.timeout_secs);

        if ctx.request_approval(self.name(), &command) == ApprovalDecision::Reject {
            return ToolOutput::error("Error: command rejected by user");
        }

        debug!(cmd = %command, "bash tool");

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&command);
        if let Some(wd) = &workdir {
            cmd.current_dir(wd);
        }
        cmd.kill_on_drop(true);

        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return ToolOutput::error("Error: command cancelled");
            }
            r = tokio::time::timeout(std::time::Duration::from_secs(timeout), cmd.output()) => r,
        };

        match result {
            Ok(Ok(output)) => {
                let mut content = String::new();
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stdout.is_empty() {
                    content.push_str(&stdout);
                }
                if !stderr.is_empty() {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str("[stderr]\n");
                    content.push_str(&stderr);
                }
                let code = output.status.code().unwrap_or(-1);
                if content.is_empty() {
                    content = format!("[exit {code}]");
                }
                if output.status.success() {
                    ToolOutput::ok(content)
                } else {
                    ToolOutput::error(format!("[exit {code}]\n{content}"))
                }
            }
            Ok(Err(e)) => ToolOutput::error(format!("Error: spawn failed: {e}")),
            Err(_) => ToolOutput::error(format!("Error: timeout after {timeout}s")),
        }
    }
}
