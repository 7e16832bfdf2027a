// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use diligent_config::AgentMode;

/// Tools that remain available in plan mode.
pub const READ_ONLY_TOOLS: &[&str] = &["read_file", "glob", "grep", "ls"];

const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a capable software engineering agent. You work in the user's project \
directory using the provided tools. Read before you write, prefer small \
verifiable steps, and report what you did plainly.";

const PLAN_MODE_DIRECTIVE: &str = "\
You are in PLAN MODE. Investigate and design only: you may read files and \
search the project, but you must NOT modify any file and must NOT run shell \
commands. Produce a concrete plan the user can approve before execution.";

const EXECUTE_MODE_DIRECTIVE: &str = "\
You are in EXECUTE MODE. Carry the task through to completion autonomously: \
make the necessary edits, run the necessary commands, and verify your work \
before reporting back. Avoid stopping to ask for confirmation unless an \
action is destructive or irreversible.";

/// Assemble the effective system prompt for `mode`.
///
/// Mode directives are prepended so they take precedence over anything in the
/// base prompt; `default` mode passes the base prompt through unchanged.
pub fn system_prompt(mode: AgentMode, base: Option<&str>, instructions: &[String]) -> String {
    let mut prompt = String::new();
    match mode {
        AgentMode::Default => {}
        AgentMode::Plan => {
            prompt.push_str(PLAN_MODE_DIRECTIVE);
            prompt.push_str("\n\n");
        }
        AgentMode::Execute => {
            prompt.push_str(EXECUTE_MODE_DIRECTIVE);
            prompt.push_str("\n\n");
        }
    }
    prompt.push_str(base.unwrap_or(DEFAULT_SYSTEM_PROMPT));
    for instruction in instructions {
        prompt.push_str("\n\n");
        prompt.push_str(instruction);
    }
    prompt
}

/// Synthetic user message appended when the loop detector fires.
pub fn loop_warning(pattern_length: usize, tool_name: &str) -> String {
    format!(
        "[Loop detected] You have repeated the same sequence of {pattern_length} \
         tool call(s) (starting with '{tool_name}') three times with identical \
         inputs. Re-running it will produce the same result. Change your \
         approach, or explain to the user why you are stuck."
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
