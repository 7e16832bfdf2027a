// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod builtin;
mod registry;
mod tool;
mod truncate;

pub use registry::{RegistryError, ToolRegistry};
pub use tool::{
    validate_against_schema, ApprovalDecision, ApprovalRequest, ApproveFn, OnUpdateFn, Tool,
    ToolContext, ToolOutput, TruncateDirection,
};
pub use truncate::{truncate_output, truncate_to_caps, Truncation, MAX_OUTPUT_BYTES, MAX_OUTPUT_LINES};
