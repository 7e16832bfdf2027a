// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod bash;
mod edit_file;
pub(crate) mod glob;
mod grep;
mod ls;
mod read_file;
mod write_file;

pub use bash::BashTool;
pub use edit_file::EditFileTool;
pub use glob::GlobTool;
pub use grep::GrepTool;
pub use ls::LsTool;
pub use read_file::ReadFileTool;
pub use write_file::WriteFileTool;

use crate::registry::{RegistryError, ToolRegistry};

/// Register the full builtin tool set in the canonical order.
pub fn register_builtin(registry: &mut ToolRegistry) -> Result<(), RegistryError> {
    registry.register(BashTool::default())?;
    registry.register(ReadFileTool)?;
    registry.register(WriteFileTool)?;
    registry.register(EditFileTool)?;
    registry.register(GlobTool)?;
    registry.register(GrepTool)?;
    registry.register(LsTool)?;
    Ok(())
}
