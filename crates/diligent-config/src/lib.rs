// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod loader;
mod schema;

pub use loader::{load, load_layers, strip_jsonc_comments, substitute_env};
pub use schema::{
    AgentMode, CompactionConfig, Config, KnowledgeConfig, ProviderCreds, ProviderTable,
    SessionConfig, SkillsConfig,
};
