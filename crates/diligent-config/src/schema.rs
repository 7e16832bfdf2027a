// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be enabled unless explicitly
/// disabled need a named function.
fn default_true() -> bool {
    true
}

fn default_max_turns() -> u32 {
    100
}
fn default_max_retries() -> u32 {
    5
}
fn default_reserve_tokens() -> usize {
    16_384
}
fn default_keep_recent_tokens() -> usize {
    20_000
}
fn default_nudge_interval() -> u32 {
    5
}
fn default_injection_budget() -> u32 {
    2_000
}

/// The agent's operating mode.
///
/// `Plan` restricts the tool set to read-only tools and prepends a directive
/// forbidding writes; `Execute` prepends a directive encouraging autonomous
/// completion.  `Default` passes tools and prompt through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    #[default]
    Default,
    Plan,
    Execute,
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentMode::Default => write!(f, "default"),
            AgentMode::Plan => write!(f, "plan"),
            AgentMode::Execute => write!(f, "execute"),
        }
    }
}

impl std::str::FromStr for AgentMode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(AgentMode::Default),
            "plan" => Ok(AgentMode::Plan),
            "execute" => Ok(AgentMode::Execute),
            other => anyhow::bail!("unknown mode: {other} (expected default|plan|execute)"),
        }
    }
}

/// Merged `diligent.jsonc` configuration.
///
/// Layers are merged lowest-priority first: global user config, then the
/// project config, then environment variables.  Unknown top-level keys
/// reject the layer that carries them (strict mode); missing keys fall back
/// to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Model id or alias forwarded to the provider layer.
    #[serde(default)]
    pub model: Option<String>,
    /// Per-vendor credentials and endpoint overrides.
    #[serde(default)]
    pub provider: ProviderTable,
    /// Maximum number of agent-loop turns per run.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Maximum provider attempts per model call (retry wrapper).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// System prompt override; `None` uses the built-in prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Extra instruction strings appended to the system prompt.
    /// Concatenated across layers with duplicates removed.
    #[serde(default)]
    pub instructions: Vec<String>,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
    /// Default agent mode when none is given on the CLI.
    #[serde(default)]
    pub mode: AgentMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: None,
            provider: ProviderTable::default(),
            max_turns: default_max_turns(),
            max_retries: default_max_retries(),
            system_prompt: None,
            instructions: Vec::new(),
            session: SessionConfig::default(),
            knowledge: KnowledgeConfig::default(),
            compaction: CompactionConfig::default(),
            skills: SkillsConfig::default(),
            mode: AgentMode::Default,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderTable {
    #[serde(default)]
    pub anthropic: Option<ProviderCreds>,
    #[serde(default)]
    pub openai: Option<ProviderCreds>,
}

/// Credentials for one vendor.  Prefer the environment variables
/// (`ANTHROPIC_API_KEY`, `OPENAI_API_KEY`) over `apiKey` in version-controlled
/// config files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCreds {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Resume the most recent session instead of starting fresh.
    #[serde(default)]
    pub auto_resume: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { auto_resume: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Turns between knowledge-save nudges in the system prompt.
    #[serde(default = "default_nudge_interval")]
    pub nudge_interval: u32,
    /// Token budget for knowledge injected into the context.
    #[serde(default = "default_injection_budget")]
    pub injection_budget: u32,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            nudge_interval: default_nudge_interval(),
            injection_budget: default_injection_budget(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Tokens reserved below the context window before proactive compaction
    /// triggers.
    #[serde(default = "default_reserve_tokens")]
    pub reserve_tokens: usize,
    /// Estimated tokens of recent history preserved verbatim across a
    /// compaction.
    #[serde(default = "default_keep_recent_tokens")]
    pub keep_recent_tokens: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reserve_tokens: default_reserve_tokens(),
            keep_recent_tokens: default_keep_recent_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub paths: Vec<std::path::PathBuf>,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            paths: Vec::new(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.max_turns, 100);
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.compaction.reserve_tokens, 16_384);
        assert_eq!(cfg.compaction.keep_recent_tokens, 20_000);
        assert_eq!(cfg.mode, AgentMode::Default);
        assert!(cfg.compaction.enabled);
        assert!(cfg.knowledge.enabled);
        assert!(!cfg.session.auto_resume);
    }

    #[test]
    fn empty_object_deserializes_to_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.max_turns, 100);
        assert!(cfg.model.is_none());
    }

    #[test]
    fn camel_case_keys_are_recognised() {
        let cfg: Config = serde_json::from_str(
            r#"{"maxTurns": 7, "systemPrompt": "be brief", "mode": "plan"}"#,
        )
        .unwrap();
        assert_eq!(cfg.max_turns, 7);
        assert_eq!(cfg.system_prompt.as_deref(), Some("be brief"));
        assert_eq!(cfg.mode, AgentMode::Plan);
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let result: Result<Config, _> = serde_json::from_str(r#"{"maxTurnz": 7}"#);
        assert!(result.is_err(), "strict mode must reject unknown keys");
    }

    #[test]
    fn provider_creds_parse() {
        let cfg: Config = serde_json::from_str(
            r#"{"provider": {"anthropic": {"apiKey": "sk-1", "baseUrl": "http://localhost:1"}}}"#,
        )
        .unwrap();
        let a = cfg.provider.anthropic.unwrap();
        assert_eq!(a.api_key.as_deref(), Some("sk-1"));
        assert_eq!(a.base_url.as_deref(), Some("http://localhost:1"));
        assert!(cfg.provider.openai.is_none());
    }

    #[test]
    fn mode_from_str_round_trip() {
        for (s, m) in [
            ("default", AgentMode::Default),
            ("plan", AgentMode::Plan),
            ("execute", AgentMode::Execute),
        ] {
            assert_eq!(s.parse::<AgentMode>().unwrap(), m);
            assert_eq!(m.to_string(), s);
        }
        assert!("review".parse::<AgentMode>().is_err());
    }

    #[test]
    fn config_serialises_and_deserialises() {
        let mut cfg = Config::default();
        cfg.model = Some("claude-sonnet-4-5".into());
        cfg.instructions = vec!["answer in English".into()];
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.model.as_deref(), Some("claude-sonnet-4-5"));
        assert_eq!(back.instructions.len(), 1);
    }
}
