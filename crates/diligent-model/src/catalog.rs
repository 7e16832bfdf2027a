// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model catalog: static metadata (context windows, pricing) for known models.

use serde::{Deserialize, Serialize};

/// Metadata for a single model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelCatalogEntry {
    /// Provider-scoped model identifier (e.g. "gpt-4o", "claude-opus-4-6")
    pub id: String,
    /// Human-readable display name
    pub name: String,
    /// Provider identifier: "openai" | "anthropic" | "scripted"
    pub provider: String,
    /// Short aliases accepted in config (`"sonnet"`, `"mini"`, ...)
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Total context window in tokens (input + output)
    pub context_window: u32,
    /// Maximum output tokens per completion
    pub max_output_tokens: u32,
    /// USD per million input tokens
    pub input_cost_per_mtok: f64,
    /// USD per million output tokens
    pub output_cost_per_mtok: f64,
}

impl ModelCatalogEntry {
    /// Cost in USD for one turn's token usage.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        input_tokens as f64 / 1e6 * self.input_cost_per_mtok
            + output_tokens as f64 / 1e6 * self.output_cost_per_mtok
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    models: Vec<ModelCatalogEntry>,
}

/// Return all entries from the bundled static catalog.
pub fn static_catalog() -> Vec<ModelCatalogEntry> {
    let json = include_str!("../models.json");
    let catalog: CatalogFile =
        serde_json::from_str(json).expect("bundled models.json must be valid");
    catalog.models
}

/// Look up a model by id, display name, or alias.
pub fn lookup(model: &str) -> Option<ModelCatalogEntry> {
    static_catalog()
        .into_iter()
        .find(|e| e.id == model || e.name == model || e.aliases.iter().any(|a| a == model))
}

/// Resolve a config-supplied model string (id or alias) to a canonical id.
/// Unknown strings pass through unchanged so custom endpoints keep working.
pub fn resolve_model_id(model: &str) -> String {
    lookup(model).map(|e| e.id).unwrap_or_else(|| model.to_string())
}

/// Context window for a model, with a fallback for unknown models.
pub fn context_window(model: &str, default: u32) -> u32 {
    lookup(model).map(|e| e.context_window).unwrap_or(default)
}

/// Per-turn USD cost, zero for models not in the catalog.
pub fn cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    lookup(model)
        .map(|e| e.cost(input_tokens, output_tokens))
        .unwrap_or(0.0)
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_catalog_is_non_empty() {
        assert!(!static_catalog().is_empty());
    }

    #[test]
    fn lookup_by_id_and_alias_agree() {
        let by_id = lookup("claude-sonnet-4-5").unwrap();
        let by_alias = lookup("sonnet").unwrap();
        assert_eq!(by_id, by_alias);
    }

    #[test]
    fn resolve_model_id_expands_alias() {
        assert_eq!(resolve_model_id("sonnet"), "claude-sonnet-4-5");
    }

    #[test]
    fn resolve_model_id_passes_unknown_through() {
        assert_eq!(resolve_model_id("my-local-model"), "my-local-model");
    }

    #[test]
    fn context_window_fallback_used_when_unknown() {
        assert_eq!(context_window("no-such-model", 4096), 4096);
        assert_eq!(context_window("claude-opus-4-6", 4096), 200_000);
    }

    #[test]
    fn cost_is_linear_in_tokens() {
        let e = lookup("claude-sonnet-4-5").unwrap();
        let one = e.cost(1_000_000, 0);
        assert!((one - 3.0).abs() < 1e-9);
        let mixed = e.cost(1_000_000, 1_000_000);
        assert!((mixed - 18.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_costs_zero() {
        assert_eq!(cost("no-such-model", 1_000_000, 1_000_000), 0.0);
    }

    #[test]
    fn all_entries_have_non_zero_windows() {
        for entry in static_catalog() {
            assert!(entry.context_window > 0, "{} has zero context_window", entry.id);
            assert!(
                entry.max_output_tokens > 0,
                "{} has zero max_output_tokens",
                entry.id
            );
        }
    }
}
