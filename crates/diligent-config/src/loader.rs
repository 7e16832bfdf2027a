// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::Value;
use tracing::{debug, warn};

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest
/// priority.  Later files override earlier ones; environment variables are
/// applied on top of everything.
fn config_search_paths(project_root: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. Global user config
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("diligent/diligent.jsonc"));
    }
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".diligent/diligent.jsonc"));
    }

    // 2. Project-local
    paths.push(project_root.join(".diligent/diligent.jsonc"));
    paths.push(project_root.join("diligent.jsonc"));

    paths
}

/// Load configuration for `project_root`, merging all discovered layers and
/// applying environment overrides.  The `extra` argument may provide an
/// explicit path (e.g. a `--config` CLI flag); that file must exist and parse.
pub fn load(project_root: &Path, extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut layers: Vec<Value> = Vec::new();

    for path in config_search_paths(project_root) {
        if !path.is_file() {
            continue;
        }
        match read_layer(&path) {
            Ok(layer) => {
                debug!(path = %path.display(), "loading config layer");
                layers.push(layer);
            }
            // Strict mode: a layer with an unknown top-level key (or a parse
            // error) is rejected as a whole rather than partially applied.
            Err(e) => warn!(path = %path.display(), error = %e, "rejecting config layer"),
        }
    }

    if let Some(p) = extra {
        let layer = read_layer(p).with_context(|| format!("loading {}", p.display()))?;
        layers.push(layer);
    }

    Ok(load_layers(layers))
}

/// Merge pre-parsed layers (lowest priority first) into a [`Config`] and
/// apply environment overrides.  Split out from [`load`] so tests can feed
/// layers directly without touching the filesystem.
pub fn load_layers(layers: Vec<Value>) -> Config {
    let mut merged = Value::Object(serde_json::Map::new());
    for layer in layers {
        merge_json(&mut merged, layer);
    }

    let mut config: Config = serde_json::from_value(merged).unwrap_or_default();
    apply_env_overrides(&mut config);
    config
}

/// Read and validate one config file: strip comments, substitute `{env:VAR}`
/// templates, parse, and check top-level keys against the schema.
fn read_layer(path: &Path) -> anyhow::Result<Value> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let stripped = strip_jsonc_comments(&text);
    let substituted = substitute_env(&stripped, |var| std::env::var(var).ok());
    let value: Value = serde_json::from_str(&substituted)
        .with_context(|| format!("parsing {}", path.display()))?;

    // Validate the layer in isolation so an unknown key rejects exactly this
    // layer, not the merged result of all layers.
    let _: Config = serde_json::from_value(value.clone())
        .with_context(|| format!("validating {}", path.display()))?;
    Ok(value)
}

/// Strip `//` line comments and `/* */` block comments from JSONC text.
///
/// The scanner is string-aware: comment markers inside JSON string literals
/// are preserved, including behind escape sequences.  Stripped regions are
/// replaced by nothing (line comments keep their terminating newline so line
/// numbers in parse errors stay meaningful).
pub fn strip_jsonc_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => {
                    out.push(c);
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                }
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                _ => out.push(c),
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' => match chars.peek() {
                Some('/') => {
                    for n in chars.by_ref() {
                        if n == '\n' {
                            out.push('\n');
                            break;
                        }
                    }
                }
                Some('*') => {
                    chars.next();
                    let mut prev = '\0';
                    for n in chars.by_ref() {
                        if prev == '*' && n == '/' {
                            break;
                        }
                        prev = n;
                    }
                }
                _ => out.push(c),
            },
            _ => out.push(c),
        }
    }
    out
}

/// Replace `{env:VAR}` templates with the value returned by `lookup`, or the
/// empty string when the variable is unset.  `lookup` is injected so tests do
/// not depend on process environment.
pub fn substitute_env(text: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{env:") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 5..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                out.push_str(&lookup(var).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated template: keep the literal text.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
///
/// The `instructions` array is the one list merged by concatenation (with
/// duplicates removed) instead of replacement, so project configs extend
/// rather than clobber the user's global instructions.
fn merge_json(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(d), Value::Object(s)) => {
            for (k, v) in s {
                if !d.contains_key(&k) {
                    d.insert(k, v);
                    continue;
                }
                if k == "instructions" {
                    if let (Some(Value::Array(da)), Value::Array(sa)) = (d.get_mut(&k), &v) {
                        for item in sa {
                            if !da.contains(item) {
                                da.push(item.clone());
                            }
                        }
                        continue;
                    }
                    d.insert(k, v);
                    continue;
                }
                if let Some(existing) = d.get_mut(&k) {
                    merge_json(existing, v);
                }
            }
        }
        (dst, src) => *dst = src,
    }
}

/// Apply the environment layer: provider credentials and the model override.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
        if !key.is_empty() {
            config
                .provider
                .anthropic
                .get_or_insert_with(Default::default)
                .api_key
                .get_or_insert(key);
        }
    }
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        if !key.is_empty() {
            config
                .provider
                .openai
                .get_or_insert_with(Default::default)
                .api_key
                .get_or_insert(key);
        }
    }
    if let Ok(model) = std::env::var("DILIGENT_MODEL") {
        if !model.is_empty() {
            config.model = Some(model);
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
