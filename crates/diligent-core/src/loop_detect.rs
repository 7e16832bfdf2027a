// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;

use serde_json::Value;

const DEFAULT_WINDOW: usize = 10;

/// A detected repetition of tool calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopDetection {
    /// Length of the repeating pattern (1–3).
    pub pattern_length: usize,
    /// First tool of the pattern, for the warning message.
    pub tool_name: String,
}

/// Detects repeating tool-call patterns over a sliding window.
///
/// Each recorded call becomes a signature `name NUL json(input)`; `check`
/// reports when the most recent `3×L` signatures are the same length-`L`
/// sequence three times over, for `L ∈ {1, 2, 3}`, smallest `L` first.
/// Input equality goes through `serde_json` serialization, which emits
/// object keys in sorted order, so two structurally equal inputs always
/// produce the same signature.
pub struct LoopDetector {
    window: VecDeque<(String, String)>,
    capacity: usize,
}

impl LoopDetector {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_WINDOW)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            window: VecDeque::new(),
            capacity,
        }
    }

    pub fn record(&mut self, tool_name: &str, input: &Value) {
        let signature = format!("{tool_name}\u{0}{input}");
        self.window.push_back((tool_name.to_string(), signature));
        while self.window.len() > self.capacity {
            self.window.pop_front();
        }
    }

    pub fn check(&self) -> Option<LoopDetection> {
        for len in 1..=3usize {
            if self.window.len() < 3 * len {
                continue;
            }
            let tail: Vec<&(String, String)> =
                self.window.iter().skip(self.window.len() - 3 * len).collect();
            let pattern: Vec<&str> = tail[..len].iter().map(|(_, s)| s.as_str()).collect();
            let repeats = (1..3).all(|rep| {
                (0..len).all(|i| tail[rep * len + i].1 == pattern[i])
            });
            if repeats {
                return Some(LoopDetection {
                    pattern_length: len,
                    tool_name: tail[0].0.clone(),
                });
            }
        }
        None
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
