// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::io::Write;
use std::path::PathBuf;

use tracing::warn;

use crate::tool::TruncateDirection;

/// Byte ceiling applied before the line ceiling, so a pathological single
/// megabyte-long line cannot defeat the line cap.
pub const MAX_OUTPUT_BYTES: usize = 50_000;
pub const MAX_OUTPUT_LINES: usize = 2_000;

/// Result of auto-truncation.
#[derive(Debug)]
pub struct Truncation {
    pub output: String,
    pub truncated: bool,
    /// Where the untruncated output was persisted, when spilling succeeded.
    pub spill_path: Option<PathBuf>,
}

/// Enforce the output-size ceilings on a tool result.
///
/// Oversized output is cut in two phases (bytes, then lines) according to
/// `direction`, the full original is spilled to a temp file, and a warning
/// footer referencing that file is appended.
pub fn truncate_output(output: &str, direction: TruncateDirection) -> Truncation {
    if output.len() <= MAX_OUTPUT_BYTES && output.lines().count() <= MAX_OUTPUT_LINES {
        return Truncation {
            output: output.to_string(),
            truncated: false,
            spill_path: None,
        };
    }

    let spill_path = spill_to_temp(output);
    let body = truncate_to_caps(output, direction, MAX_OUTPUT_BYTES, MAX_OUTPUT_LINES);
    let footer = match &spill_path {
        Some(p) => format!(
            "\n[WARNING: tool output truncated; full output saved to {}]",
            p.display()
        ),
        None => "\n[WARNING: tool output truncated]".to_string(),
    };
    Truncation {
        output: body + &footer,
        truncated: true,
        spill_path,
    }
}

/// The deterministic core: byte phase first, then line phase.  Exposed with
/// explicit caps so the cut geometry is testable at small sizes.
pub fn truncate_to_caps(
    output: &str,
    direction: TruncateDirection,
    max_bytes: usize,
    max_lines: usize,
) -> String {
    let byte_cut = if output.len() > max_bytes {
        apply_byte_cut(output, direction, max_bytes)
    } else {
        output.to_string()
    };
    apply_line_cut(&byte_cut, direction, max_lines)
}

fn apply_byte_cut(s: &str, direction: TruncateDirection, max_bytes: usize) -> String {
    let omitted = s.len() - max_bytes;
    match direction {
        TruncateDirection::Head => s[..floor_boundary(s, max_bytes)].to_string(),
        TruncateDirection::Tail => tail_bytes(s, max_bytes).to_string(),
        TruncateDirection::HeadTail => {
            let head_budget = max_bytes * 2 / 5;
            let tail_budget = max_bytes - head_budget;
            let head = &s[..floor_boundary(s, head_budget)];
            let tail = tail_bytes(s, tail_budget);
            format!("{head}\n[... {omitted} bytes omitted ...]\n{tail}")
        }
    }
}

/// Keep the last `budget` bytes, aligned to a codepoint boundary, then drop
/// a leading partial line so the kept region starts at a line start.
fn tail_bytes(s: &str, budget: usize) -> &str {
    let mut start = ceil_boundary(s, s.len() - budget);
    if start > 0 && s.as_bytes().get(start.wrapping_sub(1)) != Some(&b'\n') {
        if let Some(nl) = s[start..].find('\n') {
            start += nl + 1;
        }
    }
    &s[start..]
}

fn apply_line_cut(s: &str, direction: TruncateDirection, max_lines: usize) -> String {
    let lines: Vec<&str> = s.lines().collect();
    if lines.len() <= max_lines {
        return s.to_string();
    }
    let omitted = lines.len() - max_lines;
    match direction {
        TruncateDirection::Head => lines[..max_lines].join("\n"),
        TruncateDirection::Tail => lines[lines.len() - max_lines..].join("\n"),
        TruncateDirection::HeadTail => {
            let head_n = max_lines * 2 / 5;
            let tail_n = max_lines - head_n;
            let head = lines[..head_n].join("\n");
            let tail = lines[lines.len() - tail_n..].join("\n");
            format!("{head}\n[... {omitted} lines omitted ...]\n{tail}")
        }
    }
}

/// Largest codepoint boundary ≤ `i`.
fn floor_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Smallest codepoint boundary ≥ `i`.
fn ceil_boundary(s: &str, mut i: usize) -> usize {
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

fn spill_to_temp(output: &str) -> Option<PathBuf> {
    let result = tempfile::Builder::new()
        .prefix("diligent-tool-")
        .suffix(".txt")
        .tempfile()
        .and_then(|mut f| {
            f.write_all(output.as_bytes())?;
            f.keep().map_err(|e| e.error)
        });
    match result {
        Ok((_, path)) => Some(path),
        Err(e) => {
            warn!(error = %e, "failed to spill untruncated tool output");
            None
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered_lines(n: usize) -> String {
        (0..n).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n")
    }

    // ── Pass-through ──────────────────────────────────────────────────────────

    #[test]
    fn small_output_is_untouched() {
        let t = truncate_output("hello", TruncateDirection::Head);
        assert!(!t.truncated);
        assert_eq!(t.output, "hello");
        assert!(t.spill_path.is_none());
    }

    #[test]
    fn output_at_exact_caps_is_untouched() {
        let s = numbered_lines(MAX_OUTPUT_LINES);
        assert!(s.len() <= MAX_OUTPUT_BYTES);
        assert!(!truncate_output(&s, TruncateDirection::Head).truncated);
    }

    // ── Byte phase ────────────────────────────────────────────────────────────

    #[test]
    fn head_keeps_leading_bytes() {
        let s = numbered_lines(100);
        let cut = truncate_to_caps(&s, TruncateDirection::Head, 40, 1000);
        assert!(cut.len() <= 40);
        assert!(cut.starts_with("line 0"));
    }

    #[test]
    fn tail_keeps_trailing_bytes_and_drops_partial_line() {
        let s = numbered_lines(100);
        let cut = truncate_to_caps(&s, TruncateDirection::Tail, 40, 1000);
        assert!(cut.len() <= 40);
        assert!(cut.ends_with("line 99"));
        // The kept region must start on a line boundary.
        assert!(cut.starts_with("line "), "got {cut:?}");
    }

    #[test]
    fn head_tail_keeps_both_ends_with_marker() {
        let s = numbered_lines(200);
        let cut = truncate_to_caps(&s, TruncateDirection::HeadTail, 100, 1000);
        assert!(cut.contains("line 0"));
        assert!(cut.contains("line 199"));
        assert!(cut.contains("bytes omitted"));
        assert!(!cut.contains("line 100\n"));
    }

    #[test]
    fn head_tail_split_is_forty_sixty() {
        // One huge line defeats any line logic; byte budget decides.
        let s = "a".repeat(1_000);
        let cut = truncate_to_caps(&s, TruncateDirection::HeadTail, 100, 1000);
        let head_len = cut.split('\n').next().unwrap().len();
        assert_eq!(head_len, 40);
    }

    #[test]
    fn byte_cut_respects_utf8_boundaries() {
        let s = "ö".repeat(1_000);
        for dir in [
            TruncateDirection::Head,
            TruncateDirection::Tail,
            TruncateDirection::HeadTail,
        ] {
            // Would panic on a mid-codepoint slice.
            let cut = truncate_to_caps(&s, dir, 101, 1000);
            assert!(!cut.is_empty());
        }
    }

    // ── Line phase ────────────────────────────────────────────────────────────

    #[test]
    fn head_line_cut_keeps_first_lines() {
        let s = numbered_lines(50);
        let cut = truncate_to_caps(&s, TruncateDirection::Head, 1_000_000, 10);
        assert_eq!(cut.lines().count(), 10);
        assert!(cut.starts_with("line 0"));
        assert!(cut.ends_with("line 9"));
    }

    #[test]
    fn tail_line_cut_keeps_last_lines() {
        let s = numbered_lines(50);
        let cut = truncate_to_caps(&s, TruncateDirection::Tail, 1_000_000, 10);
        assert_eq!(cut.lines().count(), 10);
        assert!(cut.starts_with("line 40"));
        assert!(cut.ends_with("line 49"));
    }

    #[test]
    fn head_tail_line_cut_reports_omitted_count() {
        let s = numbered_lines(100);
        let cut = truncate_to_caps(&s, TruncateDirection::HeadTail, 1_000_000, 10);
        assert!(cut.contains("line 0"));
        assert!(cut.contains("line 99"));
        assert!(cut.contains("[... 90 lines omitted ...]"));
    }

    #[test]
    fn line_counts_never_exceed_cap_plus_marker() {
        let s = numbered_lines(5_000);
        for dir in [TruncateDirection::Head, TruncateDirection::Tail] {
            let cut = truncate_to_caps(&s, dir, usize::MAX, 100);
            assert!(cut.lines().count() <= 100);
        }
        let cut = truncate_to_caps(&s, TruncateDirection::HeadTail, usize::MAX, 100);
        assert!(cut.lines().count() <= 101, "head+tail plus one marker line");
    }

    // ── Two-phase interaction ─────────────────────────────────────────────────

    #[test]
    fn single_huge_line_is_caught_by_byte_phase() {
        let s = "x".repeat(200_000);
        let t = truncate_output(&s, TruncateDirection::Head);
        assert!(t.truncated);
        // Body plus footer stays near the byte cap, nowhere near 200 kB.
        assert!(t.output.len() <= MAX_OUTPUT_BYTES + 256);
    }

    #[test]
    fn many_short_lines_are_caught_by_line_phase() {
        let s = (0..10_000).map(|_| "y").collect::<Vec<_>>().join("\n");
        let t = truncate_output(&s, TruncateDirection::Tail);
        assert!(t.truncated);
        let body_lines = t.output.lines().count();
        assert!(body_lines <= MAX_OUTPUT_LINES + 1, "got {body_lines} lines");
    }

    // ── Spill file ────────────────────────────────────────────────────────────

    #[test]
    fn truncated_output_is_spilled_in_full() {
        let s = "z".repeat(100_000);
        let t = truncate_output(&s, TruncateDirection::Head);
        let path = t.spill_path.expect("spill file must be written");
        let full = std::fs::read_to_string(&path).unwrap();
        assert_eq!(full.len(), 100_000);
        assert!(t.output.contains(&path.display().to_string()));
        assert!(t.output.contains("WARNING"));
        std::fs::remove_file(path).ok();
    }
}
