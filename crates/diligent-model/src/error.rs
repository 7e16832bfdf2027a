// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Closed provider error taxonomy.
///
/// Vendor failures are mapped onto these six kinds at the driver boundary so
/// the retry wrapper can be a pure function of `(kind, attempt, headers)` and
/// never needs to understand vendor-specific payloads.  Cancellation is
/// synthesised as a non-retryable [`ProviderError::Unknown`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// HTTP 429.  `retry_after_ms` is extracted from the `retry-after-ms`
    /// (milliseconds) or `retry-after` (seconds) response header when present.
    #[error("rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after_ms: Option<u64>,
    },
    /// HTTP 529.
    #[error("provider overloaded: {message}")]
    Overloaded { message: String },
    /// HTTP 400 whose body indicates the request exceeded the model's
    /// context window.  Non-retryable; the session manager reacts to this by
    /// compacting and re-running once.
    #[error("context window exceeded: {message}")]
    ContextOverflow { message: String },
    /// HTTP 401 / 403.
    #[error("authentication failed: {message}")]
    Auth { message: String },
    /// Transport-level failure (refused/reset/timeout/DNS).
    #[error("network error: {message}")]
    Network { message: String },
    /// Anything else, including synthesised cancellation.
    #[error("provider error: {message}")]
    Unknown { message: String },
}

impl ProviderError {
    /// Whether exponential-backoff re-attempts are sound for this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit { .. } | Self::Overloaded { .. } | Self::Network { .. }
        )
    }

    /// Server-suggested minimum delay before the next attempt.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimit { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }

    /// Stable kind name for logs and serialized error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimit { .. } => "rate_limit",
            Self::Overloaded { .. } => "overloaded",
            Self::ContextOverflow { .. } => "context_overflow",
            Self::Auth { .. } => "auth",
            Self::Network { .. } => "network",
            Self::Unknown { .. } => "unknown",
        }
    }

    /// Synthesised error for a cancelled request.  Deliberately classified
    /// `Unknown` so it is never retried.
    pub fn cancelled() -> Self {
        Self::Unknown {
            message: "request cancelled".into(),
        }
    }

    /// Map an HTTP error response onto the taxonomy.
    ///
    /// `retry_after_ms` / `retry_after_secs` carry the raw header values when
    /// the response had them; unparsable values are ignored.
    pub fn from_status(
        status: u16,
        body: &str,
        retry_after_ms: Option<&str>,
        retry_after_secs: Option<&str>,
    ) -> Self {
        let message = format!("HTTP {status}: {}", truncate_body(body));
        match status {
            429 => {
                let ms = retry_after_ms
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .or_else(|| {
                        retry_after_secs
                            .and_then(|v| v.trim().parse::<u64>().ok())
                            .map(|s| s * 1000)
                    });
                Self::RateLimit {
                    message,
                    retry_after_ms: ms,
                }
            }
            529 => Self::Overloaded { message },
            400 if looks_like_context_overflow(body) => Self::ContextOverflow { message },
            401 | 403 => Self::Auth { message },
            _ => Self::Unknown { message },
        }
    }

    /// Map a transport-level failure (reqwest) onto the taxonomy.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        let message = err.to_string();
        if err.is_connect() || err.is_timeout() || err.is_request() || is_network_text(&message) {
            Self::Network { message }
        } else {
            Self::Unknown { message }
        }
    }
}

/// Substring match for context-window overflow phrasing.
///
/// Shared between the driver classification (typed 400 body) and the session
/// manager's reactive-compaction trigger, which only sees the serialized
/// error text after it crossed the `agent_end` boundary.
pub fn looks_like_context_overflow(text: &str) -> bool {
    let lower = text.to_lowercase();
    ["context length", "maximum context", "too many tokens", "exceeds the model", "prompt is too long"]
        .iter()
        .any(|phrase| lower.contains(phrase))
}

fn is_network_text(message: &str) -> bool {
    ["econnrefused", "econnreset", "etimedout", "fetch failed", "network"]
        .iter()
        .any(|marker| message.to_lowercase().contains(marker))
}

/// Error bodies can embed entire rejected prompts; cap what we carry around.
fn truncate_body(body: &str) -> &str {
    let end = body
        .char_indices()
        .take_while(|(i, _)| *i < 500)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    &body[..end]
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
