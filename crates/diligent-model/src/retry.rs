// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::{
    error::ProviderError,
    provider::{provider_stream, Provider, ProviderEvent, ProviderRequest, ProviderStream},
};

/// Exponential-backoff parameters for [`stream_with_retry`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following attempt `n` (1-indexed):
    /// `min(max, max(base · 2^(n-1), retry_after))`.  The server-suggested
    /// `retry_after` floor is honoured but still capped at `max_delay_ms`.
    pub fn delay_ms(&self, attempt: u32, retry_after_ms: Option<u64>) -> u64 {
        let shift = attempt.saturating_sub(1).min(32);
        let exponential = self.base_delay_ms.saturating_mul(1u64 << shift);
        exponential.max(retry_after_ms.unwrap_or(0)).min(self.max_delay_ms)
    }
}

/// Called before each backoff sleep with `(attempt, delay_ms, error)`.
pub type OnRetry = Box<dyn Fn(u32, u64, &ProviderError) + Send + Sync>;

/// Re-drive a provider call on retryable errors.
///
/// Non-terminal events from each attempt are forwarded to the returned
/// stream as they arrive; the terminal transition is forwarded exactly once:
/// either the first `Done`, or the error that exhausted the policy.  The
/// backoff sleep wakes early on cancellation and terminates the stream with
/// a synthesised cancellation error.
pub fn stream_with_retry(
    provider: Arc<dyn Provider>,
    req: ProviderRequest,
    policy: RetryPolicy,
    on_retry: Option<OnRetry>,
) -> ProviderStream {
    let outer = provider_stream();
    let out = outer.clone();

    tokio::spawn(async move {
        for attempt in 1..=policy.max_attempts.max(1) {
            if req.cancel.is_cancelled() {
                out.push(ProviderEvent::Error {
                    error: ProviderError::cancelled(),
                });
                return;
            }

            let inner = provider.stream(req.clone());
            let mut captured: Option<ProviderError> = None;
            let mut finished = false;
            while let Some(event) = inner.next().await {
                match event {
                    done @ ProviderEvent::Done { .. } => {
                        out.push(done);
                        finished = true;
                        break;
                    }
                    ProviderEvent::Error { error } => {
                        captured = Some(error);
                        break;
                    }
                    other => out.push(other),
                }
            }
            // Consume the inner terminal future so a failed attempt never
            // leaves a dangling rejection behind.
            let _ = inner.result().await;

            if finished {
                return;
            }
            let Some(error) = captured else {
                // The inner stream drained without a terminal event.  The
                // outer contract still owes its consumer exactly one
                // terminal, so surface it as an unknown failure.
                out.push(ProviderEvent::Error {
                    error: ProviderError::Unknown {
                        message: "provider stream ended without done or error".into(),
                    },
                });
                return;
            };

            if !error.is_retryable() || attempt >= policy.max_attempts {
                out.push(ProviderEvent::Error { error });
                return;
            }

            let delay = policy.delay_ms(attempt, error.retry_after_ms());
            warn!(attempt, delay_ms = delay, error = %error, "retrying provider call");
            if let Some(cb) = &on_retry {
                cb(attempt, delay, &error);
            }
            tokio::select! {
                _ = req.cancel.cancelled() => {
                    out.push(ProviderEvent::Error {
                        error: ProviderError::cancelled(),
                    });
                    return;
                }
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
            }
        }
    });

    outer
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedProvider;
    use crate::types::StopReason;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn text_script(text: &str) -> Vec<ProviderEvent> {
        let mut asm = crate::provider::MessageAssembler::new("mock-model");
        let mut events = asm.text_delta(text);
        events.extend(asm.finish(StopReason::EndTurn));
        events
    }

    fn err_script(error: ProviderError) -> Vec<ProviderEvent> {
        vec![ProviderEvent::Error { error }]
    }

    // ── Delay computation ─────────────────────────────────────────────────────

    #[test]
    fn delay_doubles_per_attempt() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_ms(1, None), 1_000);
        assert_eq!(p.delay_ms(2, None), 2_000);
        assert_eq!(p.delay_ms(3, None), 4_000);
    }

    #[test]
    fn delay_is_capped_at_max() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_ms(10, None), 30_000);
    }

    #[test]
    fn retry_after_raises_the_floor() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_ms(1, Some(5_000)), 5_000);
        // But never above the cap.
        assert_eq!(p.delay_ms(1, Some(90_000)), 30_000);
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_ms(u32::MAX, None), 30_000);
    }

    // ── Retry flow ────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn success_on_first_attempt_forwards_done() {
        let provider = Arc::new(ScriptedProvider::new(vec![text_script("ok")]));
        let stream = stream_with_retry(
            Arc::clone(&provider) as Arc<dyn Provider>,
            ProviderRequest::new("m", vec![]),
            RetryPolicy::default(),
            None,
        );
        let result = stream.result().await.unwrap();
        assert_eq!(result.message.text(), "ok");
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_rate_limit_then_succeeds() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            err_script(ProviderError::RateLimit {
                message: "429".into(),
                retry_after_ms: None,
            }),
            err_script(ProviderError::RateLimit {
                message: "429".into(),
                retry_after_ms: None,
            }),
            text_script("third time lucky"),
        ]));
        let retries = Arc::new(AtomicU32::new(0));
        let r = Arc::clone(&retries);
        let stream = stream_with_retry(
            Arc::clone(&provider) as Arc<dyn Provider>,
            ProviderRequest::new("m", vec![]),
            RetryPolicy::default(),
            Some(Box::new(move |attempt, _, _| {
                r.fetch_max(attempt, Ordering::SeqCst);
            })),
        );
        let result = stream.result().await.unwrap();
        assert_eq!(result.message.text(), "third time lucky");
        assert_eq!(provider.calls(), 3);
        assert_eq!(retries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_stops_after_one_attempt() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            err_script(ProviderError::Auth {
                message: "401".into(),
            }),
            text_script("never reached"),
        ]));
        let stream = stream_with_retry(
            Arc::clone(&provider) as Arc<dyn Provider>,
            ProviderRequest::new("m", vec![]),
            RetryPolicy::default(),
            None,
        );
        let err = stream.result().await.unwrap_err();
        let pe = err.downcast_ref::<ProviderError>().unwrap();
        assert_eq!(pe.kind(), "auth");
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded_by_policy() {
        let provider = Arc::new(ScriptedProvider::new(
            (0..10)
                .map(|_| {
                    err_script(ProviderError::Overloaded {
                        message: "529".into(),
                    })
                })
                .collect(),
        ));
        let stream = stream_with_retry(
            Arc::clone(&provider) as Arc<dyn Provider>,
            ProviderRequest::new("m", vec![]),
            RetryPolicy {
                max_attempts: 3,
                ..Default::default()
            },
            None,
        );
        let err = stream.result().await.unwrap_err();
        assert_eq!(err.downcast_ref::<ProviderError>().unwrap().kind(), "overloaded");
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_terminal_events_are_forwarded_across_attempts() {
        let mut asm = crate::provider::MessageAssembler::new("m");
        let mut partial = asm.text_delta("par");
        partial.push(ProviderEvent::Error {
            error: ProviderError::Network {
                message: "reset".into(),
            },
        });
        let provider = Arc::new(ScriptedProvider::new(vec![partial, text_script("done")]));
        let stream = stream_with_retry(
            Arc::clone(&provider) as Arc<dyn Provider>,
            ProviderRequest::new("m", vec![]),
            RetryPolicy::default(),
            None,
        );
        let events = stream.collect().await;
        // The partial delta from the failed attempt and the full second
        // attempt both reach the consumer; only one terminal is present.
        let deltas: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ProviderEvent::TextDelta { .. }))
            .collect();
        assert_eq!(deltas.len(), 2);
        let terminals = events
            .iter()
            .filter(|e| matches!(e, ProviderEvent::Done { .. } | ProviderEvent::Error { .. }))
            .count();
        assert_eq!(terminals, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_fails_without_calling_provider() {
        let provider = Arc::new(ScriptedProvider::new(vec![text_script("unused")]));
        let req = ProviderRequest::new("m", vec![]);
        req.cancel.cancel();
        let stream = stream_with_retry(
            Arc::clone(&provider) as Arc<dyn Provider>,
            req,
            RetryPolicy::default(),
            None,
        );
        let err = stream.result().await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff_sleep() {
        let provider = Arc::new(ScriptedProvider::new(vec![err_script(
            ProviderError::RateLimit {
                message: "429".into(),
                // A floor far above the auto-advanced test clock would stall
                // a non-interruptible sleep.
                retry_after_ms: Some(30_000),
            },
        )]));
        let req = ProviderRequest::new("m", vec![]);
        let cancel = req.cancel.clone();
        let stream = stream_with_retry(
            Arc::clone(&provider) as Arc<dyn Provider>,
            req,
            RetryPolicy::default(),
            Some(Box::new(move |_, _, _| cancel.cancel())),
        );
        let err = stream.result().await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        assert_eq!(provider.calls(), 1);
    }
}
