// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Shared terminal error.  Stored behind an `Arc` so every consumer of the
/// stream (iterator, observer, result future) can observe the same failure;
/// typed errors such as `ProviderError` remain reachable via `downcast_ref`.
pub type StreamError = Arc<anyhow::Error>;

/// A typed asynchronous event channel that is simultaneously:
///
/// - a **lazy sequence** ([`next`](EventStream::next) yields events in push
///   order until the stream is done),
/// - a **terminal-result future** ([`result`](EventStream::result) resolves
///   once the stream completes or fails),
/// - a **multi-observer broadcast** ([`subscribe`](EventStream::subscribe)
///   invokes every observer synchronously on each push).
///
/// The three capabilities share a single terminal transition: completion is
/// decided either by a pushed event for which `is_complete` returns true
/// (the result is then computed by `extract`), or explicitly via
/// [`end`](EventStream::end) / [`fail`](EventStream::fail).  The transition
/// happens exactly once; pushes after it are ignored.
///
/// `push`, `end` and `fail` are synchronous and never await.  Events pushed
/// before termination remain queued, so a consumer that starts iterating
/// after termination still drains them before observing the end.
pub struct EventStream<E, R> {
    inner: Arc<Inner<E, R>>,
}

impl<E, R> Clone for EventStream<E, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<E, R> {
    state: Mutex<State<E, R>>,
    notify: Notify,
    #[allow(clippy::type_complexity)]
    is_complete: Box<dyn Fn(&E) -> bool + Send + Sync>,
    #[allow(clippy::type_complexity)]
    extract: Box<dyn Fn(&E) -> anyhow::Result<R> + Send + Sync>,
}

struct State<E, R> {
    queue: VecDeque<E>,
    observers: Vec<Box<dyn FnMut(&E) + Send>>,
    done: bool,
    result: Option<Result<R, StreamError>>,
}

impl<E, R: Clone> EventStream<E, R> {
    pub fn new(
        is_complete: impl Fn(&E) -> bool + Send + Sync + 'static,
        extract: impl Fn(&E) -> anyhow::Result<R> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    observers: Vec::new(),
                    done: false,
                    result: None,
                }),
                notify: Notify::new(),
                is_complete: Box::new(is_complete),
                extract: Box::new(extract),
            }),
        }
    }

    /// Enqueue `event` for the consumer and fan it out to observers.
    ///
    /// If `is_complete(event)` holds, the stream transitions to done and the
    /// extracted value resolves the terminal future.  An `extract` failure
    /// fails the stream instead, but the event is still delivered to the
    /// queue.  Pushes after the terminal transition are ignored.
    pub fn push(&self, event: E) {
        {
            let mut st = self.inner.state.lock().unwrap();
            if st.done {
                return;
            }
            for obs in st.observers.iter_mut() {
                obs(&event);
            }
            if (self.inner.is_complete)(&event) {
                st.result = Some(match (self.inner.extract)(&event) {
                    Ok(r) => Ok(r),
                    Err(e) => Err(Arc::new(e)),
                });
                st.done = true;
            }
            st.queue.push_back(event);
        }
        self.inner.notify.notify_waiters();
    }

    /// Force completion with an explicit result, without emitting a terminal
    /// event.  No-op if the stream already terminated.
    pub fn end(&self, result: R) {
        {
            let mut st = self.inner.state.lock().unwrap();
            if st.done {
                return;
            }
            st.done = true;
            st.result = Some(Ok(result));
        }
        self.inner.notify.notify_waiters();
    }

    /// Reject the terminal future.  Queued events stay readable; no further
    /// events are delivered after the failure.
    pub fn fail(&self, err: impl Into<anyhow::Error>) {
        {
            let mut st = self.inner.state.lock().unwrap();
            if st.done {
                return;
            }
            st.done = true;
            st.result = Some(Err(Arc::new(err.into())));
        }
        self.inner.notify.notify_waiters();
    }

    /// Register a synchronous observer.  Observers see every event pushed
    /// after registration and before the terminal transition; they never see
    /// events pushed earlier (past-agnostic) or later (ignored pushes).
    pub fn subscribe(&self, f: impl FnMut(&E) + Send + 'static) {
        let mut st = self.inner.state.lock().unwrap();
        st.observers.push(Box::new(f));
    }

    /// Pull the next event in push order; `None` once the stream is done and
    /// the queue is drained.
    pub async fn next(&self) -> Option<E> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register for wakeup BEFORE the state check so a push landing
            // between check and await is not missed.
            notified.as_mut().enable();
            {
                let mut st = self.inner.state.lock().unwrap();
                if let Some(e) = st.queue.pop_front() {
                    return Some(e);
                }
                if st.done {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// The terminal future: resolves with the extracted/explicit result once
    /// the stream completes, or with the failure from [`fail`].
    pub async fn result(&self) -> Result<R, StreamError> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let st = self.inner.state.lock().unwrap();
                if let Some(r) = &st.result {
                    return r.clone();
                }
            }
            notified.await;
        }
    }

    /// True once the terminal transition happened (events may still be queued).
    pub fn is_done(&self) -> bool {
        self.inner.state.lock().unwrap().done
    }

    /// Drain every remaining event into a `Vec`, then return.  Test helper,
    /// but also useful for callers that only care about the terminal result.
    pub async fn collect(&self) -> Vec<E> {
        let mut out = Vec::new();
        while let Some(e) = self.next().await {
            out.push(e);
        }
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
