// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0

//! Typed event stream for an in-flight completion.
//!
//! A bare `Stream<Item = ResponseEvent>` has no notion of a terminal result
//! or of cancellation — a consumer can only find out the turn is done by
//! noticing the stream ended, and has no way to ask the producer to stop
//! early. [`EventStream`] wraps the wire-level event channel with that
//! missing state: `result()` resolves once to the terminal outcome, and
//! `cancel()` lets a consumer signal the producer without dropping the
//! stream outright.
//!
//! Exactly one task produces events (`push`/`end`/`fail`); any number of
//! tasks may consume them (`events`, though the underlying channel is
//! single-consumer so only the first caller gets a stream) or await the
//! result (`result`, which any number of callers may do concurrently).

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_stream::wrappers::ReceiverStream;

use crate::types::{ResponseEvent, StopReason, Usage};

/// Raw per-chunk stream produced by a provider's own wire-format parser.
/// Each provider keeps its own HTTP streaming and SSE/JSON-line parsing;
/// this is the shared type used to hand the parsed chunks to
/// [`wrap_response_stream`] for translation into an [`EventStream`].
pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<ResponseEvent>> + Send>>;

/// One event in a completion's stream, from the provider accepting the
/// request through to the terminal [`StreamEvent::Done`]/[`StreamEvent::Error`].
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The provider accepted the request and streaming has begun.
    Start,
    /// A new visible-text segment has begun.
    TextStart,
    /// A text delta within the current text segment.
    TextDelta(String),
    /// The current text segment is complete.
    TextEnd,
    /// A new thinking/reasoning segment has begun.
    ThinkingStart,
    /// A delta within the current thinking segment.
    ThinkingDelta(String),
    /// The current thinking segment is complete. Carries the provider's
    /// signature for the block, if it returned one (used to round-trip
    /// extended-thinking content back to the same provider on a later turn).
    ThinkingEnd { signature: Option<String> },
    /// The model began requesting a tool call at the given parallel-call index.
    ToolCallStart { index: u32, id: String, name: String },
    /// Accumulated JSON argument text for the tool call at `index`.
    ToolCallDelta { index: u32, arguments: String },
    /// The tool call at `index` has finished accumulating arguments.
    ToolCallEnd { index: u32 },
    /// The stream finished normally.
    Done(DoneEvent),
    /// The stream ended in an error.
    Error(String),
}

/// Terminal summary of a finished stream.
#[derive(Debug, Clone, Default)]
pub struct DoneEvent {
    pub stop_reason: StopReason,
    pub usage: Usage,
}

/// Typed, single-producer event stream for one completion request.
pub struct EventStream {
    tx: mpsc::Sender<StreamEvent>,
    rx: Mutex<Option<mpsc::Receiver<StreamEvent>>>,
    result_tx: watch::Sender<Option<Result<DoneEvent, String>>>,
    result_rx: watch::Receiver<Option<Result<DoneEvent, String>>>,
    terminated: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStream {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(64);
        let (result_tx, result_rx) = watch::channel(None);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            result_tx,
            result_rx,
            terminated: Arc::new(AtomicBool::new(false)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Push one event onto the stream. A no-op once the stream has reached
    /// a terminal state.
    pub async fn push(&self, event: StreamEvent) {
        if self.is_terminated() {
            return;
        }
        let _ = self.tx.send(event).await;
    }

    /// Finish the stream successfully, recording `done` as the result any
    /// number of `result()` callers can observe.
    pub async fn end(&self, done: DoneEvent) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.result_tx.send(Some(Ok(done.clone())));
        let _ = self.tx.send(StreamEvent::Done(done)).await;
    }

    /// Finish the stream with an error.
    pub async fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.result_tx.send(Some(Err(message.clone())));
        let _ = self.tx.send(StreamEvent::Error(message)).await;
    }

    /// Ask the producer to stop early. The producer is responsible for
    /// polling [`is_cancel_requested`](Self::is_cancel_requested) at its own
    /// await points (e.g. between reading chunks off the wire) and calling
    /// `fail`/`end` once it has unwound.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// True once a consumer has called [`cancel`](Self::cancel).
    pub fn is_cancel_requested(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// True once the stream has reached a terminal state (`Done` or `Error`).
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Await the terminal result. Any number of callers may await this
    /// concurrently; all resolve once `end()`/`fail()` is called.
    pub async fn result(&self) -> Result<DoneEvent, String> {
        let mut rx = self.result_rx.clone();
        loop {
            if let Some(r) = rx.borrow().clone() {
                return r;
            }
            if rx.changed().await.is_err() {
                return Err("event stream producer dropped before completion".to_string());
            }
        }
    }

    /// Take the consumer side of the event channel as a `Stream`. The
    /// underlying channel has one consumer: only the first call returns
    /// `Some`, later calls return `None`.
    pub fn events(&self) -> Option<impl Stream<Item = StreamEvent>> {
        self.rx
            .try_lock()
            .ok()
            .and_then(|mut guard| guard.take())
            .map(ReceiverStream::new)
    }
}

/// Drive a provider's raw [`ResponseStream`] to completion and re-publish it
/// as a typed [`EventStream`], translating wire-level chunks into the
/// Start/TextStart/TextDelta/TextEnd/ThinkingStart/.../ToolCallStart/Delta/End/
/// Done/Error taxonomy. Returns immediately; the translation runs on a
/// spawned task that owns the only producer handle to the returned stream.
pub fn wrap_response_stream(mut stream: ResponseStream) -> Arc<EventStream> {
    let es = Arc::new(EventStream::new());
    let producer = Arc::clone(&es);
    tokio::spawn(async move {
        producer.push(StreamEvent::Start).await;

        let mut in_text = false;
        let mut in_thinking = false;
        let mut seen_tool_indices: HashSet<u32> = HashSet::new();
        let mut usage = Usage::default();
        let mut saw_max_tokens = false;
        let mut had_tool_calls = false;
        let mut error: Option<String> = None;

        while let Some(item) = stream.next().await {
            if producer.is_cancel_requested() {
                producer.fail("cancelled").await;
                return;
            }
            match item {
                Ok(ResponseEvent::TextDelta(delta)) => {
                    if in_thinking {
                        in_thinking = false;
                        producer.push(StreamEvent::ThinkingEnd { signature: None }).await;
                    }
                    if delta.is_empty() {
                        continue;
                    }
                    if !in_text {
                        in_text = true;
                        producer.push(StreamEvent::TextStart).await;
                    }
                    producer.push(StreamEvent::TextDelta(delta)).await;
                }
                Ok(ResponseEvent::ThinkingDelta(delta)) => {
                    if in_text {
                        in_text = false;
                        producer.push(StreamEvent::TextEnd).await;
                    }
                    if !in_thinking {
                        in_thinking = true;
                        producer.push(StreamEvent::ThinkingStart).await;
                    }
                    producer.push(StreamEvent::ThinkingDelta(delta)).await;
                }
                Ok(ResponseEvent::ToolCall {
                    index,
                    id,
                    name,
                    arguments,
                }) => {
                    had_tool_calls = true;
                    if in_text {
                        in_text = false;
                        producer.push(StreamEvent::TextEnd).await;
                    }
                    if in_thinking {
                        in_thinking = false;
                        producer.push(StreamEvent::ThinkingEnd { signature: None }).await;
                    }
                    if seen_tool_indices.insert(index) {
                        producer
                            .push(StreamEvent::ToolCallStart { index, id, name })
                            .await;
                    }
                    producer
                        .push(StreamEvent::ToolCallDelta { index, arguments })
                        .await;
                }
                Ok(ResponseEvent::Usage {
                    input_tokens,
                    output_tokens,
                    cache_read_tokens,
                    cache_write_tokens,
                }) => {
                    usage.input_tokens += input_tokens;
                    usage.output_tokens += output_tokens;
                    usage.cache_read_tokens += cache_read_tokens;
                    usage.cache_write_tokens += cache_write_tokens;
                }
                Ok(ResponseEvent::MaxTokens) => saw_max_tokens = true,
                Ok(ResponseEvent::Done) => break,
                Ok(ResponseEvent::Error(e)) => error = Some(e),
                Err(e) => {
                    error = Some(e.to_string());
                    break;
                }
            }
        }

        if in_text {
            producer.push(StreamEvent::TextEnd).await;
        }
        if in_thinking {
            producer.push(StreamEvent::ThinkingEnd { signature: None }).await;
        }
        for index in seen_tool_indices {
            producer.push(StreamEvent::ToolCallEnd { index }).await;
        }

        if let Some(message) = error {
            producer.fail(message).await;
            return;
        }

        let stop_reason = if saw_max_tokens {
            StopReason::Length
        } else if had_tool_calls {
            StopReason::ToolUse
        } else {
            StopReason::Stop
        };
        producer.end(DoneEvent { stop_reason, usage }).await;
    });
    es
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_yields_pushed_items_in_order() {
        let es = EventStream::new();
        let mut events = es.events().expect("first events() call yields Some");
        es.push(StreamEvent::Start).await;
        es.push(StreamEvent::TextStart).await;
        es.push(StreamEvent::TextDelta("hi".into())).await;
        es.end(DoneEvent::default()).await;

        use futures::StreamExt;
        let mut seen = Vec::new();
        while let Some(ev) = events.next().await {
            let is_done = matches!(ev, StreamEvent::Done(_));
            seen.push(ev);
            if is_done {
                break;
            }
        }
        assert_eq!(seen.len(), 4);
        assert!(matches!(seen[0], StreamEvent::Start));
        assert!(matches!(seen[3], StreamEvent::Done(_)));
    }

    #[tokio::test]
    async fn events_can_only_be_taken_once() {
        let es = EventStream::new();
        assert!(es.events().is_some());
        assert!(es.events().is_none());
    }

    #[tokio::test]
    async fn result_resolves_after_end() {
        let es = EventStream::new();
        let done = DoneEvent {
            stop_reason: StopReason::Stop,
            usage: Usage::default(),
        };
        let es2 = Arc::new(es);
        let waiter = {
            let es2 = Arc::clone(&es2);
            tokio::spawn(async move { es2.result().await })
        };
        es2.end(done.clone()).await;
        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.stop_reason, done.stop_reason);
    }

    #[tokio::test]
    async fn result_surfaces_failure() {
        let es = EventStream::new();
        es.fail("boom").await;
        assert_eq!(es.result().await.unwrap_err(), "boom");
    }

    #[tokio::test]
    async fn is_terminated_reflects_end_and_fail() {
        let es = EventStream::new();
        assert!(!es.is_terminated());
        es.end(DoneEvent::default()).await;
        assert!(es.is_terminated());

        let es2 = EventStream::new();
        es2.fail("nope").await;
        assert!(es2.is_terminated());
    }

    #[tokio::test]
    async fn push_after_terminated_is_a_no_op() {
        let es = EventStream::new();
        let mut events = es.events().unwrap();
        es.end(DoneEvent::default()).await;
        es.push(StreamEvent::TextDelta("late".into())).await;
        // Drop the producer so the channel closes once drained, letting the
        // stream terminate instead of pending forever on more events.
        drop(es);

        use futures::StreamExt;
        let first = events.next().await.unwrap();
        assert!(matches!(first, StreamEvent::Done(_)));
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn cancel_sets_is_cancel_requested() {
        let es = EventStream::new();
        assert!(!es.is_cancel_requested());
        es.cancel();
        assert!(es.is_cancel_requested());
    }

    fn response_stream_from(events: Vec<anyhow::Result<ResponseEvent>>) -> ResponseStream {
        Box::pin(futures::stream::iter(events))
    }

    #[tokio::test]
    async fn wrap_response_stream_brackets_text_with_start_and_end() {
        let raw = response_stream_from(vec![
            Ok(ResponseEvent::TextDelta("hello".into())),
            Ok(ResponseEvent::TextDelta(" world".into())),
            Ok(ResponseEvent::Done),
        ]);
        let es = wrap_response_stream(raw);
        let mut events = es.events().unwrap();

        use futures::StreamExt;
        let mut seen = Vec::new();
        while let Some(ev) = events.next().await {
            let done = matches!(ev, StreamEvent::Done(_));
            seen.push(ev);
            if done {
                break;
            }
        }
        assert!(matches!(seen[0], StreamEvent::Start));
        assert!(matches!(seen[1], StreamEvent::TextStart));
        assert!(matches!(&seen[2], StreamEvent::TextDelta(t) if t == "hello"));
        assert!(matches!(&seen[3], StreamEvent::TextDelta(t) if t == " world"));
        assert!(matches!(seen[4], StreamEvent::TextEnd));
        assert!(matches!(seen[5], StreamEvent::Done(_)));

        let result = es.result().await.unwrap();
        assert_eq!(result.stop_reason, StopReason::Stop);
    }

    #[tokio::test]
    async fn wrap_response_stream_emits_tool_call_start_once_per_index() {
        let raw = response_stream_from(vec![
            Ok(ResponseEvent::ToolCall {
                index: 0,
                id: "call_1".into(),
                name: "shell".into(),
                arguments: "{\"cmd\":".into(),
            }),
            Ok(ResponseEvent::ToolCall {
                index: 0,
                id: String::new(),
                name: String::new(),
                arguments: "\"ls\"}".into(),
            }),
            Ok(ResponseEvent::Done),
        ]);
        let es = wrap_response_stream(raw);
        let mut events = es.events().unwrap();

        use futures::StreamExt;
        let mut starts = 0;
        let mut deltas = 0;
        let mut ends = 0;
        while let Some(ev) = events.next().await {
            match ev {
                StreamEvent::ToolCallStart { .. } => starts += 1,
                StreamEvent::ToolCallDelta { .. } => deltas += 1,
                StreamEvent::ToolCallEnd { .. } => ends += 1,
                StreamEvent::Done(_) => break,
                _ => {}
            }
        }
        assert_eq!(starts, 1);
        assert_eq!(deltas, 2);
        assert_eq!(ends, 1);

        let result = es.result().await.unwrap();
        assert_eq!(result.stop_reason, StopReason::ToolUse);
    }

    #[tokio::test]
    async fn wrap_response_stream_surfaces_max_tokens_as_length_stop_reason() {
        let raw = response_stream_from(vec![
            Ok(ResponseEvent::TextDelta("partial".into())),
            Ok(ResponseEvent::MaxTokens),
            Ok(ResponseEvent::Done),
        ]);
        let es = wrap_response_stream(raw);
        let mut events = es.events().unwrap();
        use futures::StreamExt;
        while events.next().await.is_some() {}
        let result = es.result().await.unwrap();
        assert_eq!(result.stop_reason, StopReason::Length);
    }

    #[tokio::test]
    async fn wrap_response_stream_surfaces_provider_error() {
        let raw = response_stream_from(vec![Err(anyhow::anyhow!("provider exploded"))]);
        let es = wrap_response_stream(raw);
        let mut events = es.events().unwrap();
        use futures::StreamExt;
        while events.next().await.is_some() {}
        assert_eq!(es.result().await.unwrap_err(), "provider exploded");
    }
}
