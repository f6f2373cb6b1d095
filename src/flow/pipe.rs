// SPDX-License-Identifier: MIT

//! Event pipe between the engine and its caller
//!
//! Outbound: a bounded FIFO of [`OutboundEvent`]s, read by the caller as an
//! [`EventStream`] of NDJSON lines. Inbound: [`FeedbackMessage`]s routed by
//! `(workflow_id, agent_id)` to whichever elicitation is waiting for them.

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::adk::error::{FlowError, Result};

/// What an outbound event says
#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    Rewind,
    AnchorStart,
    NewStep { kind: String, content: String },
    /// Terminal control event; the stream ends after it
    End { kind: String, content: String },
    /// Pre-encoded JSON line, sent without an envelope
    Raw(String),
    Append {
        workflow_id: String,
        agent_id: String,
        kind: String,
        content: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    pub role: String,
    pub thread: String,
    pub emission: Emission,
}

#[derive(Serialize)]
struct Envelope<'a> {
    channel: &'a str,
    command: &'a str,
    role: &'a str,
    data: Value,
    thread: &'a str,
}

impl OutboundEvent {
    pub fn new(role: impl Into<String>, emission: Emission) -> Self {
        Self {
            role: role.into(),
            thread: String::new(),
            emission,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self.emission, Emission::End { .. })
    }

    /// One newline-terminated JSON line
    pub fn encode(&self) -> String {
        let (channel, command, data) = match &self.emission {
            Emission::Raw(body) => return format!("{}\n", body),
            Emission::Rewind => ("prompt", "rewind", json!(1)),
            Emission::AnchorStart => ("prompt", "anchor_start", json!(1)),
            Emission::NewStep { kind, content } => (
                "progress",
                "new_step",
                json!({"type": kind, "content": content}),
            ),
            Emission::End { kind, content } => (
                "control",
                "end",
                json!({"type": kind, "content": content}),
            ),
            Emission::Append {
                workflow_id,
                agent_id,
                kind,
                content,
            } => (
                "prompt",
                "append",
                json!({
                    "workflow_id": workflow_id,
                    "agent_id": agent_id,
                    "type": kind,
                    "content": content,
                }),
            ),
        };

        let envelope = Envelope {
            channel,
            command,
            role: &self.role,
            data,
            thread: &self.thread,
        };
        // Serializing a struct of strings and a Value cannot fail.
        let line = serde_json::to_string(&envelope).unwrap_or_default();
        format!("{}\n", line)
    }
}

/// Outcome the caller picks for an elicitation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackStatus {
    Cancel,
    Refuse,
    /// Abort the whole run
    End,
    /// Also the fallback for statuses this engine does not know
    #[serde(other)]
    Accept,
}

/// One inbound message from the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackMessage {
    pub status: FeedbackStatus,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub workflow_id: String,
    #[serde(default)]
    pub agent_id: String,
}

type FeedbackKey = (String, String);

#[derive(Default)]
struct RouterState {
    waiters: HashMap<FeedbackKey, VecDeque<oneshot::Sender<FeedbackMessage>>>,
    parked: HashMap<FeedbackKey, VecDeque<FeedbackMessage>>,
    parked_len: usize,
}

/// Per-key wait map for elicitation replies.
///
/// A message nobody waits for yet is parked under its key and handed to the
/// next waiter with that key; other keys never see it.
pub struct FeedbackRouter {
    state: Mutex<RouterState>,
    capacity: usize,
}

impl FeedbackRouter {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RouterState::default()),
            capacity,
        }
    }

    /// Register interest in the next message for `(workflow_id, agent_id)`
    pub async fn wait(&self, workflow_id: &str, agent_id: &str) -> oneshot::Receiver<FeedbackMessage> {
        let key = (workflow_id.to_string(), agent_id.to_string());
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().await;

        let parked = state.parked.get_mut(&key).and_then(VecDeque::pop_front);
        match parked {
            Some(message) => {
                state.parked_len -= 1;
                let _ = tx.send(message);
            }
            None => {
                let queue = state.waiters.entry(key).or_default();
                queue.retain(|waiter| !waiter.is_closed());
                queue.push_back(tx);
            }
        }
        rx
    }

    /// Hand `message` to the waiter with its key, or park it
    pub async fn deliver(&self, message: FeedbackMessage) -> Result<()> {
        let key = (message.workflow_id.clone(), message.agent_id.clone());
        let mut state = self.state.lock().await;

        let mut message = message;
        if let Some(queue) = state.waiters.get_mut(&key) {
            while let Some(tx) = queue.pop_front() {
                match tx.send(message) {
                    Ok(()) => {
                        log::debug!("Feedback delivered to {}/{}", key.0, key.1);
                        return Ok(());
                    }
                    // Waiter gave up (timeout); try the next one.
                    Err(returned) => message = returned,
                }
            }
        }

        if state.parked_len >= self.capacity {
            return Err(FlowError::Feedback(format!(
                "inbound queue full ({} messages)",
                self.capacity
            )));
        }
        log::info!("No waiter for {}/{}, parking feedback", key.0, key.1);
        state.parked.entry(key).or_default().push_back(message);
        state.parked_len += 1;
        Ok(())
    }

    /// Drop every waiter; their receivers resolve with an error
    pub async fn release_all(&self) {
        let mut state = self.state.lock().await;
        state.waiters.clear();
    }

    pub async fn parked_len(&self) -> usize {
        self.state.lock().await.parked_len
    }

    /// Registered waiters, including ones whose receiver is already gone
    pub async fn waiting_len(&self) -> usize {
        self.state.lock().await.waiters.values().map(VecDeque::len).sum()
    }
}

/// Engine side of one run's duplex channel
pub struct EventPipe {
    tx: mpsc::Sender<OutboundEvent>,
    feedback: FeedbackRouter,
    cancel: CancellationToken,
    ended: AtomicBool,
}

impl EventPipe {
    /// Fresh queues for one run
    pub fn new(capacity: usize) -> (Arc<Self>, EventStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let pipe = Arc::new(Self {
            tx,
            feedback: FeedbackRouter::new(capacity),
            cancel: CancellationToken::new(),
            ended: AtomicBool::new(false),
        });
        (
            pipe,
            EventStream {
                rx: ReceiverStream::new(rx),
                done: false,
            },
        )
    }

    pub async fn emit(&self, event: OutboundEvent) -> Result<()> {
        if let Emission::Append { content, .. } = &event.emission {
            if content.is_empty() {
                return Ok(());
            }
        }
        self.tx.send(event).await.map_err(|_| FlowError::PipeClosed)
    }

    /// `append` event attributed to an agent
    pub async fn append(
        &self,
        workflow_id: &str,
        agent_id: &str,
        role: &str,
        kind: &str,
        content: impl Into<String>,
    ) -> Result<()> {
        self.emit(OutboundEvent::new(
            role,
            Emission::Append {
                workflow_id: workflow_id.to_string(),
                agent_id: agent_id.to_string(),
                kind: kind.to_string(),
                content: content.into(),
            },
        ))
        .await
    }

    pub async fn raw(&self, body: String) -> Result<()> {
        self.emit(OutboundEvent::new("", Emission::Raw(body))).await
    }

    /// Emit the terminal event. Only the first call emits.
    pub async fn end(&self, content: impl Into<String>) -> Result<()> {
        if self.ended.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.emit(OutboundEvent::new(
            "",
            Emission::End {
                kind: "markdown".to_string(),
                content: content.into(),
            },
        ))
        .await
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Abort the run: cancel suspended work and end the stream
    pub async fn abort(&self) -> Result<()> {
        log::warn!("Run aborted");
        self.cancel.cancel();
        self.feedback.release_all().await;
        self.end("").await
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn feedback(&self) -> &FeedbackRouter {
        &self.feedback
    }
}

/// Caller side of the outbound queue.
///
/// Yields NDJSON lines; finishes after the `end` event or once every writer
/// is gone.
pub struct EventStream {
    rx: ReceiverStream<OutboundEvent>,
    done: bool,
}

impl Stream for EventStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        if self.done {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.rx).poll_next(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_end() {
                    self.done = true;
                    self.rx.close();
                }
                Poll::Ready(Some(event.encode()))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn parse(line: &str) -> Value {
        assert!(line.ends_with('\n'));
        serde_json::from_str(line.trim_end()).unwrap()
    }

    #[test]
    fn test_encode_command_table() {
        let rewind = parse(&OutboundEvent::new("llm", Emission::Rewind).encode());
        assert_eq!(rewind["command"], "rewind");
        assert_eq!(rewind["data"], 1);
        assert_eq!(rewind["role"], "llm");

        let anchor = parse(&OutboundEvent::new("", Emission::AnchorStart).encode());
        assert_eq!(anchor["command"], "anchor_start");

        let step = parse(
            &OutboundEvent::new(
                "",
                Emission::NewStep {
                    kind: "markdown".into(),
                    content: "step 2".into(),
                },
            )
            .encode(),
        );
        assert_eq!(step["command"], "new_step");
        assert_eq!(step["channel"], "progress");
        assert_eq!(step["data"]["content"], "step 2");

        let end = parse(
            &OutboundEvent::new(
                "",
                Emission::End {
                    kind: "markdown".into(),
                    content: String::new(),
                },
            )
            .encode(),
        );
        assert_eq!(end["channel"], "control");
        assert_eq!(end["command"], "end");
    }

    #[test]
    fn test_encode_append_carries_ids() {
        let line = OutboundEvent::new(
            "agent",
            Emission::Append {
                workflow_id: "w".into(),
                agent_id: "a".into(),
                kind: "markdown".into(),
                content: "hello".into(),
            },
        )
        .encode();
        let v = parse(&line);
        assert_eq!(v["command"], "append");
        assert_eq!(v["data"]["workflow_id"], "w");
        assert_eq!(v["data"]["agent_id"], "a");
        assert_eq!(v["thread"], "");
    }

    #[test]
    fn test_raw_has_no_envelope() {
        let line = OutboundEvent::new("", Emission::Raw(r#"{"command":"elicit"}"#.into())).encode();
        assert_eq!(line, "{\"command\":\"elicit\"}\n");
    }

    #[tokio::test]
    async fn test_stream_stops_after_end() {
        let (pipe, stream) = EventPipe::new(8);
        pipe.append("w", "a", "agent", "markdown", "one").await.unwrap();
        pipe.end("").await.unwrap();
        pipe.end("again").await.unwrap();

        let lines: Vec<String> = stream.collect().await;
        assert_eq!(lines.len(), 2);
        assert_eq!(parse(&lines[1])["command"], "end");
    }

    #[tokio::test]
    async fn test_empty_append_is_skipped() {
        let (pipe, stream) = EventPipe::new(8);
        pipe.append("w", "a", "agent", "markdown", "").await.unwrap();
        drop(pipe);
        let lines: Vec<String> = stream.collect().await;
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn test_emit_after_stream_dropped_fails() {
        let (pipe, stream) = EventPipe::new(8);
        drop(stream);
        let err = pipe.append("w", "a", "", "markdown", "x").await.unwrap_err();
        assert!(matches!(err, FlowError::PipeClosed));
    }

    #[test]
    fn test_unknown_status_is_accept() {
        let msg: FeedbackMessage = serde_json::from_value(json!({
            "status": "whatever", "agent_id": "a", "workflow_id": "w"
        }))
        .unwrap();
        assert_eq!(msg.status, FeedbackStatus::Accept);
        assert!(msg.data.is_null());
    }

    #[test]
    fn test_known_statuses_keep_their_names() {
        for (name, status) in [
            ("accept", FeedbackStatus::Accept),
            ("cancel", FeedbackStatus::Cancel),
            ("refuse", FeedbackStatus::Refuse),
            ("end", FeedbackStatus::End),
        ] {
            assert_eq!(serde_json::to_value(status).unwrap(), json!(name));
            let parsed: FeedbackStatus = serde_json::from_value(json!(name)).unwrap();
            assert_eq!(parsed, status);
        }
    }

    fn feedback(agent: &str, data: &str) -> FeedbackMessage {
        FeedbackMessage {
            status: FeedbackStatus::Accept,
            data: json!(data),
            workflow_id: "w".into(),
            agent_id: agent.into(),
        }
    }

    #[tokio::test]
    async fn test_router_wakes_only_matching_waiter() {
        let router = FeedbackRouter::new(4);
        let rx_a = router.wait("w", "a").await;
        let mut rx_b = router.wait("w", "b").await;

        router.deliver(feedback("a", "x")).await.unwrap();

        assert_eq!(rx_a.await.unwrap().data, "x");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_router_parks_until_waiter_arrives() {
        let router = FeedbackRouter::new(4);
        router.deliver(feedback("b", "early")).await.unwrap();
        assert_eq!(router.parked_len().await, 1);

        let mut rx_a = router.wait("w", "a").await;
        assert!(rx_a.try_recv().is_err());

        let rx_b = router.wait("w", "b").await;
        assert_eq!(rx_b.await.unwrap().data, "early");
        assert_eq!(router.parked_len().await, 0);
    }

    #[tokio::test]
    async fn test_router_skips_abandoned_waiter() {
        let router = FeedbackRouter::new(4);
        drop(router.wait("w", "a").await);
        let rx = router.wait("w", "a").await;
        router.deliver(feedback("a", "second")).await.unwrap();
        assert_eq!(rx.await.unwrap().data, "second");
    }

    #[tokio::test]
    async fn test_router_prunes_timed_out_waiters() {
        let router = FeedbackRouter::new(4);
        for _ in 0..3 {
            drop(router.wait("w", "a").await);
        }
        let rx = router.wait("w", "a").await;
        assert_eq!(router.waiting_len().await, 1);

        router.deliver(feedback("a", "late")).await.unwrap();
        assert_eq!(rx.await.unwrap().data, "late");
        assert_eq!(router.waiting_len().await, 0);
    }

    #[tokio::test]
    async fn test_router_overflow() {
        let router = FeedbackRouter::new(1);
        router.deliver(feedback("a", "1")).await.unwrap();
        let err = router.deliver(feedback("a", "2")).await.unwrap_err();
        assert!(matches!(err, FlowError::Feedback(_)));
    }

    #[tokio::test]
    async fn test_abort_releases_waiters_and_ends() {
        let (pipe, stream) = EventPipe::new(8);
        let rx = pipe.feedback().wait("w", "a").await;
        pipe.abort().await.unwrap();

        assert!(rx.await.is_err());
        assert!(pipe.cancel_token().is_cancelled());
        let lines: Vec<String> = stream.collect().await;
        assert_eq!(lines.len(), 1);
    }
}
