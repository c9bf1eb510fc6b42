//! Transport envelopes and the per-session event sink.
//!
//! Clients send `{"type": ...}` messages; the server answers with
//! `{"event": ..., "data": ...}` envelopes. The [`EventSink`] sits between
//! the agent loop and whatever socket is currently attached:
//!
//! - events flow through a bounded channel (default 256); when the client
//!   cannot keep up, `emit` blocks the loop instead of buffering unboundedly;
//! - `status` events are advisory and are dropped on a full buffer;
//! - the attached sender can be swapped at any time (reconnects); events
//!   emitted while no transport is attached are dropped, not replayed;
//! - after `done` passes through, the sink locks and silently discards
//!   anything further, making "no event after done" structural.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Messages a client may send over the socket.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A user question; starts a turn.
    Message { text: String },
    /// Trigger the automatic first-pass analysis; starts a turn.
    AutoAnalyze,
    /// Cancel the active turn, if any.
    Stop,
}

/// Events the server streams back.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Advisory phase hint; may be dropped under backpressure.
    Status { message: String },
    /// Markdown paragraph for the user.
    Text { text: String },
    /// Small formatted table.
    Table {
        title: String,
        headers: Vec<String>,
        rows: Vec<serde_json::Value>,
    },
    /// Declarative chart; `spec` is passed through opaquely.
    Plot { title: String, spec: serde_json::Value },
    /// Echo of one `sql_query` tool call and its outcome.
    QueryResult {
        description: String,
        sql: String,
        columns: Vec<String>,
        rows: Vec<serde_json::Value>,
        row_count: usize,
        is_error: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Session metadata changed (currently: title).
    SessionUpdate { title: String },
    /// A failure the client should surface.
    Error { message: String },
    /// Terminal event; exactly one per turn.
    Done {
        #[serde(skip_serializing_if = "Option::is_none")]
        aborted: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data_updated: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        suggestions: Option<Vec<String>>,
    },
}

impl ServerEvent {
    pub fn status(message: impl Into<String>) -> Self {
        ServerEvent::Status { message: message.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error { message: message.into() }
    }

    pub fn done() -> Self {
        ServerEvent::Done { aborted: None, data_updated: None, suggestions: None }
    }

    pub fn done_aborted() -> Self {
        ServerEvent::Done { aborted: Some(true), data_updated: None, suggestions: None }
    }

    pub fn done_with_suggestions(suggestions: Vec<String>) -> Self {
        ServerEvent::Done {
            aborted: None,
            data_updated: None,
            suggestions: if suggestions.is_empty() { None } else { Some(suggestions) },
        }
    }

    /// User-facing analysis output (drives the empty-turn safety net).
    pub fn is_visible_output(&self) -> bool {
        matches!(
            self,
            ServerEvent::Text { .. } | ServerEvent::Table { .. } | ServerEvent::Plot { .. }
        )
    }

    pub fn is_done(&self) -> bool {
        matches!(self, ServerEvent::Done { .. })
    }
}

struct SinkInner {
    sender: Mutex<Option<mpsc::Sender<ServerEvent>>>,
    finished: AtomicBool,
}

/// Handle the agent loop emits through; clones share one buffer and lock.
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<SinkInner>,
}

impl EventSink {
    /// A sink with no transport attached yet.
    pub fn detached() -> Self {
        EventSink {
            inner: Arc::new(SinkInner {
                sender: Mutex::new(None),
                finished: AtomicBool::new(false),
            }),
        }
    }

    /// A sink wired to a fresh bounded channel; the receiver belongs to the
    /// transport pump.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        let sink = Self::detached();
        sink.attach(tx);
        (sink, rx)
    }

    /// Point future events at a new transport (reconnect). Events emitted
    /// during the gap were dropped; the client reconciles via restore.
    pub fn attach(&self, tx: mpsc::Sender<ServerEvent>) {
        *self.inner.sender.lock() = Some(tx);
    }

    /// Allow a new turn to emit after a previous turn finished.
    pub fn reset_for_turn(&self) {
        self.inner.finished.store(false, Ordering::SeqCst);
    }

    /// Emit one event, blocking when the buffer is full.
    ///
    /// Returns `true` when the event was handed to a transport.
    pub async fn emit(&self, event: ServerEvent) -> bool {
        if self.inner.finished.load(Ordering::SeqCst) {
            return false;
        }
        let is_done = event.is_done();

        let sender = self.inner.sender.lock().clone();
        let delivered = match sender {
            Some(tx) => match tx.send(event).await {
                Ok(()) => true,
                Err(_) => {
                    // Receiver is gone; detach so later emits stop trying.
                    let mut slot = self.inner.sender.lock();
                    if slot.as_ref().map(|s| s.is_closed()).unwrap_or(false) {
                        *slot = None;
                    }
                    false
                }
            },
            None => false,
        };

        if is_done {
            self.inner.finished.store(true, Ordering::SeqCst);
        }
        delivered
    }

    /// Emit outside the turn lifecycle: input rejections and concurrency
    /// errors that may occur when no turn is active. Not subject to the
    /// post-`done` lockout.
    pub async fn emit_direct(&self, event: ServerEvent) -> bool {
        let sender = self.inner.sender.lock().clone();
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Emit a status hint; dropped when the buffer is full or detached.
    pub fn emit_status(&self, message: impl Into<String>) {
        if self.inner.finished.load(Ordering::SeqCst) {
            return;
        }
        let sender = self.inner.sender.lock().clone();
        if let Some(tx) = sender {
            let _ = tx.try_send(ServerEvent::status(message));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"message","text":"hi"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Message { text: "hi".into() });

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"auto_analyze"}"#).unwrap();
        assert_eq!(msg, ClientMessage::AutoAnalyze);

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"stop"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Stop);

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"reboot"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"message"}"#).is_err());
    }

    #[test]
    fn test_event_envelope_shape() {
        let json = serde_json::to_value(ServerEvent::status("Thinking…")).unwrap();
        assert_eq!(json["event"], "status");
        assert_eq!(json["data"]["message"], "Thinking…");

        let json = serde_json::to_value(ServerEvent::done_aborted()).unwrap();
        assert_eq!(json["event"], "done");
        assert_eq!(json["data"]["aborted"], true);

        let json = serde_json::to_value(ServerEvent::done()).unwrap();
        assert!(json["data"].get("aborted").is_none());
    }

    #[test]
    fn test_query_result_envelope() {
        let event = ServerEvent::QueryResult {
            description: "count rows".into(),
            sql: "SELECT count(*) FROM data".into(),
            columns: vec!["n".into()],
            rows: vec![serde_json::json!([42])],
            row_count: 1,
            is_error: false,
            error: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "query_result");
        assert_eq!(json["data"]["row_count"], 1);
        assert!(json["data"].get("error").is_none());
    }

    #[test]
    fn test_visibility_classification() {
        assert!(ServerEvent::Text { text: "x".into() }.is_visible_output());
        assert!(!ServerEvent::status("x").is_visible_output());
        assert!(!ServerEvent::done().is_visible_output());
        assert!(
            !ServerEvent::QueryResult {
                description: String::new(),
                sql: String::new(),
                columns: vec![],
                rows: vec![],
                row_count: 0,
                is_error: false,
                error: None,
            }
            .is_visible_output()
        );
    }

    #[tokio::test]
    async fn test_sink_delivers_in_order() {
        let (sink, mut rx) = EventSink::channel(8);
        sink.emit(ServerEvent::status("a")).await;
        sink.emit(ServerEvent::Text { text: "b".into() }).await;
        sink.emit(ServerEvent::done()).await;

        assert_eq!(rx.recv().await.unwrap(), ServerEvent::status("a"));
        assert_eq!(rx.recv().await.unwrap(), ServerEvent::Text { text: "b".into() });
        assert!(rx.recv().await.unwrap().is_done());
    }

    #[tokio::test]
    async fn test_nothing_after_done() {
        let (sink, mut rx) = EventSink::channel(8);
        sink.emit(ServerEvent::done()).await;
        assert!(!sink.emit(ServerEvent::Text { text: "late".into() }).await);
        sink.emit_status("late status");

        assert!(rx.recv().await.unwrap().is_done());
        assert!(rx.try_recv().is_err());

        // A new turn unlocks the sink.
        sink.reset_for_turn();
        assert!(sink.emit(ServerEvent::status("fresh")).await);
    }

    #[tokio::test]
    async fn test_direct_emission_bypasses_lockout() {
        let (sink, mut rx) = EventSink::channel(8);
        sink.emit(ServerEvent::done()).await;
        assert!(rx.recv().await.unwrap().is_done());

        // A concurrency error between turns still reaches the client.
        assert!(sink.emit_direct(ServerEvent::error("no turn is in progress")).await);
        assert!(matches!(rx.recv().await.unwrap(), ServerEvent::Error { .. }));
    }

    #[tokio::test]
    async fn test_status_dropped_when_full() {
        let (sink, mut rx) = EventSink::channel(1);
        sink.emit(ServerEvent::Text { text: "fills buffer".into() }).await;
        sink.emit_status("dropped");

        assert_eq!(rx.recv().await.unwrap(), ServerEvent::Text { text: "fills buffer".into() });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_emit_blocks_until_consumed() {
        let (sink, mut rx) = EventSink::channel(1);
        sink.emit(ServerEvent::status("first")).await;

        let sink2 = sink.clone();
        let writer = tokio::spawn(async move {
            // Blocks until the consumer drains the buffer.
            sink2.emit(ServerEvent::status("second")).await
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        assert_eq!(rx.recv().await.unwrap(), ServerEvent::status("first"));
        assert!(writer.await.unwrap());
        assert_eq!(rx.recv().await.unwrap(), ServerEvent::status("second"));
    }

    #[tokio::test]
    async fn test_detached_sink_drops_events() {
        let sink = EventSink::detached();
        assert!(!sink.emit(ServerEvent::status("nowhere")).await);

        // Attaching a transport starts delivery from that point on.
        let (tx, mut rx) = mpsc::channel(4);
        sink.attach(tx);
        assert!(sink.emit(ServerEvent::status("now")).await);
        assert_eq!(rx.recv().await.unwrap(), ServerEvent::status("now"));
    }

    #[tokio::test]
    async fn test_transport_swap_redirects_events() {
        let (sink, mut rx1) = EventSink::channel(4);
        sink.emit(ServerEvent::status("to first")).await;

        let (tx2, mut rx2) = mpsc::channel(4);
        sink.attach(tx2);
        sink.emit(ServerEvent::status("to second")).await;

        assert_eq!(rx1.recv().await.unwrap(), ServerEvent::status("to first"));
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.recv().await.unwrap(), ServerEvent::status("to second"));
    }
}
