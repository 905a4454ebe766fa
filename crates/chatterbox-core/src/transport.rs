//! Stream Transport: the ordered, one-way event channel of a single turn.
//!
//! A [`StreamTransport`] is opened with the persisted user message, so
//! `userMessage` is always the first event. Terminal events are sent by
//! [`StreamTransport::done`] and [`StreamTransport::fail`], both of which
//! consume the transport: nothing can follow them, and dropping the sender
//! closes the channel exactly once on every exit path.
//!
//! Each [`TurnEvent`] becomes exactly one wire [`Frame`]:
//!
//! ```text
//! event: message
//! data: {"type":"chunk","content":"Hi"}
//!
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;
use utoipa::ToSchema;

use crate::entities::Message;

/// Events queued between the turn task and the response writer.
pub const TRANSPORT_BUFFER: usize = 64;

/// Receiving side handed to the HTTP layer.
pub type TurnEvents = ReceiverStream<TurnEvent>;

/// Orchestrator event, discriminated by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TurnEvent {
    /// The persisted user message; always first.
    UserMessage { message: Message },
    /// One opaque fragment of model output.
    Chunk { content: String },
    /// The persisted assistant message; always last on success.
    Done { message: Message },
    /// Opaque failure description; always last on failure.
    Error { error: String },
}

impl TurnEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnEvent::Done { .. } | TurnEvent::Error { .. })
    }

    /// SSE event name: errors travel on their own event so plain
    /// `EventSource` listeners can tell them apart.
    pub fn event_name(&self) -> &'static str {
        match self {
            TurnEvent::Error { .. } => "error",
            _ => "message",
        }
    }

    pub fn to_frame(&self) -> Frame {
        // Serializing these variants cannot fail: every field is a string,
        // a timestamp or a unit enum.
        let data = serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","error":"unencodable event: {e}"}}"#)
        });
        Frame { event: self.event_name(), data }
    }
}

/// One server-sent-event frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: &'static str,
    /// Single-line JSON payload.
    pub data: String,
}

impl Frame {
    /// Text encoding as it appears on the wire.
    pub fn encode(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event, self.data)
    }
}

#[cfg(feature = "axum")]
impl From<Frame> for axum::response::sse::Event {
    fn from(frame: Frame) -> Self {
        axum::response::sse::Event::default()
            .event(frame.event)
            .data(frame.data)
    }
}

/// Decode an SSE body back into events, in order. Blocks without a `data`
/// field (comments, keep-alives) are skipped.
pub fn parse_frames(body: &str) -> Result<Vec<TurnEvent>, serde_json::Error> {
    body.split("\n\n")
        .filter_map(|block| {
            let data: Vec<&str> = block
                .lines()
                .filter_map(|l| l.strip_prefix("data:"))
                .map(|d| d.strip_prefix(' ').unwrap_or(d))
                .collect();
            (!data.is_empty()).then(|| data.join("\n"))
        })
        .map(|data| serde_json::from_str(&data))
        .collect()
}

/// Sending half of a turn's event channel.
#[derive(Debug)]
pub struct StreamTransport {
    tx: Option<mpsc::Sender<TurnEvent>>,
    chat_id: String,
}

impl StreamTransport {
    /// Open a transport whose first event is `user_message`.
    pub fn open(user_message: Message) -> (Self, TurnEvents) {
        let (tx, rx) = mpsc::channel(TRANSPORT_BUFFER);
        let chat_id = user_message.chat_id.clone();
        // A fresh channel always has room for its first event.
        let tx = tx
            .try_send(TurnEvent::UserMessage { message: user_message })
            .ok()
            .map(|()| tx);
        (Self { tx, chat_id }, ReceiverStream::new(rx))
    }

    /// Whether the client is still reading.
    pub fn is_connected(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Relay one fragment.
    pub async fn chunk(&mut self, content: &str) {
        self.send(TurnEvent::Chunk { content: content.to_owned() }).await;
    }

    /// Relay the persisted assistant message and close.
    pub async fn done(mut self, message: Message) {
        self.send(TurnEvent::Done { message }).await;
    }

    /// Relay a failure description and close.
    pub async fn fail(mut self, error: impl Into<String>) {
        self.send(TurnEvent::Error { error: error.into() }).await;
    }

    // Writes after a disconnect are dropped; the turn itself keeps going.
    async fn send(&mut self, event: TurnEvent) {
        let Some(tx) = &self.tx else { return };
        if tx.send(event).await.is_err() {
            debug!(chat_id = %self.chat_id, "client disconnected; continuing turn without transport");
            self.tx = None;
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
