//! Core of the chatterbox chat service.
//!
//! A *turn* takes one user message, persists it, asks the model for a reply
//! and persists that reply, optionally relaying the reply fragment by
//! fragment while it is generated.
//!
//! ```text
//! HTTP handler ──► Orchestrator ──► ContextBuilder ──► ChatStore
//!                       │
//!                       ├──► ModelGateway (complete | stream)
//!                       └──► StreamTransport ──► client
//! ```

pub mod context;
pub mod entities;
pub mod error;
pub mod gateway;
pub mod transport;
pub mod turn;

pub use context::{ContextBuilder, DEFAULT_CONTEXT_LIMIT};
pub use entities::{Chat, ChatStore, ChatSummary, DEFAULT_CHAT_TITLE, Message, Role, SqliteStore};
pub use error::{GatewayError, StoreError, TurnError};
pub use gateway::{GenerationStream, ModelGateway, OpenAiGateway, StreamChunk};
pub use transport::{Frame, StreamTransport, TurnEvent, TurnEvents, parse_frames};
pub use turn::{
    FALLBACK_REPLY, Orchestrator, StreamingTurn, TurnOutcome, TurnPhase, TurnSettings,
};
