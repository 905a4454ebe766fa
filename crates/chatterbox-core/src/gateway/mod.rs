//! Model Gateway: the generative backend behind two call shapes.
//!
//! - [`ModelGateway::generate_complete`] blocks until the full text is ready.
//! - [`ModelGateway::generate_stream`] hands back a [`GenerationStream`] that
//!   yields [`StreamChunk`]s as the backend produces them.
//!
//! A stream is finite and forward-only. It ends with exactly one
//! [`StreamChunk::Done`] or [`StreamChunk::Error`]; a channel that closes
//! without either is an incomplete generation, never an empty answer.

pub mod openai;
#[cfg(any(test, feature = "test-util"))]
pub mod scripted;

pub use openai::OpenAiGateway;
#[cfg(any(test, feature = "test-util"))]
pub use scripted::ScriptedGateway;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::GatewayError;

/// Buffer between a backend reader task and the turn consuming it.
pub const STREAM_BUFFER: usize = 64;

/// A single chunk emitted by a streaming backend.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// A piece of generated output. Boundaries carry no meaning.
    Token(String),
    /// Generation completed normally.
    Done,
    /// Generation terminated due to a backend error.
    Error(GatewayError),
}

/// Receiving half of a streaming generation.
pub type GenerationStream = mpsc::Receiver<StreamChunk>;

#[async_trait]
pub trait ModelGateway: Send + Sync + 'static {
    /// Run the prompt to completion and return the final text.
    async fn generate_complete(&self, prompt: &str) -> Result<String, GatewayError>;

    /// Start an incremental generation. Failures to even start are returned
    /// directly; later failures arrive in-band as [`StreamChunk::Error`].
    async fn generate_stream(&self, prompt: &str) -> Result<GenerationStream, GatewayError>;
}
