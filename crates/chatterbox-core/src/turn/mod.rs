//! Turn Orchestrator: drives one user-message-in, assistant-message-out cycle.
//!
//! ```text
//! Accepted → UserPersisted → Generating → Streaming | Completing
//!          → AssistantPersisted → Finalized
//! ```
//!
//! with `Failed` reachable from every non-terminal phase. Ordering contract:
//!
//! - nothing is written before validation, the ownership check and the
//!   chat lease succeed;
//! - the user message is persisted before the model is called, so a model
//!   failure never loses the user's input;
//! - the assistant message and the chat activity timestamp are written only
//!   after the model finished without error;
//! - a client disconnect never aborts the turn: it runs to completion in its
//!   own task and the transport just stops delivering.

pub mod lease;

pub use lease::{ChatLease, ChatLeases};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::context::{ContextBuilder, DEFAULT_CONTEXT_LIMIT};
use crate::entities::{ChatStore, Message, Role, now};
use crate::error::{GatewayError, TurnError};
use crate::gateway::{ModelGateway, StreamChunk};
use crate::transport::{StreamTransport, TurnEvents};

/// Stored and relayed instead of an empty model answer.
pub const FALLBACK_REPLY: &str = "Sorry, I couldn't generate a response. Please try again.";

/// Default upper bound on the size of one user message.
pub const DEFAULT_MAX_CONTENT_BYTES: usize = 128 * 1024;

/// Phases of a turn, used for logging and to tag persistence failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum TurnPhase {
    Accepted,
    UserPersisted,
    Generating,
    Streaming,
    Completing,
    AssistantPersisted,
    Finalized,
    Failed,
}

/// Knobs that shape every turn.
#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub context_limit: u32,
    /// `None` means the model call is deliberately unbounded.
    pub generation_timeout: Option<Duration>,
    pub max_content_bytes: usize,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            context_limit: DEFAULT_CONTEXT_LIMIT,
            generation_timeout: None,
            max_content_bytes: DEFAULT_MAX_CONTENT_BYTES,
        }
    }
}

/// Both halves of a completed turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub user_message: Message,
    pub assistant_message: Message,
}

/// A streaming turn that has been accepted and is generating in the
/// background.
#[derive(Debug)]
pub struct StreamingTurn {
    pub user_message: Message,
    /// `userMessage`, `chunk*`, then exactly one of `done` / `error`.
    pub events: TurnEvents,
    /// Resolves once every persistence step of the turn has run.
    pub task: JoinHandle<Result<Message, TurnError>>,
}

/// State carried from acceptance into generation.
struct Accepted {
    chat_id: String,
    prompt: String,
    user_message: Message,
    lease: ChatLease,
}

/// Runs turns against a store and a model gateway.
pub struct Orchestrator<S> {
    store: Arc<S>,
    gateway: Arc<dyn ModelGateway>,
    context: ContextBuilder,
    leases: Arc<ChatLeases>,
    settings: TurnSettings,
}

impl<S> Clone for Orchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            gateway: Arc::clone(&self.gateway),
            context: self.context,
            leases: Arc::clone(&self.leases),
            settings: self.settings.clone(),
        }
    }
}

impl<S> std::fmt::Debug for Orchestrator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("context", &self.context)
            .field("leases", &self.leases)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<S: ChatStore> Orchestrator<S> {
    pub fn new(store: Arc<S>, gateway: Arc<dyn ModelGateway>, settings: TurnSettings) -> Self {
        Self {
            store,
            gateway,
            context: ContextBuilder::new(settings.context_limit),
            leases: ChatLeases::new(),
            settings,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn leases(&self) -> &Arc<ChatLeases> {
        &self.leases
    }

    /// Non-streaming turn: returns both persisted messages, or the error
    /// that ended the turn. On a generation failure the user message stays
    /// persisted and no assistant message is written.
    pub async fn run_complete(
        &self,
        owner_id: &str,
        chat_id: &str,
        content: &str,
    ) -> Result<TurnOutcome, TurnError> {
        let span = info_span!("turn", chat_id = %chat_id, owner = %owner_id, stream = false);
        async move {
            let accepted = self.accept(owner_id, chat_id, content).await?;
            debug!(phase = %TurnPhase::Completing, "calling model");

            let generated = within(
                self.deadline(),
                self.settings.generation_timeout,
                self.gateway.generate_complete(&accepted.prompt),
            )
            .await
            .and_then(|r| r);

            let text = match generated {
                Ok(text) => text,
                Err(e) => {
                    warn!(phase = %TurnPhase::Failed, error = %e, "generation failed; user message kept");
                    return Err(TurnError::Generation(e));
                }
            };

            let assistant_message = self.finalize(&accepted.chat_id, text).await?;
            drop(accepted.lease);
            Ok(TurnOutcome {
                user_message: accepted.user_message,
                assistant_message,
            })
        }
        .instrument(span)
        .await
    }

    /// Streaming turn. Validation, the ownership check, the lease and the
    /// user-message write happen before this returns, so their failures
    /// surface as plain errors with no stream opened. Everything after runs
    /// in a spawned task that reports through the returned event stream.
    pub async fn start_stream(
        &self,
        owner_id: &str,
        chat_id: &str,
        content: &str,
    ) -> Result<StreamingTurn, TurnError> {
        let span = info_span!("turn", chat_id = %chat_id, owner = %owner_id, stream = true);
        let accepted = self
            .accept(owner_id, chat_id, content)
            .instrument(span.clone())
            .await?;

        let user_message = accepted.user_message.clone();
        let (transport, events) = StreamTransport::open(user_message.clone());
        let this = self.clone();
        let task = tokio::spawn(
            async move { this.drive_stream(accepted, transport).await }.instrument(span),
        );

        Ok(StreamingTurn {
            user_message,
            events,
            task,
        })
    }

    async fn accept(
        &self,
        owner_id: &str,
        chat_id: &str,
        content: &str,
    ) -> Result<Accepted, TurnError> {
        if content.trim().is_empty() {
            return Err(TurnError::Validation("Message content must not be empty".into()));
        }
        if content.len() > self.settings.max_content_bytes {
            return Err(TurnError::Validation(format!(
                "Message content too large ({} bytes); maximum is {} bytes",
                content.len(),
                self.settings.max_content_bytes,
            )));
        }

        self.store
            .find_chat_for_owner(chat_id, owner_id)
            .await
            .map_err(|e| TurnError::persistence(TurnPhase::Accepted, e))?
            .ok_or(TurnError::NotFound)?;
        let lease = self.leases.try_acquire(chat_id)?;

        // Ownership was settled above. The window is read before the write
        // below, so the new content enters the prompt only through `render`.
        let history = self
            .context
            .history(self.store.as_ref(), chat_id)
            .await
            .map_err(|e| TurnError::persistence(TurnPhase::Accepted, e))?;
        let prompt = self.context.render(&history, content);
        debug!(phase = %TurnPhase::Accepted, prompt_len = prompt.len(), "turn accepted");

        let user_message = self
            .store
            .create_message(chat_id, Role::User, content)
            .await
            .map_err(|e| {
                warn!(error = %e, "failed to persist user message");
                TurnError::persistence(TurnPhase::UserPersisted, e)
            })?;
        debug!(phase = %TurnPhase::UserPersisted, message_id = %user_message.id, "user message stored");

        Ok(Accepted {
            chat_id: chat_id.to_owned(),
            prompt,
            user_message,
            lease,
        })
    }

    async fn drive_stream(
        &self,
        accepted: Accepted,
        mut transport: StreamTransport,
    ) -> Result<Message, TurnError> {
        let Accepted { chat_id, prompt, lease, .. } = accepted;

        let outcome = match self.relay(&prompt, &mut transport).await {
            Ok(text) => self.finalize(&chat_id, text).await,
            Err(e) => {
                warn!(phase = %TurnPhase::Failed, error = %e, "generation failed; user message kept");
                Err(TurnError::Generation(e))
            }
        };

        // Every write is behind us; the next turn may start while the
        // terminal event is still in flight.
        drop(lease);
        match &outcome {
            Ok(message) => transport.done(message.clone()).await,
            Err(e) => transport.fail(e.client_message()).await,
        }
        outcome
    }

    /// Consume the fragment sequence, relaying each fragment in arrival
    /// order while accumulating the full text.
    async fn relay(
        &self,
        prompt: &str,
        transport: &mut StreamTransport,
    ) -> Result<String, GatewayError> {
        let deadline = self.deadline();
        let timeout = self.settings.generation_timeout;
        debug!(phase = %TurnPhase::Generating, "opening model stream");
        let mut stream = within(deadline, timeout, self.gateway.generate_stream(prompt)).await??;

        let mut accumulated = String::new();
        let mut fragments = 0usize;
        debug!(phase = %TurnPhase::Streaming, "relaying fragments");
        loop {
            match within(deadline, timeout, stream.recv()).await? {
                Some(StreamChunk::Token(text)) => {
                    if text.is_empty() {
                        continue;
                    }
                    fragments += 1;
                    accumulated.push_str(&text);
                    transport.chunk(&text).await;
                }
                Some(StreamChunk::Done) => {
                    debug!(fragments, connected = transport.is_connected(), "model stream complete");
                    return Ok(accumulated);
                }
                Some(StreamChunk::Error(e)) => return Err(e),
                None => return Err(GatewayError::Incomplete),
            }
        }
    }

    /// Persist the assistant reply and mark the chat active.
    async fn finalize(&self, chat_id: &str, text: String) -> Result<Message, TurnError> {
        let content = if text.trim().is_empty() {
            info!("model produced no content; storing fallback reply");
            FALLBACK_REPLY.to_owned()
        } else {
            text
        };

        let message = self
            .store
            .create_message(chat_id, Role::Assistant, &content)
            .await
            .map_err(|e| {
                warn!(error = %e, "failed to persist assistant message");
                TurnError::persistence(TurnPhase::AssistantPersisted, e)
            })?;
        debug!(phase = %TurnPhase::AssistantPersisted, message_id = %message.id, "assistant message stored");

        self.store.touch_chat(chat_id, now()).await.map_err(|e| {
            warn!(error = %e, "failed to update chat activity");
            TurnError::persistence(TurnPhase::Finalized, e)
        })?;
        info!(phase = %TurnPhase::Finalized, reply_len = message.content.len(), "turn finalized");
        Ok(message)
    }

    fn deadline(&self) -> Option<Instant> {
        self.settings.generation_timeout.map(|t| Instant::now() + t)
    }
}

/// Await `fut`, bounded by `deadline` when one is configured.
async fn within<F: Future>(
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    fut: F,
) -> Result<F::Output, GatewayError> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut)
            .await
            .map_err(|_| GatewayError::Timeout(timeout.map_or(0, |t| t.as_secs()))),
        None => Ok(fut.await),
    }
}
