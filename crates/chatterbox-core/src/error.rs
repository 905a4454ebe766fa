//! Error types shared by the store, the model gateway and the turn
//! orchestrator.

use thiserror::Error;

use crate::turn::TurnPhase;

/// Failures raised by a [`crate::entities::ChatStore`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Propagated from sqlx (connection, constraint, query failures).
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Running the embedded migrations failed.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored row could not be decoded into its entity.
    #[error("corrupt row in {table}: {message}")]
    CorruptRow { table: &'static str, message: String },
}

/// Failures raised by a [`crate::gateway::ModelGateway`].
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// The request never produced a response (DNS, TLS, connection reset).
    #[error("model request failed: {0}")]
    Transport(String),

    /// The backend answered with a non-success status.
    #[error("model backend returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The backend answered with a payload we could not interpret.
    #[error("malformed model response: {0}")]
    Malformed(String),

    /// The fragment sequence ended without an explicit completion signal.
    #[error("model stream ended without completion")]
    Incomplete,

    /// The configured generation deadline elapsed.
    #[error("model generation timed out after {0}s")]
    Timeout(u64),

    /// Error reported in-band by the backend while streaming.
    #[error("model stream error: {0}")]
    Stream(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::Transport(e.to_string())
    }
}

/// Outcome of a turn that did not finish.
#[derive(Debug, Error)]
pub enum TurnError {
    /// Content was empty after trimming, or too large.
    #[error("{0}")]
    Validation(String),

    /// Chat missing or not owned by the caller; the two are indistinguishable.
    #[error("Chat not found")]
    NotFound,

    /// Another turn currently holds this chat.
    #[error("a response is already being generated for chat {0}")]
    Busy(String),

    /// The model call or fragment sequence failed.
    #[error("generation failed: {0}")]
    Generation(#[from] GatewayError),

    /// A store call failed during the named phase.
    #[error("persistence failed during {phase}: {source}")]
    Persistence {
        phase: TurnPhase,
        #[source]
        source: StoreError,
    },
}

impl TurnError {
    pub(crate) fn persistence(phase: TurnPhase, source: StoreError) -> Self {
        TurnError::Persistence { phase, source }
    }

    /// Opaque description safe to hand to a client.
    pub fn client_message(&self) -> String {
        match self {
            TurnError::Validation(m) => m.clone(),
            TurnError::NotFound => "Chat not found".to_owned(),
            TurnError::Busy(_) => "A response is already being generated for this chat".to_owned(),
            TurnError::Generation(_) => "Failed to generate response".to_owned(),
            TurnError::Persistence { phase: TurnPhase::AssistantPersisted, .. }
            | TurnError::Persistence { phase: TurnPhase::Finalized, .. } => {
                "Failed to save response".to_owned()
            }
            TurnError::Persistence { .. } => "Failed to save message".to_owned(),
        }
    }
}
