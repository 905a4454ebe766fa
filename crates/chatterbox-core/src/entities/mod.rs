//! Chat Store: durable record storage for chats and their messages.
//!
//! [`ChatStore`] is the interface the turn orchestrator and the HTTP layer
//! consume. The shipped implementation is [`SqliteStore`]; any other
//! backend only has to implement the trait.
//!
//! All trait methods use `impl Future` in their signatures so no boxing is
//! needed on the hot path.

pub mod chat;
pub mod dao;

pub use chat::ChatStore;
pub use dao::{Chat, ChatSummary, DEFAULT_CHAT_TITLE, Message, Role};

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::error::StoreError;

/// SQLite-backed chat store.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the SQLite database at `url` and run pending migrations.
    ///
    /// `url` should be a sqlx-compatible SQLite URL, e.g. `"sqlite://chatterbox.db"`
    /// or `"sqlite::memory:"` for tests. In-memory databases are pinned to a
    /// single connection that is never recycled, otherwise each pooled
    /// connection would see its own empty database.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new().connect_with(options).await?
        };

        // Path is resolved relative to CARGO_MANIFEST_DIR at compile time.
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Current time at the precision the store keeps.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

// Fixed-width so lexical order in SQLite matches chronological order.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(table: &'static str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    raw.parse::<DateTime<Utc>>()
        .map_err(|e| StoreError::CorruptRow {
            table,
            message: format!("bad timestamp {raw:?}: {e}"),
        })
}
