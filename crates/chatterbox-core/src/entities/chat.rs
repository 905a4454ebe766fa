use std::future::Future;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::entities::dao::{Chat, ChatSummary, Message, Role};
use crate::entities::{SqliteStore, format_ts, now, parse_ts};
use crate::error::StoreError;

/// CRUD and ordered retrieval over chats and messages.
pub trait ChatStore: Send + Sync + 'static {
    fn create_chat(
        &self,
        owner_id: &str,
        title: &str,
    ) -> impl Future<Output = Result<Chat, StoreError>> + Send;

    /// `None` when the chat does not exist *or* belongs to someone else.
    fn find_chat_for_owner(
        &self,
        chat_id: &str,
        owner_id: &str,
    ) -> impl Future<Output = Result<Option<Chat>, StoreError>> + Send;

    /// Most-recently-updated first, each with its message count.
    fn list_chats(
        &self,
        owner_id: &str,
    ) -> impl Future<Output = Result<Vec<ChatSummary>, StoreError>> + Send;

    /// Full history, oldest first.
    fn list_messages(
        &self,
        chat_id: &str,
    ) -> impl Future<Output = Result<Vec<Message>, StoreError>> + Send;

    /// The `limit` most recent messages, returned oldest first.
    fn list_recent_messages(
        &self,
        chat_id: &str,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<Message>, StoreError>> + Send;

    fn create_message(
        &self,
        chat_id: &str,
        role: Role,
        content: &str,
    ) -> impl Future<Output = Result<Message, StoreError>> + Send;

    fn touch_chat(
        &self,
        chat_id: &str,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Removes the chat and, by cascade, its messages.
    fn delete_chat(&self, chat_id: &str) -> impl Future<Output = Result<(), StoreError>> + Send;
}

type ChatRow = (String, String, String, String, String);

// Read-then-write transactions must hold the write lock from the start: a
// deferred transaction upgraded after another connection committed fails
// with SQLITE_BUSY without waiting on the busy timeout.
const BEGIN_WRITE: &str = "BEGIN IMMEDIATE";
type MessageRow = (String, String, String, String, String);

fn chat_from_row((id, owner_id, title, created_at, updated_at): ChatRow) -> Result<Chat, StoreError> {
    Ok(Chat {
        id,
        owner_id,
        title,
        created_at: parse_ts("chats", &created_at)?,
        updated_at: parse_ts("chats", &updated_at)?,
    })
}

fn message_from_row((id, chat_id, role, content, created_at): MessageRow) -> Result<Message, StoreError> {
    let role = role.parse::<Role>().map_err(|_| StoreError::CorruptRow {
        table: "messages",
        message: format!("unknown role {role:?}"),
    })?;
    Ok(Message {
        id,
        chat_id,
        role,
        content,
        created_at: parse_ts("messages", &created_at)?,
    })
}

impl ChatStore for SqliteStore {
    async fn create_chat(&self, owner_id: &str, title: &str) -> Result<Chat, StoreError> {
        let created_at = now();
        let chat = Chat {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_owned(),
            title: title.to_owned(),
            created_at,
            updated_at: created_at,
        };
        sqlx::query(
            "INSERT INTO chats (id, owner_id, title, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&chat.id)
        .bind(&chat.owner_id)
        .bind(&chat.title)
        .bind(format_ts(chat.created_at))
        .bind(format_ts(chat.updated_at))
        .execute(self.pool())
        .await?;
        Ok(chat)
    }

    async fn find_chat_for_owner(
        &self,
        chat_id: &str,
        owner_id: &str,
    ) -> Result<Option<Chat>, StoreError> {
        let row: Option<ChatRow> = sqlx::query_as(
            "SELECT id, owner_id, title, created_at, updated_at \
             FROM chats WHERE id = ?1 AND owner_id = ?2",
        )
        .bind(chat_id)
        .bind(owner_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(chat_from_row).transpose()
    }

    async fn list_chats(&self, owner_id: &str) -> Result<Vec<ChatSummary>, StoreError> {
        let rows: Vec<(String, String, String, String, i64)> = sqlx::query_as(
            "SELECT c.id, c.title, c.created_at, c.updated_at, \
                    (SELECT COUNT(*) FROM messages m WHERE m.chat_id = c.id) \
             FROM chats c WHERE c.owner_id = ?1 \
             ORDER BY c.updated_at DESC, c.created_at DESC",
        )
        .bind(owner_id)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter()
            .map(|(id, title, created_at, updated_at, message_count)| {
                Ok(ChatSummary {
                    id,
                    title,
                    created_at: parse_ts("chats", &created_at)?,
                    updated_at: parse_ts("chats", &updated_at)?,
                    message_count,
                })
            })
            .collect()
    }

    async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, chat_id, role, content, created_at \
             FROM messages WHERE chat_id = ?1 ORDER BY seq ASC",
        )
        .bind(chat_id)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(message_from_row).collect()
    }

    async fn list_recent_messages(
        &self,
        chat_id: &str,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, chat_id, role, content, created_at FROM ( \
                 SELECT seq, id, chat_id, role, content, created_at \
                 FROM messages WHERE chat_id = ?1 ORDER BY seq DESC LIMIT ?2 \
             ) ORDER BY seq ASC",
        )
        .bind(chat_id)
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(message_from_row).collect()
    }

    async fn create_message(
        &self,
        chat_id: &str,
        role: Role,
        content: &str,
    ) -> Result<Message, StoreError> {
        let mut tx = self.pool().begin_with(BEGIN_WRITE).await?;

        // Timestamps within a chat must be strictly increasing even when two
        // writes land in the same microsecond.
        let last: Option<(String,)> = sqlx::query_as(
            "SELECT created_at FROM messages WHERE chat_id = ?1 ORDER BY seq DESC LIMIT 1",
        )
        .bind(chat_id)
        .fetch_optional(&mut *tx)
        .await?;
        let mut created_at = now();
        if let Some((raw,)) = last {
            let previous = parse_ts("messages", &raw)?;
            if created_at <= previous {
                created_at = previous + Duration::microseconds(1);
            }
        }

        let message = Message {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.to_owned(),
            role,
            content: content.to_owned(),
            created_at,
        };
        sqlx::query(
            "INSERT INTO messages (id, chat_id, role, content, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&message.id)
        .bind(&message.chat_id)
        .bind(message.role.as_ref())
        .bind(&message.content)
        .bind(format_ts(message.created_at))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(message)
    }

    async fn touch_chat(&self, chat_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE chats SET updated_at = ?1 WHERE id = ?2")
            .bind(format_ts(at))
            .bind(chat_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn delete_chat(&self, chat_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool().begin_with(BEGIN_WRITE).await?;
        sqlx::query("DELETE FROM messages WHERE chat_id = ?1")
            .bind(chat_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chats WHERE id = ?1")
            .bind(chat_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:")
            .await
            .expect("in-memory store")
    }

    #[tokio::test]
    async fn chat_is_invisible_to_other_owners() {
        let store = store().await;
        let chat = store.create_chat("alice", "Plans").await.unwrap();

        let found = store.find_chat_for_owner(&chat.id, "alice").await.unwrap();
        assert_eq!(found.map(|c| c.title), Some("Plans".to_owned()));
        assert!(store.find_chat_for_owner(&chat.id, "bob").await.unwrap().is_none());
        assert!(store.find_chat_for_owner("missing", "alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recent_messages_are_the_newest_slice_oldest_first() {
        let store = store().await;
        let chat = store.create_chat("alice", "t").await.unwrap();
        for i in 0..5 {
            store.create_message(&chat.id, Role::User, &format!("m{i}")).await.unwrap();
        }

        let recent = store.list_recent_messages(&chat.id, 3).await.unwrap();
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn message_timestamps_strictly_increase() {
        let store = store().await;
        let chat = store.create_chat("alice", "t").await.unwrap();
        let a = store.create_message(&chat.id, Role::User, "q").await.unwrap();
        let b = store.create_message(&chat.id, Role::Assistant, "a").await.unwrap();
        assert!(a.created_at < b.created_at);

        let all = store.list_messages(&chat.id).await.unwrap();
        assert_eq!(all, vec![a, b]);
    }

    #[tokio::test]
    async fn list_chats_orders_by_activity_and_counts_messages() {
        let store = store().await;
        let older = store.create_chat("alice", "older").await.unwrap();
        let newer = store.create_chat("alice", "newer").await.unwrap();
        store.create_chat("bob", "not mine").await.unwrap();
        store.create_message(&older.id, Role::User, "hi").await.unwrap();
        store
            .touch_chat(&older.id, newer.updated_at + Duration::seconds(5))
            .await
            .unwrap();

        let chats = store.list_chats("alice").await.unwrap();
        let titles: Vec<_> = chats.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, ["older", "newer"]);
        assert_eq!(chats[0].message_count, 1);
        assert_eq!(chats[1].message_count, 0);
    }

    #[tokio::test]
    async fn delete_chat_cascades_to_messages() {
        let store = store().await;
        let chat = store.create_chat("alice", "t").await.unwrap();
        store.create_message(&chat.id, Role::User, "hi").await.unwrap();

        store.delete_chat(&chat.id).await.unwrap();
        assert!(store.find_chat_for_owner(&chat.id, "alice").await.unwrap().is_none());
        assert!(store.list_messages(&chat.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_content_is_rejected_by_schema() {
        let store = store().await;
        let chat = store.create_chat("alice", "t").await.unwrap();
        assert!(store.create_message(&chat.id, Role::Assistant, "").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_on_a_file_database_do_not_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("store.db").display());
        let store = SqliteStore::connect(&url).await.unwrap();
        let mut chats = Vec::new();
        for i in 0..6 {
            chats.push(store.create_chat("alice", &format!("t{i}")).await.unwrap());
        }

        let mut writers = tokio::task::JoinSet::new();
        for chat in &chats {
            let store = store.clone();
            let chat_id = chat.id.clone();
            writers.spawn(async move {
                for i in 0..10 {
                    store.create_message(&chat_id, Role::User, &format!("m{i}")).await?;
                }
                Ok::<_, StoreError>(())
            });
        }
        while let Some(joined) = writers.join_next().await {
            joined.unwrap().expect("writes succeed under contention");
        }

        for chat in &chats {
            let stored = store.list_messages(&chat.id).await.unwrap();
            assert_eq!(stored.len(), 10);
            assert!(stored.windows(2).all(|w| w[0].created_at < w[1].created_at));
        }
    }
}
