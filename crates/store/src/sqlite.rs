//! SQLite-backed message store.

use std::{str::FromStr, time::Duration};

use {
    async_trait::async_trait,
    sqlx::{
        SqlitePool,
        sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    },
};

use crate::{
    AppendOutcome, AppendRequest, ConversationKind, ConversationMeta, DEFAULT_MAX_HISTORY_LIMIT,
    HistoryPage, MAX_TEXT_CHARS, MessageStore, StoredMessage, Visibility,
    error::{StoreError, classify, is_unique_violation},
};

pub struct SqliteMessageStore {
    pool: SqlitePool,
    max_history_limit: u32,
}

impl SqliteMessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            max_history_limit: DEFAULT_MAX_HISTORY_LIMIT,
        }
    }

    pub fn with_max_history_limit(mut self, limit: u32) -> Self {
        self.max_history_limit = limit.max(1);
        self
    }

    /// Open a WAL-mode pool for the given `sqlite://` url, creating the file
    /// if needed.
    pub async fn connect(db_url: &str) -> Result<SqlitePool, sqlx::Error> {
        let opts = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
    }

    /// Initialize the message schema.
    ///
    /// Production deployments apply the schema out-of-band; this is retained
    /// for tests and dev bootstrapping.
    #[doc(hidden)]
    pub async fn init(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversations (
                id         TEXT    PRIMARY KEY,
                kind       TEXT    NOT NULL,
                visibility TEXT    NOT NULL,
                created_at INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversation_cursors (
                conversation_id TEXT    PRIMARY KEY,
                next_seq        INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                conversation_id TEXT    NOT NULL,
                seq             INTEGER NOT NULL,
                server_msg_id   TEXT    NOT NULL UNIQUE,
                client_msg_id   TEXT    NOT NULL,
                sender_session  TEXT    NOT NULL,
                text            TEXT    NOT NULL,
                server_ts       INTEGER NOT NULL,
                PRIMARY KEY (conversation_id, seq),
                UNIQUE (conversation_id, client_msg_id)
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversation_members (
                conversation_id TEXT NOT NULL,
                user_id         TEXT NOT NULL,
                role            TEXT NOT NULL DEFAULT 'member',
                PRIMARY KEY (conversation_id, user_id)
            )",
        )
        .execute(pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn append_message(&self, req: AppendRequest) -> Result<AppendOutcome, StoreError> {
        if req.text.is_empty() {
            return Err(StoreError::TextEmpty);
        }
        if req.text.chars().count() > MAX_TEXT_CHARS {
            return Err(StoreError::TextTooLong);
        }

        let mut tx = self.pool.begin().await.map_err(classify)?;

        // The cursor upsert runs first so the transaction's opening
        // statement is a write: it acquires the database write lock under
        // the busy timeout instead of upgrading a read snapshot later,
        // which would fail immediately under concurrent senders. A rollback
        // on any of the checks below undoes it.
        sqlx::query(
            "INSERT INTO conversation_cursors (conversation_id, next_seq) VALUES (?, 1)
             ON CONFLICT(conversation_id) DO NOTHING",
        )
        .bind(&req.conversation_id)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        let convo: Option<(String,)> =
            sqlx::query_as("SELECT visibility FROM conversations WHERE id = ?")
                .bind(&req.conversation_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(classify)?;
        let Some((visibility,)) = convo else {
            return Err(StoreError::UnknownConversation);
        };
        if visibility == "private" {
            let member: Option<(i64,)> = sqlx::query_as(
                "SELECT 1 FROM conversation_members WHERE conversation_id = ? AND user_id = ?",
            )
            .bind(&req.conversation_id)
            .bind(&req.sender_user_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(classify)?;
            if member.is_none() {
                return Err(StoreError::Forbidden);
            }
        }

        let (seq,): (i64,) =
            sqlx::query_as("SELECT next_seq FROM conversation_cursors WHERE conversation_id = ?")
                .bind(&req.conversation_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(classify)?;

        let server_msg_id = uuid::Uuid::new_v4().to_string();
        let inserted = sqlx::query(
            "INSERT INTO messages
             (conversation_id, seq, server_msg_id, client_msg_id, sender_session, text, server_ts)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&req.conversation_id)
        .bind(seq)
        .bind(&server_msg_id)
        .bind(&req.client_msg_id)
        .bind(&req.sender_session_id)
        .bind(&req.text)
        .bind(req.server_ts)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {},
            Err(e) if is_unique_violation(&e) => {
                // Duplicate submit: abandon the allocation and hand back the
                // ids the original insert was assigned.
                tx.rollback().await.map_err(classify)?;
                let (server_msg_id, seq, server_ts): (String, i64, i64) = sqlx::query_as(
                    "SELECT server_msg_id, seq, server_ts FROM messages
                     WHERE conversation_id = ? AND client_msg_id = ?",
                )
                .bind(&req.conversation_id)
                .bind(&req.client_msg_id)
                .fetch_one(&self.pool)
                .await
                .map_err(classify)?;
                return Ok(AppendOutcome {
                    server_msg_id,
                    seq,
                    server_ts,
                    already_existed: true,
                });
            },
            Err(e) => return Err(classify(e)),
        }

        sqlx::query(
            "UPDATE conversation_cursors SET next_seq = next_seq + 1 WHERE conversation_id = ?",
        )
        .bind(&req.conversation_id)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        tx.commit().await.map_err(classify)?;

        Ok(AppendOutcome {
            server_msg_id,
            seq,
            server_ts: req.server_ts,
            already_existed: false,
        })
    }

    async fn fetch_history(
        &self,
        conversation_id: &str,
        after_seq: Option<i64>,
        limit: u32,
    ) -> Result<HistoryPage, StoreError> {
        let limit = limit.clamp(1, self.max_history_limit);
        let after = after_seq.unwrap_or(0);

        // One extra row decides has_more without a second query.
        let rows: Vec<(i64, String, String, String, String, i64)> = sqlx::query_as(
            "SELECT seq, server_msg_id, client_msg_id, sender_session, text, server_ts
             FROM messages
             WHERE conversation_id = ? AND seq > ?
             ORDER BY seq ASC
             LIMIT ?",
        )
        .bind(conversation_id)
        .bind(after)
        .bind(i64::from(limit) + 1)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        let has_more = rows.len() > limit as usize;
        let messages = rows
            .into_iter()
            .take(limit as usize)
            .map(|r| StoredMessage {
                seq: r.0,
                server_msg_id: r.1,
                client_msg_id: r.2,
                sender_session_id: r.3,
                text: r.4,
                server_ts: r.5,
            })
            .collect();

        Ok(HistoryPage { messages, has_more })
    }

    async fn ensure_conversation(
        &self,
        id: &str,
        kind: ConversationKind,
        visibility: Visibility,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO conversations (id, kind, visibility, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(id)
        .bind(kind.as_str())
        .bind(visibility.as_str())
        .bind(unix_ms())
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn conversation_meta(&self, id: &str) -> Result<Option<ConversationMeta>, StoreError> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT kind, visibility FROM conversations WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(classify)?;
        Ok(row.and_then(|(kind, visibility)| {
            Some(ConversationMeta {
                id: id.to_string(),
                kind: ConversationKind::parse(&kind)?,
                visibility: Visibility::parse(&visibility)?,
            })
        }))
    }

    async fn add_member(
        &self,
        conversation_id: &str,
        user_id: &str,
        role: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO conversation_members (conversation_id, user_id, role) VALUES (?, ?, ?)
             ON CONFLICT(conversation_id, user_id) DO NOTHING",
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(role)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }
}

fn unix_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    async fn test_store() -> SqliteMessageStore {
        // A single connection so every pooled handle sees the same
        // in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteMessageStore::init(&pool).await.unwrap();
        let store = SqliteMessageStore::new(pool);
        store
            .ensure_conversation("room-1", ConversationKind::Room, Visibility::Public)
            .await
            .unwrap();
        store
    }

    fn send(client_msg_id: &str, text: &str) -> AppendRequest {
        AppendRequest {
            conversation_id: "room-1".into(),
            client_msg_id: client_msg_id.into(),
            sender_session_id: "S_A".into(),
            sender_user_id: "alice".into(),
            text: text.into(),
            server_ts: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn seqs_are_gapless_from_one() {
        let store = test_store().await;
        for i in 1..=3 {
            let out = store.append_message(send(&format!("c-{i}"), "hi")).await.unwrap();
            assert_eq!(out.seq, i);
            assert!(!out.already_existed);
        }
    }

    #[tokio::test]
    async fn duplicate_submit_returns_original_ids() {
        let store = test_store().await;
        let first = store.append_message(send("c-1", "hi")).await.unwrap();
        let second = store.append_message(send("c-1", "hi")).await.unwrap();
        assert!(second.already_existed);
        assert_eq!(second.server_msg_id, first.server_msg_id);
        assert_eq!(second.seq, first.seq);

        // The abandoned allocation must not leave a gap.
        let next = store.append_message(send("c-2", "hi")).await.unwrap();
        assert_eq!(next.seq, first.seq + 1);
    }

    #[tokio::test]
    async fn text_validation() {
        let store = test_store().await;
        assert!(matches!(
            store.append_message(send("c-1", "")).await,
            Err(StoreError::TextEmpty)
        ));
        let long = "x".repeat(MAX_TEXT_CHARS + 1);
        assert!(matches!(
            store.append_message(send("c-2", &long)).await,
            Err(StoreError::TextTooLong)
        ));
    }

    #[tokio::test]
    async fn unknown_conversation_rejected() {
        let store = test_store().await;
        let mut req = send("c-1", "hi");
        req.conversation_id = "nowhere".into();
        assert!(matches!(
            store.append_message(req).await,
            Err(StoreError::UnknownConversation)
        ));
    }

    #[tokio::test]
    async fn private_conversation_requires_membership() {
        let store = test_store().await;
        store
            .ensure_conversation("dm-1", ConversationKind::Direct, Visibility::Private)
            .await
            .unwrap();
        let mut req = send("c-1", "psst");
        req.conversation_id = "dm-1".into();

        assert!(matches!(
            store.append_message(req.clone()).await,
            Err(StoreError::Forbidden)
        ));

        store.add_member("dm-1", "alice", "member").await.unwrap();
        let out = store.append_message(req).await.unwrap();
        assert_eq!(out.seq, 1);
    }

    #[tokio::test]
    async fn history_window_and_has_more() {
        let store = test_store().await;
        for i in 1..=10 {
            store.append_message(send(&format!("c-{i}"), "hi")).await.unwrap();
        }

        let page = store.fetch_history("room-1", Some(4), 3).await.unwrap();
        assert_eq!(
            page.messages.iter().map(|m| m.seq).collect::<Vec<_>>(),
            vec![5, 6, 7]
        );
        assert!(page.has_more);

        let page = store.fetch_history("room-1", Some(7), 10).await.unwrap();
        assert_eq!(
            page.messages.iter().map(|m| m.seq).collect::<Vec<_>>(),
            vec![8, 9, 10]
        );
        assert!(!page.has_more);

        let page = store.fetch_history("room-1", None, 200).await.unwrap();
        assert_eq!(page.messages.len(), 10);
        assert_eq!(page.messages[0].seq, 1);
    }

    #[tokio::test]
    async fn history_limit_is_clamped() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteMessageStore::init(&pool).await.unwrap();
        let store = SqliteMessageStore::new(pool).with_max_history_limit(4);
        store
            .ensure_conversation("room-1", ConversationKind::Room, Visibility::Public)
            .await
            .unwrap();
        for i in 1..=6 {
            store.append_message(send(&format!("c-{i}"), "hi")).await.unwrap();
        }
        let page = store.fetch_history("room-1", None, 100).await.unwrap();
        assert_eq!(page.messages.len(), 4);
        assert!(page.has_more);
    }

    #[tokio::test]
    async fn concurrent_appends_serialize_without_gaps() {
        let store = Arc::new(test_store().await);
        let mut handles = Vec::new();
        for i in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .append_message(send(&format!("c-{i}"), "go"))
                    .await
                    .unwrap()
                    .seq
            }));
        }
        let mut seqs = Vec::new();
        for h in handles {
            seqs.push(h.await.unwrap());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=20).collect::<Vec<i64>>());
    }
}
