//! Sessions-table access verification.

use {async_trait::async_trait, sqlx::SqlitePool, tracing::info};

use crate::{AccessBinding, AccessGrant, AuthError, RevocationBus};

/// Lifetime of dev-mode anonymous sessions.
const ANON_SESSION_TTL_MS: i64 = 24 * 60 * 60 * 1000;

pub struct SqliteAccessBinding {
    pool: SqlitePool,
    revocations: RevocationBus,
    /// When set, a handshake without a token mints an ephemeral anonymous
    /// session instead of failing.
    dev_allow_anon: bool,
}

impl SqliteAccessBinding {
    pub fn new(pool: SqlitePool, revocations: RevocationBus) -> Self {
        Self {
            pool,
            revocations,
            dev_allow_anon: false,
        }
    }

    pub fn with_dev_allow_anon(mut self, allow: bool) -> Self {
        self.dev_allow_anon = allow;
        self
    }

    /// Initialize the sessions schema.
    ///
    /// Production deployments apply the schema out-of-band; this is retained
    /// for tests and dev bootstrapping.
    #[doc(hidden)]
    pub async fn init(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id         TEXT    PRIMARY KEY,
                user_id    TEXT    NOT NULL,
                token      TEXT    NOT NULL UNIQUE,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                revoked_at INTEGER
            )",
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Mint a session for `user_id`, returning `(session_id, token)`.
    /// Session ids are ULIDs; tokens are opaque.
    pub async fn create_session(
        &self,
        user_id: &str,
        now_ms: i64,
        ttl_ms: i64,
    ) -> Result<(String, String), AuthError> {
        let session_id = ulid::Ulid::new().to_string();
        let token = uuid::Uuid::new_v4().simple().to_string();
        sqlx::query(
            "INSERT INTO sessions (id, user_id, token, created_at, expires_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&session_id)
        .bind(user_id)
        .bind(&token)
        .bind(now_ms)
        .bind(now_ms + ttl_ms)
        .execute(&self.pool)
        .await?;
        Ok((session_id, token))
    }

    /// Revoke every live session of a user and notify the gateway.
    pub async fn revoke_user(&self, user_id: &str, now_ms: i64) -> Result<u64, AuthError> {
        let result = sqlx::query(
            "UPDATE sessions SET revoked_at = ? WHERE user_id = ? AND revoked_at IS NULL",
        )
        .bind(now_ms)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        info!(user_id, sessions = result.rows_affected(), "auth: user revoked");
        self.revocations.notify(user_id);
        Ok(result.rows_affected())
    }

    async fn anonymous_grant(&self, now_ms: i64) -> Result<AccessGrant, AuthError> {
        let user_id = format!("anon-{}", ulid::Ulid::new().to_string().to_lowercase());
        let (session_id, _token) = self
            .create_session(&user_id, now_ms, ANON_SESSION_TTL_MS)
            .await?;
        Ok(AccessGrant {
            user_id,
            session_id,
            expires_at: now_ms + ANON_SESSION_TTL_MS,
        })
    }
}

#[async_trait]
impl AccessBinding for SqliteAccessBinding {
    async fn verify_access(
        &self,
        token: Option<&str>,
        now_ms: i64,
    ) -> Result<AccessGrant, AuthError> {
        let token = match token {
            Some(t) if !t.is_empty() => t,
            _ if self.dev_allow_anon => return self.anonymous_grant(now_ms).await,
            _ => return Err(AuthError::Unauthorized),
        };

        let row: Option<(String, String, i64)> = sqlx::query_as(
            "SELECT id, user_id, expires_at FROM sessions
             WHERE token = ? AND revoked_at IS NULL",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((session_id, user_id, expires_at)) if expires_at > now_ms => Ok(AccessGrant {
                user_id,
                session_id,
                expires_at,
            }),
            _ => Err(AuthError::Unauthorized),
        }
    }

    async fn is_member(&self, conversation_id: &str, user_id: &str) -> Result<bool, AuthError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM conversation_members WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    async fn test_binding(dev: bool) -> SqliteAccessBinding {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteAccessBinding::init(&pool).await.unwrap();
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversation_members (
                conversation_id TEXT NOT NULL,
                user_id         TEXT NOT NULL,
                role            TEXT NOT NULL DEFAULT 'member',
                PRIMARY KEY (conversation_id, user_id)
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        SqliteAccessBinding::new(pool, RevocationBus::new()).with_dev_allow_anon(dev)
    }

    #[tokio::test]
    async fn valid_token_grants_access() {
        let binding = test_binding(false).await;
        let (session_id, token) = binding.create_session("alice", NOW, 60_000).await.unwrap();
        assert_eq!(session_id.len(), 26);

        let grant = binding.verify_access(Some(&token), NOW).await.unwrap();
        assert_eq!(grant.user_id, "alice");
        assert_eq!(grant.session_id, session_id);
    }

    #[tokio::test]
    async fn expired_and_unknown_tokens_rejected() {
        let binding = test_binding(false).await;
        let (_, token) = binding.create_session("alice", NOW, 60_000).await.unwrap();

        assert!(matches!(
            binding.verify_access(Some(&token), NOW + 120_000).await,
            Err(AuthError::Unauthorized)
        ));
        assert!(matches!(
            binding.verify_access(Some("nope"), NOW).await,
            Err(AuthError::Unauthorized)
        ));
        assert!(matches!(
            binding.verify_access(None, NOW).await,
            Err(AuthError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn revocation_invalidates_and_notifies() {
        let binding = test_binding(false).await;
        let (_, token) = binding.create_session("alice", NOW, 60_000).await.unwrap();
        let mut rx = binding.revocations.subscribe();

        let revoked = binding.revoke_user("alice", NOW).await.unwrap();
        assert_eq!(revoked, 1);
        assert_eq!(rx.recv().await.unwrap(), "alice");
        assert!(matches!(
            binding.verify_access(Some(&token), NOW).await,
            Err(AuthError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn dev_mode_mints_anonymous_sessions() {
        let binding = test_binding(true).await;
        let a = binding.verify_access(None, NOW).await.unwrap();
        let b = binding.verify_access(None, NOW).await.unwrap();
        assert_ne!(a.session_id, b.session_id);
        assert!(a.user_id.starts_with("anon-"));
        assert_eq!(a.session_id.len(), 26);
    }

    #[tokio::test]
    async fn membership_lookup() {
        let binding = test_binding(false).await;
        sqlx::query("INSERT INTO conversation_members (conversation_id, user_id, role) VALUES ('dm-1', 'alice', 'member')")
            .execute(&binding.pool)
            .await
            .unwrap();
        assert!(binding.is_member("dm-1", "alice").await.unwrap());
        assert!(!binding.is_member("dm-1", "mallory").await.unwrap());
    }
}
