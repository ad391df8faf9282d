use thiserror::Error;

use crate::MAX_TEXT_CHARS;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("text is empty")]
    TextEmpty,

    #[error("text exceeds {MAX_TEXT_CHARS} characters")]
    TextTooLong,

    #[error("sender is not a member of this conversation")]
    Forbidden,

    #[error("unknown conversation")]
    UnknownConversation,

    /// Busy/locked/pool-exhaustion class; callers may retry with backoff.
    #[error("transient storage failure: {0}")]
    Transient(String),

    #[error("database error")]
    Db(#[source] sqlx::Error),
}

/// Map a raw sqlx error into the taxonomy. SQLite busy/locked result codes
/// and pool timeouts are retryable; everything else is terminal.
pub(crate) fn classify(err: sqlx::Error) -> StoreError {
    let transient = match &err {
        sqlx::Error::PoolTimedOut => Some("connection pool timeout".to_string()),
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            // 5 = SQLITE_BUSY, 6 = SQLITE_LOCKED, 261/517 = busy variants.
            if matches!(code.as_str(), "5" | "6" | "261" | "517") {
                Some(db.message().to_string())
            } else {
                None
            }
        },
        _ => None,
    };
    match transient {
        Some(reason) => StoreError::Transient(reason),
        None => StoreError::Db(err),
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation)
        },
        _ => false,
    }
}
