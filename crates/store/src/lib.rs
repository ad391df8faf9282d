//! Durable message storage: atomic seq allocation, idempotent append,
//! windowed history.
//!
//! The store is the only writer of durable state. Callers retry transient
//! failures; the store itself never retries.

pub mod error;
pub mod sqlite;

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
};

pub use {error::StoreError, sqlite::SqliteMessageStore};

/// Hard ceiling on message text length, in characters.
pub const MAX_TEXT_CHARS: usize = 4096;

/// Default ceiling on a single history page.
pub const DEFAULT_MAX_HISTORY_LIMIT: u32 = 200;

// ── Conversation metadata ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
    Room,
}

impl ConversationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
            Self::Room => "room",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(Self::Direct),
            "group" => Some(Self::Group),
            "room" => Some(Self::Room),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(Self::Public),
            "private" => Some(Self::Private),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationMeta {
    pub id: String,
    pub kind: ConversationKind,
    pub visibility: Visibility,
}

// ── Append ───────────────────────────────────────────────────────────────────

/// One send intent, validated and attributed.
///
/// `sender_user_id` rides along so the private-membership check runs inside
/// the same transaction as the insert; the durable row stores only the
/// session id.
#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub conversation_id: String,
    pub client_msg_id: String,
    pub sender_session_id: String,
    pub sender_user_id: String,
    pub text: String,
    pub server_ts: i64,
}

#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub server_msg_id: String,
    pub seq: i64,
    pub server_ts: i64,
    /// True when `(conversation_id, client_msg_id)` was already durable; the
    /// returned ids belong to the original insert and the caller must not
    /// re-broadcast.
    pub already_existed: bool,
}

// ── History ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub seq: i64,
    pub server_msg_id: String,
    pub client_msg_id: String,
    pub sender_session_id: String,
    pub text: String,
    pub server_ts: i64,
}

#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub messages: Vec<StoredMessage>,
    pub has_more: bool,
}

// ── Capability interface ─────────────────────────────────────────────────────

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Durable append with atomic seq allocation. At-most-once per
    /// `(conversation_id, client_msg_id)`.
    async fn append_message(&self, req: AppendRequest) -> Result<AppendOutcome, StoreError>;

    /// Messages with `seq > after_seq` in ascending order, up to
    /// `min(limit, max_history_limit)`.
    async fn fetch_history(
        &self,
        conversation_id: &str,
        after_seq: Option<i64>,
        limit: u32,
    ) -> Result<HistoryPage, StoreError>;

    /// Create the conversation row if absent. Idempotent.
    async fn ensure_conversation(
        &self,
        id: &str,
        kind: ConversationKind,
        visibility: Visibility,
    ) -> Result<(), StoreError>;

    async fn conversation_meta(&self, id: &str) -> Result<Option<ConversationMeta>, StoreError>;

    /// Membership provisioning for boot and test tooling.
    async fn add_member(
        &self,
        conversation_id: &str,
        user_id: &str,
        role: &str,
    ) -> Result<(), StoreError>;
}
