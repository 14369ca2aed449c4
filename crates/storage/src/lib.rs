use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::error::Error;
use std::fmt::{Display, Formatter};

mod memory;
mod pg;

pub use memory::MemoryStore;
pub use pg::{PgStore, connect};

#[derive(Debug)]
pub enum StoreError {
    Unavailable,
    Missing,
    Duplicate,
    Serialization,
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable => write!(f, "store unavailable"),
            Self::Missing => write!(f, "missing record"),
            Self::Duplicate => write!(f, "duplicate record"),
            Self::Serialization => write!(f, "serialization failure"),
        }
    }
}

impl Error for StoreError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUserRecord {
    pub user_id: String,
    pub name: String,
    pub password_hash: String,
    pub identity_key: Option<String>,
    pub registration_id: Option<i32>,
    pub notification_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user_id: String,
    pub name: String,
    pub password_hash: String,
    pub totp_url: Option<String>,
    pub notification_token: Option<String>,
    pub identity_key: Option<String>,
    pub registration_id: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial user update; absent fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserUpdate {
    pub totp_url: Option<String>,
    pub notification_token: Option<String>,
    pub identity_key: Option<String>,
    pub registration_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTokenRecord {
    pub token_id: String,
    pub user_id: String,
    pub value: String,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneTimePreKeyRecord {
    pub key_id: i64,
    pub user_id: String,
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPreKeyRecord {
    pub key_id: i64,
    pub user_id: String,
    pub public_key: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPendingMessage {
    pub message_id: String,
    pub content: String,
    pub sender_id: String,
    pub receiver_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessageRecord {
    pub message_id: String,
    pub content: String,
    pub sender_id: String,
    pub sender_name: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessageStatus {
    pub message_id: String,
    pub state: String,
    pub sender_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageStatusRecord {
    pub message_id: String,
    pub state: String,
    pub sender_id: String,
    pub created_at: DateTime<Utc>,
}

/// The persistence contract the core consumes. Every operation is atomic on
/// its own; callers composing several calls accept best-effort consistency
/// between them.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn create_user(&self, user: &NewUserRecord) -> Result<UserRecord, StoreError>;
    async fn find_user_by_name(&self, name: &str) -> Result<UserRecord, StoreError>;
    async fn find_user_by_id(&self, user_id: &str) -> Result<UserRecord, StoreError>;
    async fn list_users_by_name(
        &self,
        search: &str,
        exclude_user_id: &str,
    ) -> Result<Vec<UserRecord>, StoreError>;
    async fn update_user(&self, user_id: &str, update: &UserUpdate) -> Result<(), StoreError>;
    async fn delete_user(&self, user_id: &str) -> Result<(), StoreError>;

    async fn create_refresh_token(&self, token: &RefreshTokenRecord) -> Result<(), StoreError>;
    async fn find_refresh_token(&self, value: &str) -> Result<RefreshTokenRecord, StoreError>;
    async fn delete_refresh_token(&self, value: &str) -> Result<(), StoreError>;

    async fn create_one_time_pre_keys(
        &self,
        keys: &[OneTimePreKeyRecord],
    ) -> Result<(), StoreError>;
    /// Atomically removes and returns one available pre-key, or `None` when
    /// the pool is exhausted. Two concurrent calls never observe the same key.
    async fn consume_one_time_pre_key(
        &self,
        user_id: &str,
    ) -> Result<Option<OneTimePreKeyRecord>, StoreError>;
    async fn upsert_signed_pre_key(&self, key: &SignedPreKeyRecord) -> Result<(), StoreError>;
    async fn find_signed_pre_key(
        &self,
        user_id: &str,
    ) -> Result<Option<SignedPreKeyRecord>, StoreError>;

    async fn create_pending_message(&self, message: &NewPendingMessage)
        -> Result<(), StoreError>;
    async fn find_pending_messages_for_user(
        &self,
        receiver_id: &str,
    ) -> Result<Vec<PendingMessageRecord>, StoreError>;
    async fn delete_pending_messages_for_user(&self, receiver_id: &str)
        -> Result<u64, StoreError>;

    async fn create_message_status(&self, status: &NewMessageStatus) -> Result<(), StoreError>;
    async fn find_message_statuses_for_user(
        &self,
        sender_id: &str,
    ) -> Result<Vec<MessageStatusRecord>, StoreError>;
}
