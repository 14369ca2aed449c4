use crate::{
    CredentialStore, MessageStatusRecord, NewMessageStatus, NewPendingMessage, NewUserRecord,
    OneTimePreKeyRecord, PendingMessageRecord, RefreshTokenRecord, SignedPreKeyRecord, StoreError,
    UserRecord, UserUpdate,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// In-memory credential store for tests and local development. A single lock
/// guards all tables, so every operation is atomic against concurrent
/// callers, including one-time pre-key consumption.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    users: Vec<UserRecord>,
    refresh_tokens: Vec<RefreshTokenRecord>,
    one_time_pre_keys: Vec<OneTimePreKeyRecord>,
    signed_pre_keys: HashMap<String, SignedPreKeyRecord>,
    pending_messages: Vec<StoredPendingMessage>,
    message_statuses: Vec<MessageStatusRecord>,
}

struct StoredPendingMessage {
    message_id: String,
    content: String,
    sender_id: String,
    receiver_id: String,
    sent_at: DateTime<Utc>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn create_user(&self, user: &NewUserRecord) -> Result<UserRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner
            .users
            .iter()
            .any(|existing| existing.name == user.name || existing.user_id == user.user_id)
        {
            return Err(StoreError::Duplicate);
        }
        let now = Utc::now();
        let record = UserRecord {
            user_id: user.user_id.clone(),
            name: user.name.clone(),
            password_hash: user.password_hash.clone(),
            totp_url: None,
            notification_token: user.notification_token.clone(),
            identity_key: user.identity_key.clone(),
            registration_id: user.registration_id,
            created_at: now,
            updated_at: now,
        };
        inner.users.push(record.clone());
        Ok(record)
    }

    async fn find_user_by_name(&self, name: &str) -> Result<UserRecord, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .users
            .iter()
            .find(|user| user.name == name)
            .cloned()
            .ok_or(StoreError::Missing)
    }

    async fn find_user_by_id(&self, user_id: &str) -> Result<UserRecord, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .users
            .iter()
            .find(|user| user.user_id == user_id)
            .cloned()
            .ok_or(StoreError::Missing)
    }

    async fn list_users_by_name(
        &self,
        search: &str,
        exclude_user_id: &str,
    ) -> Result<Vec<UserRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let mut matches: Vec<UserRecord> = inner
            .users
            .iter()
            .filter(|user| user.name.contains(search) && user.user_id != exclude_user_id)
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(matches)
    }

    async fn update_user(&self, user_id: &str, update: &UserUpdate) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let user = inner
            .users
            .iter_mut()
            .find(|user| user.user_id == user_id)
            .ok_or(StoreError::Missing)?;
        if let Some(totp_url) = update.totp_url.as_ref() {
            user.totp_url = Some(totp_url.clone());
        }
        if let Some(token) = update.notification_token.as_ref() {
            user.notification_token = Some(token.clone());
        }
        if let Some(identity_key) = update.identity_key.as_ref() {
            user.identity_key = Some(identity_key.clone());
        }
        if let Some(registration_id) = update.registration_id {
            user.registration_id = Some(registration_id);
        }
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_user(&self, user_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.users.len();
        inner.users.retain(|user| user.user_id != user_id);
        if inner.users.len() == before {
            return Err(StoreError::Missing);
        }
        inner.refresh_tokens.retain(|token| token.user_id != user_id);
        inner.one_time_pre_keys.retain(|key| key.user_id != user_id);
        inner.signed_pre_keys.remove(user_id);
        inner
            .pending_messages
            .retain(|message| message.sender_id != user_id && message.receiver_id != user_id);
        inner
            .message_statuses
            .retain(|status| status.sender_id != user_id);
        Ok(())
    }

    async fn create_refresh_token(&self, token: &RefreshTokenRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner
            .refresh_tokens
            .iter()
            .any(|existing| existing.value == token.value || existing.token_id == token.token_id)
        {
            return Err(StoreError::Duplicate);
        }
        inner.refresh_tokens.push(token.clone());
        Ok(())
    }

    async fn find_refresh_token(&self, value: &str) -> Result<RefreshTokenRecord, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .refresh_tokens
            .iter()
            .find(|token| token.value == value)
            .cloned()
            .ok_or(StoreError::Missing)
    }

    async fn delete_refresh_token(&self, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.refresh_tokens.len();
        inner.refresh_tokens.retain(|token| token.value != value);
        if inner.refresh_tokens.len() == before {
            return Err(StoreError::Missing);
        }
        Ok(())
    }

    async fn create_one_time_pre_keys(
        &self,
        keys: &[OneTimePreKeyRecord],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for key in keys {
            inner
                .one_time_pre_keys
                .retain(|existing| !(existing.user_id == key.user_id && existing.key_id == key.key_id));
            inner.one_time_pre_keys.push(key.clone());
        }
        Ok(())
    }

    async fn consume_one_time_pre_key(
        &self,
        user_id: &str,
    ) -> Result<Option<OneTimePreKeyRecord>, StoreError> {
        let mut inner = self.inner.lock().await;
        let selected = inner
            .one_time_pre_keys
            .iter()
            .enumerate()
            .filter(|(_, key)| key.user_id == user_id)
            .min_by_key(|(_, key)| key.key_id)
            .map(|(index, _)| index);
        Ok(selected.map(|index| inner.one_time_pre_keys.remove(index)))
    }

    async fn upsert_signed_pre_key(&self, key: &SignedPreKeyRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .signed_pre_keys
            .insert(key.user_id.clone(), key.clone());
        Ok(())
    }

    async fn find_signed_pre_key(
        &self,
        user_id: &str,
    ) -> Result<Option<SignedPreKeyRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.signed_pre_keys.get(user_id).cloned())
    }

    async fn create_pending_message(
        &self,
        message: &NewPendingMessage,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner
            .pending_messages
            .iter()
            .any(|existing| existing.message_id == message.message_id)
        {
            return Ok(());
        }
        inner.pending_messages.push(StoredPendingMessage {
            message_id: message.message_id.clone(),
            content: message.content.clone(),
            sender_id: message.sender_id.clone(),
            receiver_id: message.receiver_id.clone(),
            sent_at: Utc::now(),
        });
        Ok(())
    }

    async fn find_pending_messages_for_user(
        &self,
        receiver_id: &str,
    ) -> Result<Vec<PendingMessageRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .pending_messages
            .iter()
            .filter(|message| message.receiver_id == receiver_id)
            .map(|message| PendingMessageRecord {
                message_id: message.message_id.clone(),
                content: message.content.clone(),
                sender_id: message.sender_id.clone(),
                sender_name: inner
                    .users
                    .iter()
                    .find(|user| user.user_id == message.sender_id)
                    .map(|user| user.name.clone())
                    .unwrap_or_default(),
                sent_at: message.sent_at,
            })
            .collect())
    }

    async fn delete_pending_messages_for_user(
        &self,
        receiver_id: &str,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.pending_messages.len();
        inner
            .pending_messages
            .retain(|message| message.receiver_id != receiver_id);
        Ok((before - inner.pending_messages.len()) as u64)
    }

    async fn create_message_status(&self, status: &NewMessageStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.message_statuses.push(MessageStatusRecord {
            message_id: status.message_id.clone(),
            state: status.state.clone(),
            sender_id: status.sender_id.clone(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn find_message_statuses_for_user(
        &self,
        sender_id: &str,
    ) -> Result<Vec<MessageStatusRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .message_statuses
            .iter()
            .filter(|status| status.sender_id == sender_id)
            .cloned()
            .collect())
    }
}
