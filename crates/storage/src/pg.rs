use crate::{
    CredentialStore, MessageStatusRecord, NewMessageStatus, NewPendingMessage, NewUserRecord,
    OneTimePreKeyRecord, PendingMessageRecord, RefreshTokenRecord, SignedPreKeyRecord, StoreError,
    UserRecord, UserUpdate,
};
use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, Row};

const INIT_SQL: &str = include_str!("../migrations/001_init.sql");

pub struct PgStore {
    client: Client,
    _pg_task: JoinHandle<()>,
}

/// Establishes connectivity to the PostgreSQL backend.
pub async fn connect(postgres_dsn: &str) -> Result<PgStore, StoreError> {
    let (client, connection) = tokio_postgres::connect(postgres_dsn, NoTls)
        .await
        .map_err(|_| StoreError::Unavailable)?;
    let task = tokio::spawn(async move {
        if let Err(error) = connection.await {
            tracing::error!("postgres connection stopped: {}", error);
        }
    });
    Ok(PgStore {
        client,
        _pg_task: task,
    })
}

fn map_pg_error(error: tokio_postgres::Error) -> StoreError {
    if error
        .code()
        .is_some_and(|code| *code == SqlState::UNIQUE_VIOLATION)
    {
        StoreError::Duplicate
    } else {
        StoreError::Unavailable
    }
}

fn user_from_row(row: &Row) -> UserRecord {
    UserRecord {
        user_id: row.get(0),
        name: row.get(1),
        password_hash: row.get(2),
        totp_url: row.get(3),
        notification_token: row.get(4),
        identity_key: row.get(5),
        registration_id: row.get(6),
        created_at: row.get(7),
        updated_at: row.get(8),
    }
}

const USER_COLUMNS: &str = "user_id, name, password_hash, totp_url, notification_token, identity_key, registration_id, created_at, updated_at";

impl PgStore {
    /// Applies bundled migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        self.client
            .batch_execute(INIT_SQL)
            .await
            .map_err(|_| StoreError::Unavailable)
    }

    /// Executes a lightweight readiness probe.
    pub async fn readiness(&self) -> Result<(), StoreError> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map_err(|_| StoreError::Unavailable)?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn create_user(&self, user: &NewUserRecord) -> Result<UserRecord, StoreError> {
        let now = Utc::now();
        let query = format!(
            "INSERT INTO app_user (user_id, name, password_hash, identity_key, registration_id, notification_token, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            RETURNING {USER_COLUMNS}"
        );
        let row = self
            .client
            .query_one(
                query.as_str(),
                &[
                    &user.user_id,
                    &user.name,
                    &user.password_hash,
                    &user.identity_key,
                    &user.registration_id,
                    &user.notification_token,
                    &now,
                ],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(user_from_row(&row))
    }

    async fn find_user_by_name(&self, name: &str) -> Result<UserRecord, StoreError> {
        let query = format!("SELECT {USER_COLUMNS} FROM app_user WHERE name = $1");
        let row = self
            .client
            .query_opt(query.as_str(), &[&name])
            .await
            .map_err(|_| StoreError::Unavailable)?;
        row.map(|row| user_from_row(&row)).ok_or(StoreError::Missing)
    }

    async fn find_user_by_id(&self, user_id: &str) -> Result<UserRecord, StoreError> {
        let query = format!("SELECT {USER_COLUMNS} FROM app_user WHERE user_id = $1");
        let row = self
            .client
            .query_opt(query.as_str(), &[&user_id])
            .await
            .map_err(|_| StoreError::Unavailable)?;
        row.map(|row| user_from_row(&row)).ok_or(StoreError::Missing)
    }

    async fn list_users_by_name(
        &self,
        search: &str,
        exclude_user_id: &str,
    ) -> Result<Vec<UserRecord>, StoreError> {
        let pattern = format!(
            "%{}%",
            search.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
        );
        let query = format!(
            "SELECT {USER_COLUMNS} FROM app_user WHERE name LIKE $1 AND user_id <> $2 ORDER BY name ASC"
        );
        let rows = self
            .client
            .query(query.as_str(), &[&pattern, &exclude_user_id])
            .await
            .map_err(|_| StoreError::Unavailable)?;
        Ok(rows.iter().map(user_from_row).collect())
    }

    async fn update_user(&self, user_id: &str, update: &UserUpdate) -> Result<(), StoreError> {
        let now = Utc::now();
        let affected = self
            .client
            .execute(
                "UPDATE app_user SET
                    totp_url = COALESCE($2, totp_url),
                    notification_token = COALESCE($3, notification_token),
                    identity_key = COALESCE($4, identity_key),
                    registration_id = COALESCE($5, registration_id),
                    updated_at = $6
                WHERE user_id = $1",
                &[
                    &user_id,
                    &update.totp_url,
                    &update.notification_token,
                    &update.identity_key,
                    &update.registration_id,
                    &now,
                ],
            )
            .await
            .map_err(|_| StoreError::Unavailable)?;
        if affected == 0 {
            return Err(StoreError::Missing);
        }
        Ok(())
    }

    async fn delete_user(&self, user_id: &str) -> Result<(), StoreError> {
        let affected = self
            .client
            .execute("DELETE FROM app_user WHERE user_id = $1", &[&user_id])
            .await
            .map_err(|_| StoreError::Unavailable)?;
        if affected == 0 {
            return Err(StoreError::Missing);
        }
        Ok(())
    }

    async fn create_refresh_token(&self, token: &RefreshTokenRecord) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO refresh_token (token_id, user_id, value, issued_at) VALUES ($1, $2, $3, $4)",
                &[&token.token_id, &token.user_id, &token.value, &token.issued_at],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(())
    }

    async fn find_refresh_token(&self, value: &str) -> Result<RefreshTokenRecord, StoreError> {
        let row = self
            .client
            .query_opt(
                "SELECT token_id, user_id, value, issued_at FROM refresh_token WHERE value = $1",
                &[&value],
            )
            .await
            .map_err(|_| StoreError::Unavailable)?;
        let row = row.ok_or(StoreError::Missing)?;
        Ok(RefreshTokenRecord {
            token_id: row.get(0),
            user_id: row.get(1),
            value: row.get(2),
            issued_at: row.get(3),
        })
    }

    async fn delete_refresh_token(&self, value: &str) -> Result<(), StoreError> {
        let affected = self
            .client
            .execute("DELETE FROM refresh_token WHERE value = $1", &[&value])
            .await
            .map_err(|_| StoreError::Unavailable)?;
        if affected == 0 {
            return Err(StoreError::Missing);
        }
        Ok(())
    }

    async fn create_one_time_pre_keys(
        &self,
        keys: &[OneTimePreKeyRecord],
    ) -> Result<(), StoreError> {
        for key in keys {
            self.client
                .execute(
                    "INSERT INTO one_time_pre_key (user_id, key_id, public_key) VALUES ($1, $2, $3)
                    ON CONFLICT (user_id, key_id) DO UPDATE SET public_key = excluded.public_key",
                    &[&key.user_id, &key.key_id, &key.public_key],
                )
                .await
                .map_err(|_| StoreError::Unavailable)?;
        }
        Ok(())
    }

    async fn consume_one_time_pre_key(
        &self,
        user_id: &str,
    ) -> Result<Option<OneTimePreKeyRecord>, StoreError> {
        let query = "DELETE FROM one_time_pre_key
            WHERE user_id = $1 AND key_id = (
                SELECT key_id FROM one_time_pre_key
                WHERE user_id = $1
                ORDER BY key_id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING key_id, public_key";
        let row = self
            .client
            .query_opt(query, &[&user_id])
            .await
            .map_err(|_| StoreError::Unavailable)?;
        Ok(row.map(|row| OneTimePreKeyRecord {
            key_id: row.get(0),
            user_id: user_id.to_string(),
            public_key: row.get(1),
        }))
    }

    async fn upsert_signed_pre_key(&self, key: &SignedPreKeyRecord) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO signed_pre_key (user_id, key_id, public_key, signature) VALUES ($1, $2, $3, $4)
                ON CONFLICT (user_id) DO UPDATE SET key_id = excluded.key_id, public_key = excluded.public_key, signature = excluded.signature",
                &[&key.user_id, &key.key_id, &key.public_key, &key.signature],
            )
            .await
            .map_err(|_| StoreError::Unavailable)?;
        Ok(())
    }

    async fn find_signed_pre_key(
        &self,
        user_id: &str,
    ) -> Result<Option<SignedPreKeyRecord>, StoreError> {
        let row = self
            .client
            .query_opt(
                "SELECT key_id, public_key, signature FROM signed_pre_key WHERE user_id = $1",
                &[&user_id],
            )
            .await
            .map_err(|_| StoreError::Unavailable)?;
        Ok(row.map(|row| SignedPreKeyRecord {
            key_id: row.get(0),
            user_id: user_id.to_string(),
            public_key: row.get(1),
            signature: row.get(2),
        }))
    }

    async fn create_pending_message(
        &self,
        message: &NewPendingMessage,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        self.client
            .execute(
                "INSERT INTO pending_message (message_id, content, sender_id, receiver_id, sent_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (message_id) DO NOTHING",
                &[
                    &message.message_id,
                    &message.content,
                    &message.sender_id,
                    &message.receiver_id,
                    &now,
                ],
            )
            .await
            .map_err(|_| StoreError::Unavailable)?;
        Ok(())
    }

    async fn find_pending_messages_for_user(
        &self,
        receiver_id: &str,
    ) -> Result<Vec<PendingMessageRecord>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT m.message_id, m.content, m.sender_id, u.name, m.sent_at
                FROM pending_message m
                INNER JOIN app_user u ON u.user_id = m.sender_id
                WHERE m.receiver_id = $1
                ORDER BY m.sent_at ASC",
                &[&receiver_id],
            )
            .await
            .map_err(|_| StoreError::Unavailable)?;
        Ok(rows
            .into_iter()
            .map(|row| PendingMessageRecord {
                message_id: row.get(0),
                content: row.get(1),
                sender_id: row.get(2),
                sender_name: row.get(3),
                sent_at: row.get(4),
            })
            .collect())
    }

    async fn delete_pending_messages_for_user(
        &self,
        receiver_id: &str,
    ) -> Result<u64, StoreError> {
        self.client
            .execute(
                "DELETE FROM pending_message WHERE receiver_id = $1",
                &[&receiver_id],
            )
            .await
            .map_err(|_| StoreError::Unavailable)
    }

    async fn create_message_status(&self, status: &NewMessageStatus) -> Result<(), StoreError> {
        let now = Utc::now();
        self.client
            .execute(
                "INSERT INTO message_status (message_id, state, sender_id, created_at) VALUES ($1, $2, $3, $4)",
                &[&status.message_id, &status.state, &status.sender_id, &now],
            )
            .await
            .map_err(|_| StoreError::Unavailable)?;
        Ok(())
    }

    async fn find_message_statuses_for_user(
        &self,
        sender_id: &str,
    ) -> Result<Vec<MessageStatusRecord>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT message_id, state, sender_id, created_at FROM message_status
                WHERE sender_id = $1 ORDER BY created_at ASC",
                &[&sender_id],
            )
            .await
            .map_err(|_| StoreError::Unavailable)?;
        Ok(rows
            .into_iter()
            .map(|row| MessageStatusRecord {
                message_id: row.get(0),
                state: row.get(1),
                sender_id: row.get(2),
                created_at: row.get(3),
            })
            .collect())
    }
}
