use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::metrics::Metrics;
use crate::presence::PresenceRegistry;
use crate::push::PushGateway;
use crate::util::generate_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sotto_auth::{
    AccessClaims, AccessPolicy, AuthError, Permission, TokenKeys, TokenVerifier, Totp,
    USER_PERMISSIONS, hash_password, issue_access_token, issue_refresh_token, verify_password,
};
use sotto_storage::{
    CredentialStore, NewUserRecord, OneTimePreKeyRecord, RefreshTokenRecord, SignedPreKeyRecord,
    StoreError, UserRecord, UserUpdate,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub mod router;

const DUMMY_PASSWORD: &str = "sotto-dummy-password";

pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<dyn CredentialStore>,
    pub token_keys: TokenKeys,
    pub verifier: TokenVerifier,
    pub presence: PresenceRegistry,
    pub push: Arc<dyn PushGateway>,
    pub metrics: Arc<Metrics>,
    dummy_password_hash: String,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn CredentialStore>,
        push: Arc<dyn PushGateway>,
    ) -> Result<Arc<Self>, AuthError> {
        let token_keys = TokenKeys::from_seed(&config.token_seed)?;
        let verifier = token_keys.verifier();
        // Hashing a fixed password keeps unknown-user lookups on the same
        // timing path as wrong-password attempts.
        let dummy_password_hash = hash_password(DUMMY_PASSWORD)?;
        Ok(Arc::new(Self {
            config,
            store,
            token_keys,
            verifier,
            presence: PresenceRegistry::new(),
            push,
            metrics: Arc::new(Metrics::new()),
            dummy_password_hash,
        }))
    }
}

/// The stateless operations served at the HTTP boundary. Route wiring lives
/// outside the core; every handler body is a method here.
pub struct App {
    state: Arc<AppState>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub identity_key: Option<String>,
    #[serde(default)]
    pub registration_id: Option<i32>,
    #[serde(default)]
    pub notification_token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug)]
pub enum LoginOutcome {
    Tokens(TokenGrant),
    TotpRequired,
}

pub struct AuthContext {
    pub user: UserRecord,
    pub scope: HashSet<Permission>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileView {
    pub id: String,
    pub name: String,
    pub identity_key: Option<String>,
    pub registration_id: Option<i32>,
    pub notification_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProfileView {
    fn from_record(user: &UserRecord) -> Self {
        Self {
            id: user.user_id.clone(),
            name: user.name.clone(),
            identity_key: user.identity_key.clone(),
            registration_id: user.registration_id,
            notification_token: user.notification_token.clone(),
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    #[serde(default)]
    pub enable_totp: bool,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub notification_token: Option<String>,
}

#[derive(Debug)]
pub enum ProfileUpdateOutcome {
    TotpEnabled(String),
    Updated,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyUpload {
    #[serde(default)]
    pub pre_keys: Vec<UploadedPreKey>,
    #[serde(default)]
    pub signed_pre_key: Option<UploadedSignedPreKey>,
    #[serde(default)]
    pub identity_key: Option<String>,
    #[serde(default)]
    pub registration_id: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedPreKey {
    pub id: i64,
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedSignedPreKey {
    pub id: i64,
    pub public_key: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyBundle {
    pub identity_key: Option<String>,
    pub registration_id: Option<i32>,
    pub signed_pre_key: Option<UploadedSignedPreKey>,
    pub one_time_pre_key: Option<UploadedPreKey>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMessageView {
    pub id: String,
    pub content: String,
    pub sender: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStatusView {
    pub message_id: String,
    pub state: String,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Argon2 is deliberately slow; both helpers run it on the blocking pool so
/// connection tasks keep making progress.
async fn hash_password_blocking(password: String) -> Result<String, ApiError> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|_| ApiError::Internal)?
        .map_err(ApiError::from)
}

async fn verify_password_blocking(stored_hash: String, supplied: String) -> Result<bool, ApiError> {
    tokio::task::spawn_blocking(move || verify_password(&stored_hash, &supplied))
        .await
        .map_err(|_| ApiError::Internal)
}

impl App {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Creates a user and issues their first token pair.
    pub async fn register_user(
        &self,
        request: RegisterRequest,
    ) -> Result<(ProfileView, TokenGrant), ApiError> {
        if request.name.is_empty() || request.password.is_empty() {
            return Err(ApiError::MalformedPayload);
        }
        let password_hash = hash_password_blocking(request.password.clone()).await?;
        let user = self
            .state
            .store
            .create_user(&NewUserRecord {
                user_id: generate_id(&request.name),
                name: request.name,
                password_hash,
                identity_key: request.identity_key,
                registration_id: request.registration_id,
                notification_token: request.notification_token,
            })
            .await?;
        let grant = self.mint_grant(&user.user_id).await?;
        info!(user = %user.name, "user registered");
        Ok((ProfileView::from_record(&user), grant))
    }

    /// Password (and optional TOTP) login. A user with TOTP enabled and no
    /// code supplied gets the totp-required branch rather than a failure.
    pub async fn issue_tokens(
        &self,
        name: &str,
        password: &str,
        totp_code: Option<&str>,
    ) -> Result<LoginOutcome, ApiError> {
        let user = match self.state.store.find_user_by_name(name).await {
            Ok(user) => user,
            Err(StoreError::Missing) => {
                let _ = verify_password_blocking(
                    self.state.dummy_password_hash.clone(),
                    password.to_string(),
                )
                .await;
                debug!(user = %name, "login rejected: unknown user");
                return Err(ApiError::AuthenticationFailed);
            }
            Err(error) => return Err(error.into()),
        };
        if !verify_password_blocking(user.password_hash.clone(), password.to_string()).await? {
            debug!(user = %name, "login rejected: bad password");
            return Err(ApiError::AuthenticationFailed);
        }
        if let Some(totp_url) = user.totp_url.as_deref() {
            let Some(code) = totp_code else {
                return Ok(LoginOutcome::TotpRequired);
            };
            let totp = Totp::from_url(totp_url).map_err(|error| {
                warn!(user = %name, "stored otpauth url unusable: {}", error);
                ApiError::Internal
            })?;
            if totp.validate(code, now_unix()) != Some(0) {
                debug!(user = %name, "login rejected: totp mismatch");
                return Err(ApiError::InvalidTotp);
            }
        }
        let grant = self.mint_grant(&user.user_id).await?;
        info!(user = %user.name, "tokens issued");
        Ok(LoginOutcome::Tokens(grant))
    }

    /// Exchanges a refresh token for a fresh pair. Single-use: the presented
    /// token's row is deleted and a replacement issued, so replaying a
    /// rotated-away token fails.
    pub async fn refresh_tokens(&self, refresh_token: &str) -> Result<TokenGrant, ApiError> {
        let verified = self.state.verifier.verify(refresh_token)?;
        match self.state.store.delete_refresh_token(refresh_token).await {
            Ok(()) => {}
            Err(StoreError::Missing) => {
                warn!(user = %verified.subject, "refresh token replay rejected");
                return Err(ApiError::Unauthenticated(Some("Invalid token".to_string())));
            }
            Err(error) => return Err(error.into()),
        }
        let user = self.state.store.find_user_by_id(&verified.subject).await?;
        let grant = self.mint_grant(&user.user_id).await?;
        info!(user = %user.name, "access token refreshed");
        Ok(grant)
    }

    /// Verifies a bearer access token and loads its subject.
    pub async fn authenticate(&self, bearer: Option<&str>) -> Result<AuthContext, ApiError> {
        let token = bearer.ok_or_else(|| {
            ApiError::Unauthenticated(Some("Missing access token".to_string()))
        })?;
        let verified = self.state.verifier.verify(token)?;
        let Some(scope) = verified.scope.clone() else {
            return Err(ApiError::Forbidden(
                "Token used does not have any permissions (likely a refresh token)".to_string(),
            ));
        };
        let user = self.state.store.find_user_by_id(&verified.subject).await?;
        Ok(AuthContext {
            user,
            scope: scope.into_iter().collect(),
        })
    }

    pub fn authorize(&self, context: &AuthContext, policy: &AccessPolicy) -> Result<(), ApiError> {
        policy
            .check(&context.scope)
            .map_err(|missing| ApiError::missing_permissions(&missing))
    }

    pub async fn list_users(
        &self,
        context: &AuthContext,
        search: &str,
    ) -> Result<Vec<PublicUser>, ApiError> {
        self.authorize(context, &AccessPolicy::new(&[Permission::ProfileRead]))?;
        let users = self
            .state
            .store
            .list_users_by_name(search, &context.user.user_id)
            .await?;
        Ok(users
            .into_iter()
            .map(|user| PublicUser {
                id: user.user_id,
                name: user.name,
                created_at: user.created_at,
            })
            .collect())
    }

    pub async fn get_profile(
        &self,
        context: &AuthContext,
        user_id: &str,
    ) -> Result<ProfileView, ApiError> {
        self.authorize(context, &AccessPolicy::new(&[Permission::ProfileRead]))?;
        self.require_self(context, user_id)?;
        let user = self.state.store.find_user_by_id(user_id).await?;
        Ok(ProfileView::from_record(&user))
    }

    /// Profile mutation: notification-token refresh, and TOTP enablement
    /// (which requires the account password and returns the otpauth URL).
    pub async fn update_profile(
        &self,
        context: &AuthContext,
        user_id: &str,
        update: ProfileUpdate,
    ) -> Result<ProfileUpdateOutcome, ApiError> {
        self.require_self(context, user_id)?;
        let mut changes = UserUpdate {
            notification_token: update.notification_token.clone(),
            ..UserUpdate::default()
        };
        let mut totp_url = None;
        if update.enable_totp {
            let password = update.password.clone().ok_or_else(|| {
                ApiError::Unauthenticated(Some(
                    "Need a valid password to enable TOTP".to_string(),
                ))
            })?;
            if !verify_password_blocking(context.user.password_hash.clone(), password).await? {
                return Err(ApiError::AuthenticationFailed);
            }
            let totp = Totp::generate(&self.state.config.totp_issuer, &context.user.name)
                .map_err(|_| ApiError::Internal)?;
            let url = totp.to_url();
            changes.totp_url = Some(url.clone());
            totp_url = Some(url);
        }
        self.state.store.update_user(user_id, &changes).await?;
        match totp_url {
            Some(url) => {
                info!(user = %context.user.name, "totp enabled");
                Ok(ProfileUpdateOutcome::TotpEnabled(url))
            }
            None => Ok(ProfileUpdateOutcome::Updated),
        }
    }

    pub async fn delete_user(&self, context: &AuthContext, user_id: &str) -> Result<(), ApiError> {
        self.require_self(context, user_id)?;
        self.state.store.delete_user(user_id).await?;
        info!(user = %context.user.name, "user deleted");
        Ok(())
    }

    /// Publishes the caller's key bundle material: one-time pre-keys are
    /// appended, the signed pre-key replaced, identity data upserted.
    pub async fn publish_keys(
        &self,
        context: &AuthContext,
        upload: PreKeyUpload,
    ) -> Result<(), ApiError> {
        self.authorize(context, &AccessPolicy::new(&[Permission::KeysWrite]))?;
        let user_id = &context.user.user_id;
        if !upload.pre_keys.is_empty() {
            let records: Vec<OneTimePreKeyRecord> = upload
                .pre_keys
                .iter()
                .map(|key| OneTimePreKeyRecord {
                    key_id: key.id,
                    user_id: user_id.clone(),
                    public_key: key.public_key.clone(),
                })
                .collect();
            self.state.store.create_one_time_pre_keys(&records).await?;
        }
        if let Some(signed) = upload.signed_pre_key.as_ref() {
            self.state
                .store
                .upsert_signed_pre_key(&SignedPreKeyRecord {
                    key_id: signed.id,
                    user_id: user_id.clone(),
                    public_key: signed.public_key.clone(),
                    signature: signed.signature.clone(),
                })
                .await?;
        }
        if upload.identity_key.is_some() || upload.registration_id.is_some() {
            self.state
                .store
                .update_user(
                    user_id,
                    &UserUpdate {
                        identity_key: upload.identity_key.clone(),
                        registration_id: upload.registration_id,
                        ..UserUpdate::default()
                    },
                )
                .await?;
        }
        info!(user = %context.user.name, keys = upload.pre_keys.len(), "key bundle published");
        Ok(())
    }

    /// Serves another party's bundle, consuming exactly one one-time pre-key
    /// when the pool has any left. Exhaustion is not an error.
    pub async fn fetch_key_bundle(
        &self,
        context: &AuthContext,
        name: &str,
    ) -> Result<KeyBundle, ApiError> {
        self.authorize(context, &AccessPolicy::new(&[Permission::KeysRead]))?;
        let target = self.state.store.find_user_by_name(name).await?;
        let one_time = self
            .state
            .store
            .consume_one_time_pre_key(&target.user_id)
            .await?;
        if one_time.is_none() {
            debug!(user = %name, "one-time pre-key pool exhausted");
        }
        let signed = self.state.store.find_signed_pre_key(&target.user_id).await?;
        Ok(KeyBundle {
            identity_key: target.identity_key,
            registration_id: target.registration_id,
            signed_pre_key: signed.map(|key| UploadedSignedPreKey {
                id: key.key_id,
                public_key: key.public_key,
                signature: key.signature,
            }),
            one_time_pre_key: one_time.map(|key| UploadedPreKey {
                id: key.key_id,
                public_key: key.public_key,
            }),
        })
    }

    /// Returns and deletes the caller's queued messages: at-most-once
    /// delivery through this path.
    pub async fn fetch_pending_messages(
        &self,
        context: &AuthContext,
        name: &str,
    ) -> Result<Vec<PendingMessageView>, ApiError> {
        self.authorize(context, &AccessPolicy::new(&[Permission::MessagesRead]))?;
        if context.user.name != name {
            return Err(ApiError::Forbidden(
                "You can only read your own messages".to_string(),
            ));
        }
        let pending = self
            .state
            .store
            .find_pending_messages_for_user(&context.user.user_id)
            .await?;
        let views = pending
            .into_iter()
            .map(|message| PendingMessageView {
                id: message.message_id,
                content: message.content,
                sender: message.sender_name,
                sent_at: message.sent_at,
            })
            .collect();
        self.state
            .store
            .delete_pending_messages_for_user(&context.user.user_id)
            .await?;
        Ok(views)
    }

    pub async fn fetch_message_statuses(
        &self,
        context: &AuthContext,
        name: &str,
    ) -> Result<Vec<MessageStatusView>, ApiError> {
        self.authorize(context, &AccessPolicy::new(&[Permission::MessagesRead]))?;
        if context.user.name != name {
            return Err(ApiError::Forbidden(
                "You can only read your own messages".to_string(),
            ));
        }
        let statuses = self
            .state
            .store
            .find_message_statuses_for_user(&context.user.user_id)
            .await?;
        Ok(statuses
            .into_iter()
            .map(|status| MessageStatusView {
                message_id: status.message_id,
                state: status.state,
            })
            .collect())
    }

    fn require_self(&self, context: &AuthContext, user_id: &str) -> Result<(), ApiError> {
        if context.user.user_id != user_id {
            return Err(ApiError::Forbidden(
                "You can only access your own profile".to_string(),
            ));
        }
        Ok(())
    }

    async fn mint_grant(&self, user_id: &str) -> Result<TokenGrant, ApiError> {
        let access_token = issue_access_token(
            &self.state.token_keys,
            &AccessClaims {
                subject: user_id.to_string(),
                scope: USER_PERMISSIONS.to_vec(),
            },
            Duration::from_secs(self.state.config.access_ttl_seconds),
        )?;
        let refresh_token = issue_refresh_token(
            &self.state.token_keys,
            user_id,
            Duration::from_secs(self.state.config.refresh_ttl_seconds),
        )?;
        self.state
            .store
            .create_refresh_token(&RefreshTokenRecord {
                token_id: generate_id(user_id),
                user_id: user_id.to_string(),
                value: refresh_token.clone(),
                issued_at: Utc::now(),
            })
            .await?;
        Ok(TokenGrant {
            access_token,
            refresh_token,
        })
    }
}
