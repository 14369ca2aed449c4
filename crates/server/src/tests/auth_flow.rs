use super::harness::build_backend;
use crate::app::{LoginOutcome, PreKeyUpload, ProfileUpdate, ProfileUpdateOutcome, UploadedPreKey, UploadedSignedPreKey};
use crate::error::ApiError;
use sotto_auth::{AccessClaims, AccessPolicy, Permission, Totp, issue_access_token};
use sotto_storage::CredentialStore;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[tokio::test]
async fn register_and_login_issue_verifiable_tokens() {
    let backend = build_backend();
    let app = backend.app();
    let (profile, grant) = backend.register("alice", "Sup3rSecret").await;

    let verified = backend.state.verifier.verify(&grant.access_token).unwrap();
    assert_eq!(verified.subject, profile.id);
    assert!(verified.scope_set().contains(&Permission::MessagesRead));

    let outcome = app.issue_tokens("alice", "Sup3rSecret", None).await.unwrap();
    let LoginOutcome::Tokens(login_grant) = outcome else {
        panic!("expected tokens");
    };
    // The refresh token must be durably recorded.
    backend
        .store
        .find_refresh_token(&login_grant.refresh_token)
        .await
        .expect("refresh row");
}

#[tokio::test]
async fn unknown_user_and_wrong_password_fail_alike() {
    let backend = build_backend();
    let app = backend.app();
    backend.register("alice", "Sup3rSecret").await;

    let unknown = app.issue_tokens("nonexistent", "whatever", None).await;
    let wrong = app.issue_tokens("alice", "not-the-password", None).await;
    assert!(matches!(unknown, Err(ApiError::AuthenticationFailed)));
    assert!(matches!(wrong, Err(ApiError::AuthenticationFailed)));
}

#[tokio::test]
async fn totp_branch_and_validation() {
    let backend = build_backend();
    let app = backend.app();
    let (profile, grant) = backend.register("alice", "Sup3rSecret").await;
    let context = app.authenticate(Some(&grant.access_token)).await.unwrap();

    let outcome = app
        .update_profile(
            &context,
            &profile.id,
            ProfileUpdate {
                enable_totp: true,
                password: Some("Sup3rSecret".to_string()),
                notification_token: None,
            },
        )
        .await
        .unwrap();
    let ProfileUpdateOutcome::TotpEnabled(url) = outcome else {
        panic!("expected otpauth url");
    };

    // No code supplied: a branch, not an error.
    let pending = app.issue_tokens("alice", "Sup3rSecret", None).await.unwrap();
    assert!(matches!(pending, LoginOutcome::TotpRequired));

    let totp = Totp::from_url(&url).unwrap();
    // Recompute on retry in case the 30-second step rolls over mid-test.
    let mut code = totp.code_at(now_unix() / 30).unwrap();
    let mut granted = app.issue_tokens("alice", "Sup3rSecret", Some(&code)).await;
    if matches!(granted, Err(ApiError::InvalidTotp)) {
        code = totp.code_at(now_unix() / 30).unwrap();
        granted = app.issue_tokens("alice", "Sup3rSecret", Some(&code)).await;
    }
    assert!(matches!(granted, Ok(LoginOutcome::Tokens(_))));

    let mut wrong = code.clone().into_bytes();
    wrong[0] = if wrong[0] == b'9' { b'0' } else { wrong[0] + 1 };
    let wrong = String::from_utf8(wrong).unwrap();
    let rejected = app.issue_tokens("alice", "Sup3rSecret", Some(&wrong)).await;
    assert!(matches!(rejected, Err(ApiError::InvalidTotp)));
}

#[tokio::test]
async fn enabling_totp_requires_the_password() {
    let backend = build_backend();
    let app = backend.app();
    let (profile, grant) = backend.register("alice", "Sup3rSecret").await;
    let context = app.authenticate(Some(&grant.access_token)).await.unwrap();

    let missing = app
        .update_profile(
            &context,
            &profile.id,
            ProfileUpdate {
                enable_totp: true,
                password: None,
                notification_token: None,
            },
        )
        .await;
    assert!(matches!(missing, Err(ApiError::Unauthenticated(_))));

    let wrong = app
        .update_profile(
            &context,
            &profile.id,
            ProfileUpdate {
                enable_totp: true,
                password: Some("guessing".to_string()),
                notification_token: None,
            },
        )
        .await;
    assert!(matches!(wrong, Err(ApiError::AuthenticationFailed)));
}

#[tokio::test]
async fn refresh_rotates_and_rejects_replay() {
    let backend = build_backend();
    let app = backend.app();
    let (profile, grant) = backend.register("alice", "Sup3rSecret").await;

    let rotated = app.refresh_tokens(&grant.refresh_token).await.unwrap();
    let verified = backend.state.verifier.verify(&rotated.access_token).unwrap();
    assert_eq!(verified.subject, profile.id);
    assert_ne!(rotated.refresh_token, grant.refresh_token);

    // The presented token was deleted on use.
    let replay = app.refresh_tokens(&grant.refresh_token).await;
    assert!(matches!(replay, Err(ApiError::Unauthenticated(_))));

    let garbage = app.refresh_tokens("v4.public.garbage").await;
    assert!(matches!(garbage, Err(ApiError::Unauthenticated(_))));
}

#[tokio::test]
async fn refresh_token_cannot_authenticate_requests() {
    let backend = build_backend();
    let app = backend.app();
    let (_, grant) = backend.register("alice", "Sup3rSecret").await;

    let missing = app.authenticate(None).await;
    assert!(matches!(missing, Err(ApiError::Unauthenticated(_))));

    let refresh_as_bearer = app.authenticate(Some(&grant.refresh_token)).await;
    assert!(matches!(refresh_as_bearer, Err(ApiError::Forbidden(_))));
}

#[tokio::test]
async fn partial_scope_overlap_is_forbidden() {
    let backend = build_backend();
    let app = backend.app();
    let (profile, _) = backend.register("alice", "Sup3rSecret").await;

    let narrow = issue_access_token(
        &backend.state.token_keys,
        &AccessClaims {
            subject: profile.id.clone(),
            scope: vec![Permission::MessagesRead],
        },
        Duration::from_secs(900),
    )
    .unwrap();
    let context = app.authenticate(Some(&narrow)).await.unwrap();

    let policy = AccessPolicy::new(&[Permission::MessagesRead, Permission::ProfileRead]);
    assert!(matches!(
        app.authorize(&context, &policy),
        Err(ApiError::Forbidden(_))
    ));
    assert!(matches!(
        app.list_users(&context, "").await,
        Err(ApiError::Forbidden(_))
    ));
    // The subset that is present still authorizes.
    assert!(app
        .authorize(&context, &AccessPolicy::new(&[Permission::MessagesRead]))
        .is_ok());
}

#[tokio::test]
async fn key_bundle_lifecycle() {
    let backend = build_backend();
    let app = backend.app();
    let (_, alice_grant) = backend.register("alice", "Sup3rSecret").await;
    let (_, bob_grant) = backend.register("bob", "Sup3rSecret").await;
    let alice = app.authenticate(Some(&alice_grant.access_token)).await.unwrap();
    let bob = app.authenticate(Some(&bob_grant.access_token)).await.unwrap();

    app.publish_keys(
        &bob,
        PreKeyUpload {
            pre_keys: vec![
                UploadedPreKey {
                    id: 1,
                    public_key: "otk-1".to_string(),
                },
                UploadedPreKey {
                    id: 2,
                    public_key: "otk-2".to_string(),
                },
            ],
            signed_pre_key: Some(UploadedSignedPreKey {
                id: 11,
                public_key: "spk".to_string(),
                signature: "sig".to_string(),
            }),
            identity_key: Some("bob-identity".to_string()),
            registration_id: Some(42),
        },
    )
    .await
    .unwrap();

    let first = app.fetch_key_bundle(&alice, "bob").await.unwrap();
    assert_eq!(first.identity_key.as_deref(), Some("bob-identity"));
    assert_eq!(first.registration_id, Some(42));
    assert_eq!(first.one_time_pre_key.as_ref().map(|key| key.id), Some(1));
    assert_eq!(first.signed_pre_key.as_ref().map(|key| key.id), Some(11));

    let second = app.fetch_key_bundle(&alice, "bob").await.unwrap();
    assert_eq!(second.one_time_pre_key.as_ref().map(|key| key.id), Some(2));

    // Pool exhausted: non-fatal, the signed pre-key still serves.
    let third = app.fetch_key_bundle(&alice, "bob").await.unwrap();
    assert!(third.one_time_pre_key.is_none());
    assert!(third.signed_pre_key.is_some());

    let missing = app.fetch_key_bundle(&alice, "nobody").await;
    assert!(matches!(missing, Err(ApiError::NotFound)));
}

#[tokio::test]
async fn message_retrieval_is_self_only() {
    let backend = build_backend();
    let app = backend.app();
    let (_, alice_grant) = backend.register("alice", "Sup3rSecret").await;
    backend.register("bob", "Sup3rSecret").await;
    let alice = app.authenticate(Some(&alice_grant.access_token)).await.unwrap();

    let others = app.fetch_pending_messages(&alice, "bob").await;
    assert!(matches!(others, Err(ApiError::Forbidden(_))));
    let own = app.fetch_pending_messages(&alice, "alice").await.unwrap();
    assert!(own.is_empty());
}
