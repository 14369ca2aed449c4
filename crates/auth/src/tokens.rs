use crate::permissions::Permission;
use crate::AuthError;
use blake3::Hasher;
use ed25519_dalek::SigningKey;
use pasetors::claims::{Claims, ClaimsValidationRules};
use pasetors::errors::Error as PasetoError;
use pasetors::keys::{AsymmetricPublicKey, AsymmetricSecretKey};
use pasetors::token::UntrustedToken;
use pasetors::version4::V4;
use pasetors::{public, Public};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

const SCOPE_CLAIM: &str = "scope";

/// Claims minted into an access token: the subject user and the permission
/// scope. Refresh tokens carry only a subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessClaims {
    pub subject: String,
    pub scope: Vec<Permission>,
}

/// The outcome of verifying a token. `scope` is absent for refresh tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub subject: String,
    pub scope: Option<Vec<Permission>>,
}

impl VerifiedToken {
    pub fn scope_set(&self) -> HashSet<Permission> {
        self.scope.iter().flatten().copied().collect()
    }
}

/// Ed25519 signing pair for PASETO v4.public tokens, derived from seed
/// material. The verifying half can be handed out separately so components
/// that only check tokens never hold the signing secret.
pub struct TokenKeys {
    secret: AsymmetricSecretKey<V4>,
    public: AsymmetricPublicKey<V4>,
}

#[derive(Clone)]
pub struct TokenVerifier {
    public: AsymmetricPublicKey<V4>,
}

impl TokenKeys {
    /// Derives a deterministic token key pair from seed material.
    pub fn from_seed(seed: &[u8]) -> Result<Self, AuthError> {
        if seed.len() < 32 {
            return Err(AuthError::InvalidKey);
        }
        let mut hasher = Hasher::new();
        hasher.update(seed);
        let digest = hasher.finalize();
        let mut scalar = [0u8; 32];
        scalar.copy_from_slice(&digest.as_bytes()[..32]);
        let signing = SigningKey::from_bytes(&scalar);
        let verifying = signing.verifying_key().to_bytes();
        let mut keypair = [0u8; 64];
        keypair[..32].copy_from_slice(&signing.to_bytes());
        keypair[32..].copy_from_slice(&verifying);
        let secret =
            AsymmetricSecretKey::from(keypair.as_slice()).map_err(|_| AuthError::InvalidKey)?;
        let public =
            AsymmetricPublicKey::from(verifying.as_slice()).map_err(|_| AuthError::InvalidKey)?;
        Ok(Self { secret, public })
    }

    pub fn verifier(&self) -> TokenVerifier {
        TokenVerifier {
            public: self.public.clone(),
        }
    }
}

/// Mints a short-lived access token carrying the subject and scope.
pub fn issue_access_token(
    keys: &TokenKeys,
    claims: &AccessClaims,
    ttl: Duration,
) -> Result<String, AuthError> {
    let mut payload = Claims::new_expires_in(&ttl).map_err(|_| AuthError::Signing)?;
    payload
        .subject(&claims.subject)
        .map_err(|_| AuthError::Signing)?;
    let scope: Vec<&str> = claims.scope.iter().map(|p| p.as_str()).collect();
    payload
        .add_additional(SCOPE_CLAIM, scope)
        .map_err(|_| AuthError::Signing)?;
    public::sign(&keys.secret, &payload, None, None).map_err(|_| AuthError::Signing)
}

/// Mints a long-lived refresh token bound to the subject only. The absence
/// of a scope claim is what distinguishes it from an access token.
pub fn issue_refresh_token(
    keys: &TokenKeys,
    subject: &str,
    ttl: Duration,
) -> Result<String, AuthError> {
    let mut payload = Claims::new_expires_in(&ttl).map_err(|_| AuthError::Signing)?;
    payload.subject(subject).map_err(|_| AuthError::Signing)?;
    public::sign(&keys.secret, &payload, None, None).map_err(|_| AuthError::Signing)
}

impl TokenVerifier {
    /// Verifies signature and validity window, distinguishing malformed,
    /// expired and tampered tokens.
    pub fn verify(&self, token: &str) -> Result<VerifiedToken, AuthError> {
        let untrusted =
            UntrustedToken::<Public, V4>::try_from(token).map_err(|_| AuthError::InvalidToken)?;
        let rules = ClaimsValidationRules::new();
        let trusted =
            public::verify(&self.public, &untrusted, &rules, None, None).map_err(
                |error| match error {
                    PasetoError::ClaimValidation(_) => AuthError::ExpiredToken,
                    PasetoError::TokenValidation => AuthError::TamperedToken,
                    _ => AuthError::InvalidToken,
                },
            )?;
        let claims = trusted.payload_claims().ok_or(AuthError::InvalidToken)?;
        let subject = claims
            .get_claim("sub")
            .and_then(|value| value.as_str())
            .ok_or(AuthError::InvalidToken)?
            .to_string();
        let scope = claims.get_claim(SCOPE_CLAIM).map(|value| {
            value
                .as_array()
                .map(|entries| {
                    entries
                        .iter()
                        .filter_map(|entry| entry.as_str())
                        .filter_map(|name| Permission::from_str(name).ok())
                        .collect()
                })
                .unwrap_or_default()
        });
        Ok(VerifiedToken { subject, scope })
    }
}
