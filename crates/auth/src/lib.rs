use std::error::Error;
use std::fmt::{Display, Formatter};

mod password;
mod permissions;
mod tokens;
mod totp;

pub use password::{hash_password, verify_password};
pub use permissions::{AccessPolicy, Permission, USER_PERMISSIONS};
pub use tokens::{
    AccessClaims, TokenKeys, TokenVerifier, VerifiedToken, issue_access_token,
    issue_refresh_token,
};
pub use totp::{Totp, TotpAlgorithm, generate_base32_secret};

#[derive(Debug)]
pub enum AuthError {
    InvalidKey,
    InvalidToken,
    ExpiredToken,
    TamperedToken,
    Hashing,
    Signing,
    InvalidTotpUrl,
    UnknownPermission,
}

impl Display for AuthError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKey => write!(f, "invalid key material"),
            Self::InvalidToken => write!(f, "invalid token"),
            Self::ExpiredToken => write!(f, "expired token"),
            Self::TamperedToken => write!(f, "token signature mismatch"),
            Self::Hashing => write!(f, "password hashing failure"),
            Self::Signing => write!(f, "token signing failure"),
            Self::InvalidTotpUrl => write!(f, "invalid otpauth url"),
            Self::UnknownPermission => write!(f, "unknown permission"),
        }
    }
}

impl Error for AuthError {}
