use sotto_auth::{AuthError, Permission};
use sotto_storage::StoreError;
use std::error::Error;
use std::fmt::{Display, Formatter};

const APOLOGY: &str =
    "Our servers encountered an unexpected error. We apologize for the inconvenience.";

/// Every externally observable failure. `public_message` is what a caller
/// sees; internal detail stays in logs.
#[derive(Debug)]
pub enum ApiError {
    AuthenticationFailed,
    InvalidTotp,
    Unauthenticated(Option<String>),
    Forbidden(String),
    NotFound,
    Conflict,
    MalformedPayload,
    ReceiverNotFound,
    StoreUnavailable,
    Internal,
}

impl ApiError {
    pub fn status(&self) -> u16 {
        match self {
            Self::AuthenticationFailed
            | Self::InvalidTotp
            | Self::Unauthenticated(_) => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound | Self::ReceiverNotFound => 404,
            Self::Conflict => 409,
            Self::MalformedPayload => 400,
            Self::StoreUnavailable | Self::Internal => 500,
        }
    }

    pub fn public_message(&self) -> String {
        match self {
            Self::AuthenticationFailed => "Invalid username or password".to_string(),
            Self::InvalidTotp => "Invalid TOTP token".to_string(),
            Self::Unauthenticated(detail) => detail
                .clone()
                .unwrap_or_else(|| "Invalid token".to_string()),
            Self::Forbidden(message) => message.clone(),
            Self::NotFound => {
                "The resource you are trying to reach has not been found.".to_string()
            }
            Self::Conflict => {
                "The resource you are trying to create already exists.".to_string()
            }
            Self::MalformedPayload => "Invalid request body".to_string(),
            Self::ReceiverNotFound => "Receiver not found".to_string(),
            Self::StoreUnavailable | Self::Internal => APOLOGY.to_string(),
        }
    }

    pub fn missing_permissions(missing: &[Permission]) -> Self {
        let list: Vec<&str> = missing.iter().map(|permission| permission.as_str()).collect();
        Self::Forbidden(format!(
            "You don't have the required permissions to access this resource (need {})",
            list.join(",")
        ))
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AuthenticationFailed => write!(f, "authentication failed"),
            Self::InvalidTotp => write!(f, "invalid totp code"),
            Self::Unauthenticated(detail) => match detail {
                Some(detail) => write!(f, "unauthenticated: {}", detail),
                None => write!(f, "unauthenticated"),
            },
            Self::Forbidden(message) => write!(f, "forbidden: {}", message),
            Self::NotFound => write!(f, "resource not found"),
            Self::Conflict => write!(f, "duplicate resource"),
            Self::MalformedPayload => write!(f, "malformed payload"),
            Self::ReceiverNotFound => write!(f, "receiver not found"),
            Self::StoreUnavailable => write!(f, "store unavailable"),
            Self::Internal => write!(f, "internal failure"),
        }
    }
}

impl Error for ApiError {}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Missing => Self::NotFound,
            StoreError::Duplicate => Self::Conflict,
            StoreError::Unavailable | StoreError::Serialization => Self::StoreUnavailable,
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> Self {
        match error {
            AuthError::InvalidToken => Self::Unauthenticated(Some("Invalid token".to_string())),
            AuthError::ExpiredToken => Self::Unauthenticated(Some("Expired token".to_string())),
            AuthError::TamperedToken => {
                Self::Unauthenticated(Some("The token has been tampered with".to_string()))
            }
            AuthError::InvalidKey
            | AuthError::Hashing
            | AuthError::Signing
            | AuthError::InvalidTotpUrl
            | AuthError::UnknownPermission => Self::Internal,
        }
    }
}
