use crate::AuthError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// A named capability carried in an access token's scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Permission {
    ProfileRead,
    ProfileWrite,
    KeysRead,
    KeysWrite,
    MessagesRead,
}

/// The full permission set minted into user access tokens.
pub const USER_PERMISSIONS: [Permission; 5] = [
    Permission::ProfileRead,
    Permission::ProfileWrite,
    Permission::KeysRead,
    Permission::KeysWrite,
    Permission::MessagesRead,
];

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProfileRead => "profile:read",
            Self::ProfileWrite => "profile:write",
            Self::KeysRead => "keys:read",
            Self::KeysWrite => "keys:write",
            Self::MessagesRead => "messages:read",
        }
    }
}

impl Display for Permission {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = AuthError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "profile:read" => Ok(Self::ProfileRead),
            "profile:write" => Ok(Self::ProfileWrite),
            "keys:read" => Ok(Self::KeysRead),
            "keys:write" => Ok(Self::KeysWrite),
            "messages:read" => Ok(Self::MessagesRead),
            _ => Err(AuthError::UnknownPermission),
        }
    }
}

/// A permission-gated pipeline stage, constructed with the permissions an
/// operation requires. Authorization succeeds only when every required
/// permission is present in the token scope (full-subset match).
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    required: Vec<Permission>,
}

impl AccessPolicy {
    pub fn new(required: &[Permission]) -> Self {
        Self {
            required: required.to_vec(),
        }
    }

    pub fn required(&self) -> &[Permission] {
        &self.required
    }

    /// Checks the scope, returning the missing permissions on denial.
    pub fn check(&self, scope: &HashSet<Permission>) -> Result<(), Vec<Permission>> {
        let missing: Vec<Permission> = self
            .required
            .iter()
            .copied()
            .filter(|permission| !scope.contains(permission))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(missing)
        }
    }
}
