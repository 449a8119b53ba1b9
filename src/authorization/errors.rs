//! Host authorization errors and their mapping to classified failures.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Capability authorization state, as last decided by the gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationState {
    #[default]
    Unknown,
    Granted,
    Denied,
    Restricted,
    Revoked,
}

impl AuthorizationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Granted => "granted",
            Self::Denied => "denied",
            Self::Restricted => "restricted",
            Self::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "unknown" => Some(Self::Unknown),
            "granted" => Some(Self::Granted),
            "denied" => Some(Self::Denied),
            "restricted" => Some(Self::Restricted),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }
}

impl fmt::Display for AuthorizationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified authorization failure returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorizationError {
    #[error("screen capture permission was denied; enable it in system settings")]
    DeniedByUser,

    #[error("screen capture access is restricted by system policy")]
    SystemPolicyRestricted,

    #[error("the permission prompt was dismissed")]
    UserCancelled,

    #[error("unexpected authorization error {code}: {message}")]
    Unexpected { code: i32, message: String },
}

impl AuthorizationError {
    /// Whether asking again on an explicit user action can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UserCancelled | Self::Unexpected { .. } => true,
            Self::DeniedByUser | Self::SystemPolicyRestricted => false,
        }
    }
}

/// Error codes reported by the host authorization service.
pub mod codes {
    pub const POLICY_RESTRICTED: i32 = 1;
    pub const USER_CANCELLED: i32 = 2;
    pub const USER_DENIED: i32 = 3;
    pub const PARENTAL_CONTROLS: i32 = 4;
    pub const NOT_INTERACTIVE: i32 = 10;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorClass {
    Restricted,
    Cancelled,
    Denied,
}

const SYSTEM_ERROR_TABLE: &[(i32, ErrorClass)] = &[
    (codes::POLICY_RESTRICTED, ErrorClass::Restricted),
    (codes::PARENTAL_CONTROLS, ErrorClass::Restricted),
    (codes::USER_CANCELLED, ErrorClass::Cancelled),
    (codes::USER_DENIED, ErrorClass::Denied),
];

/// Raw error from the host authorization service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("system error {code}: {message}")]
pub struct SystemError {
    pub code: i32,
    pub message: String,
}

impl SystemError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn restricted() -> Self {
        Self::new(codes::POLICY_RESTRICTED, "restricted by policy")
    }

    pub fn cancelled() -> Self {
        Self::new(codes::USER_CANCELLED, "prompt dismissed")
    }

    /// Map through the error table. Codes not in the table are `Unexpected`.
    pub fn classify(&self) -> AuthorizationError {
        let class = SYSTEM_ERROR_TABLE
            .iter()
            .find(|(code, _)| *code == self.code)
            .map(|(_, class)| *class);

        match class {
            Some(ErrorClass::Restricted) => AuthorizationError::SystemPolicyRestricted,
            Some(ErrorClass::Cancelled) => AuthorizationError::UserCancelled,
            Some(ErrorClass::Denied) => AuthorizationError::DeniedByUser,
            None => AuthorizationError::Unexpected {
                code: self.code,
                message: self.message.clone(),
            },
        }
    }
}
