//! Typed failures for credential verification and the login/renewal flows.
//!
//! Storage and startup plumbing use `anyhow`; everything a request can be
//! rejected for is one of the kinds below so handlers branch on data, not on
//! error strings.

use thiserror::Error;

/// Why a presented token did not resolve to an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    /// Absent, structurally broken, or signed with a different key.
    #[error("token is malformed or its signature does not verify")]
    Malformed,
    /// Signature is fine but `user_id` or `exp` is missing from the payload.
    #[error("token payload is missing required fields")]
    MalformedPayload,
    /// `exp` is at or before the current time.
    #[error("token has expired")]
    Expired,
    /// Token is valid but the identity it names no longer exists or is inactive.
    #[error("token refers to an unknown identity")]
    UnknownIdentity,
    /// The identity lookup itself failed.
    #[error("identity lookup failed")]
    Store,
}

impl TokenError {
    /// Stable wire name, used in renewal responses and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Malformed | Self::MalformedPayload => "malformed",
            Self::Expired => "expired",
            Self::UnknownIdentity => "unknown_identity",
            Self::Store => "unavailable",
        }
    }
}

/// Outcome of the credential flows that sit in front of token issuance.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Lookup miss. Expected, not exceptional.
    #[error("identity not found")]
    NotFound,
    /// Handle/password mismatch. Deliberately carries no detail.
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Why `CredentialStore::register` refused a new identity.
#[derive(Debug, Error)]
pub enum RegisterError {
    /// A field failed validation; the message is safe to show to the caller.
    #[error("{0}")]
    Invalid(String),
    /// Email or phone number collides with an existing identity.
    #[error("Email or phone number is already registered")]
    Duplicate,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for RegisterError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.into())
    }
}

/// Why a course write was refused.
#[derive(Debug, Error)]
pub enum CourseError {
    /// Title or description failed validation; safe to show to the caller.
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for CourseError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.into())
    }
}
