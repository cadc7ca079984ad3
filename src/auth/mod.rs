//! Identity storage and stateless token authentication.
//!
//! Provides:
//! - Identity registration with email handle + password (iterated SHA-256,
//!   100k rounds + per-identity salt)
//! - HMAC-SHA256 signed access and renewal tokens with no server-side record
//! - Login / renewal / password-change flows
//!
//! ## Design Decisions
//! - Tokens carry the identity id and expiry; verification is a pure function
//!   of the token, the process-wide key, the clock and one store lookup.
//! - Tokens cannot be revoked before `exp`. Deactivating an identity is the
//!   only way to make its outstanding tokens fail (as `UnknownIdentity`).

pub mod flow;
pub mod store;
pub mod token;

pub use store::{CredentialStore, Identity, IdentityDirectory, NewIdentity};
#[cfg(test)]
pub use token::ManualClock;
pub use token::{
    Clock, SystemClock, TokenConfig, TokenIssuer, TokenPair, TokenVerifier, VerifiedIdentity,
};
