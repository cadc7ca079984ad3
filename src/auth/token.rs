//! Stateless signed credentials.
//!
//! Tokens are JWS compact serializations signed with HMAC-SHA256:
//! `base64url(header).base64url(payload).base64url(mac)`, payload
//! `{"user_id": i64, "iat": secs, "exp": secs}`. Access and renewal tokens share
//! the format and differ only in lifetime. Nothing is recorded server-side, so a
//! token stays valid until `exp` even if it leaks.

use crate::auth::store::{Identity, IdentityDirectory};
use crate::config::AuthConfig;
use crate::error::TokenError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ring::hmac;
use serde::Serialize;
#[cfg(test)]
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

const ALGORITHM: &str = "HS256";

/// Source of "now" in Unix seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default()
    }
}

/// Clock that only moves when told to.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

#[cfg(test)]
impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self(AtomicI64::new(start))
    }

    pub fn set(&self, secs: i64) {
        self.0.store(secs, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Signing key and lifetimes, fixed for the life of the process.
pub struct TokenConfig {
    key: hmac::Key,
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
}

impl TokenConfig {
    pub fn new(secret: &[u8], access_ttl_secs: u64, refresh_ttl_secs: u64) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
            access_ttl_secs: i64::try_from(access_ttl_secs).unwrap_or(i64::MAX),
            refresh_ttl_secs: i64::try_from(refresh_ttl_secs).unwrap_or(i64::MAX),
        }
    }

    pub fn from_auth_config(auth: &AuthConfig) -> Self {
        Self::new(
            auth.jwt_secret.as_bytes(),
            auth.access_token_ttl_secs,
            auth.refresh_token_ttl_secs,
        )
    }
}

struct Claims {
    user_id: i64,
    iat: i64,
    exp: i64,
}

/// Access + renewal credentials handed out at login.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

/// Mints credentials for already-verified identities.
pub struct TokenIssuer {
    config: Arc<TokenConfig>,
    clock: Arc<dyn Clock>,
}

impl TokenIssuer {
    pub fn new(config: Arc<TokenConfig>, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    pub fn issue_access(&self, identity: &Identity) -> String {
        self.issue(identity.id, self.config.access_ttl_secs)
    }

    pub fn issue_refresh(&self, identity: &Identity) -> String {
        self.issue(identity.id, self.config.refresh_ttl_secs)
    }

    pub fn issue_pair(&self, identity: &Identity) -> TokenPair {
        TokenPair {
            access: self.issue_access(identity),
            refresh: self.issue_refresh(identity),
        }
    }

    fn issue(&self, user_id: i64, ttl_secs: i64) -> String {
        let iat = self.clock.now();
        let claims = Claims {
            user_id,
            iat,
            exp: iat.saturating_add(ttl_secs),
        };
        sign(&self.config.key, &claims)
    }
}

fn sign(key: &hmac::Key, claims: &Claims) -> String {
    let header = serde_json::json!({ "alg": ALGORITHM, "typ": "JWT" });
    let payload = serde_json::json!({
        "user_id": claims.user_id,
        "iat": claims.iat,
        "exp": claims.exp,
    });
    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(payload.to_string()),
    );
    let tag = hmac::sign(key, signing_input.as_bytes());
    format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(tag.as_ref()))
}

/// A credential that resolved to a live identity.
#[derive(Debug, Clone)]
pub struct VerifiedIdentity {
    pub identity: Identity,
    pub token: String,
}

/// Resolves presented credentials to identities.
pub struct TokenVerifier {
    config: Arc<TokenConfig>,
    clock: Arc<dyn Clock>,
    directory: Arc<dyn IdentityDirectory>,
}

impl TokenVerifier {
    pub fn new(
        config: Arc<TokenConfig>,
        clock: Arc<dyn Clock>,
        directory: Arc<dyn IdentityDirectory>,
    ) -> Self {
        Self {
            config,
            clock,
            directory,
        }
    }

    pub fn verify(&self, token: &str) -> Result<VerifiedIdentity, TokenError> {
        self.verify_at(token, self.clock.now())
    }

    /// Checks run in a fixed order; the first failing one decides the error.
    pub fn verify_at(&self, token: &str, now: i64) -> Result<VerifiedIdentity, TokenError> {
        let payload = decode_signed(&self.config.key, token)?;

        let user_id = int_claim(&payload, "user_id").ok_or(TokenError::MalformedPayload)?;
        let exp = int_claim(&payload, "exp").ok_or(TokenError::MalformedPayload)?;

        if exp <= now {
            return Err(TokenError::Expired);
        }

        let identity = self
            .directory
            .find_by_id(user_id)
            .map_err(|e| {
                tracing::warn!(user_id, "Identity lookup failed during verification: {e}");
                TokenError::Store
            })?
            .filter(|identity| identity.is_active)
            .ok_or(TokenError::UnknownIdentity)?;

        Ok(VerifiedIdentity {
            identity,
            token: token.to_string(),
        })
    }
}

/// Check structure, header and signature; return the decoded payload object.
fn decode_signed(
    key: &hmac::Key,
    token: &str,
) -> Result<serde_json::Map<String, serde_json::Value>, TokenError> {
    let mut parts = token.split('.');
    let (Some(header_b64), Some(payload_b64), Some(sig_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(TokenError::Malformed);
    };
    if header_b64.is_empty() || payload_b64.is_empty() || sig_b64.is_empty() {
        return Err(TokenError::Malformed);
    }

    let header: serde_json::Value = URL_SAFE_NO_PAD
        .decode(header_b64)
        .ok()
        .and_then(|raw| serde_json::from_slice(&raw).ok())
        .ok_or(TokenError::Malformed)?;
    if header.get("alg").and_then(serde_json::Value::as_str) != Some(ALGORITHM) {
        return Err(TokenError::Malformed);
    }

    let signature = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| TokenError::Malformed)?;
    let signing_input_len = header_b64.len() + 1 + payload_b64.len();
    hmac::verify(key, &token.as_bytes()[..signing_input_len], &signature)
        .map_err(|_| TokenError::Malformed)?;

    let raw = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| TokenError::Malformed)?;
    match serde_json::from_slice(&raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        _ => Err(TokenError::MalformedPayload),
    }
}

/// Integer claim; whole-valued floats are accepted since some issuers emit them.
fn int_claim(payload: &serde_json::Map<String, serde_json::Value>, name: &str) -> Option<i64> {
    let value = payload.get(name)?;
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.is_finite())
            .map(|f| f.floor() as i64)
    })
}
