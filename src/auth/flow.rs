//! Login, renewal and password-change flows on top of the store and tokens.

use crate::auth::store::CredentialStore;
use crate::auth::token::{TokenIssuer, TokenPair, TokenVerifier};
use crate::error::AuthError;

/// Exchange a handle/password for a fresh token pair.
///
/// Every failure other than a storage error collapses into
/// `InvalidCredentials` so callers cannot enumerate handles.
pub fn login(
    store: &CredentialStore,
    issuer: &TokenIssuer,
    handle: &str,
    password: &str,
) -> Result<TokenPair, AuthError> {
    match store.authenticate(handle, password)? {
        Some(identity) => {
            tracing::info!(user_id = identity.id, "Login succeeded");
            Ok(issuer.issue_pair(&identity))
        }
        None => {
            tracing::debug!("Login rejected");
            Err(AuthError::InvalidCredentials)
        }
    }
}

/// Mint a new access token from a renewal token.
///
/// The renewal token itself is neither rotated nor invalidated.
pub fn renew(
    verifier: &TokenVerifier,
    issuer: &TokenIssuer,
    refresh_token: &str,
) -> Result<String, AuthError> {
    let verified = verifier.verify(refresh_token).map_err(|e| {
        tracing::debug!(kind = e.kind(), "Renewal rejected");
        AuthError::Token(e)
    })?;
    Ok(issuer.issue_access(&verified.identity))
}

/// Replace the password of `user_id` after re-checking the current one.
pub fn change_password(
    store: &CredentialStore,
    user_id: i64,
    current_password: &str,
    new_password: &str,
) -> Result<(), AuthError> {
    let identity = store.find_by_id(user_id)?.ok_or(AuthError::NotFound)?;
    if !identity.is_active || !store.verify_password(&identity, current_password) {
        return Err(AuthError::InvalidCredentials);
    }
    if !store.change_password(user_id, new_password)? {
        return Err(AuthError::NotFound);
    }
    tracing::info!(user_id, "Password changed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::NewIdentity;
    use crate::auth::token::{ManualClock, TokenConfig};
    use crate::error::TokenError;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Harness {
        _tmp: TempDir,
        store: Arc<CredentialStore>,
        clock: Arc<ManualClock>,
        issuer: TokenIssuer,
        verifier: TokenVerifier,
    }

    fn harness() -> Harness {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(CredentialStore::new(&tmp.path().join("flow.db")).unwrap());
        let config = Arc::new(TokenConfig::new(b"flow-secret", 300, 3600));
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        Harness {
            issuer: TokenIssuer::new(config.clone(), clock.clone()),
            verifier: TokenVerifier::new(config, clock.clone(), store.clone()),
            clock,
            store,
            _tmp: tmp,
        }
    }

    fn register(h: &Harness) -> i64 {
        h.store
            .register(&NewIdentity {
                email: "a@b.com".into(),
                phone_number: "555-0100".into(),
                password: "correct horse".into(),
                ..NewIdentity::default()
            })
            .unwrap()
            .id
    }

    #[test]
    fn login_returns_pair_for_matching_credentials() {
        let h = harness();
        let id = register(&h);

        let pair = login(&h.store, &h.issuer, "a@b.com", "correct horse").unwrap();
        assert_eq!(h.verifier.verify(&pair.access).unwrap().identity.id, id);
        assert_eq!(h.verifier.verify(&pair.refresh).unwrap().identity.id, id);
    }

    #[test]
    fn login_failures_are_indistinguishable() {
        let h = harness();
        register(&h);

        let wrong_password = login(&h.store, &h.issuer, "a@b.com", "battery staple");
        let unknown_handle = login(&h.store, &h.issuer, "x@y.com", "correct horse");
        assert!(matches!(wrong_password, Err(AuthError::InvalidCredentials)));
        assert!(matches!(unknown_handle, Err(AuthError::InvalidCredentials)));
    }

    #[test]
    fn renew_yields_access_for_same_identity() {
        let h = harness();
        let id = register(&h);
        let pair = login(&h.store, &h.issuer, "a@b.com", "correct horse").unwrap();

        h.clock.advance(600);
        assert!(h.verifier.verify(&pair.access).is_err());

        let access = renew(&h.verifier, &h.issuer, &pair.refresh).unwrap();
        assert_eq!(h.verifier.verify(&access).unwrap().identity.id, id);
    }

    #[test]
    fn renew_with_expired_refresh_is_rejected() {
        let h = harness();
        register(&h);
        let pair = login(&h.store, &h.issuer, "a@b.com", "correct horse").unwrap();

        h.clock.advance(3600);
        let err = renew(&h.verifier, &h.issuer, &pair.refresh).unwrap_err();
        assert!(matches!(err, AuthError::Token(TokenError::Expired)));
    }

    #[test]
    fn renew_with_garbage_is_malformed() {
        let h = harness();
        let err = renew(&h.verifier, &h.issuer, "not-a-token").unwrap_err();
        assert!(matches!(err, AuthError::Token(TokenError::Malformed)));
    }

    #[test]
    fn renewal_token_is_reusable() {
        let h = harness();
        register(&h);
        let pair = login(&h.store, &h.issuer, "a@b.com", "correct horse").unwrap();

        assert!(renew(&h.verifier, &h.issuer, &pair.refresh).is_ok());
        assert!(renew(&h.verifier, &h.issuer, &pair.refresh).is_ok());
    }

    #[test]
    fn renew_for_deactivated_identity_fails() {
        let h = harness();
        let id = register(&h);
        let pair = login(&h.store, &h.issuer, "a@b.com", "correct horse").unwrap();
        h.store.deactivate(id).unwrap();

        let err = renew(&h.verifier, &h.issuer, &pair.refresh).unwrap_err();
        assert!(matches!(err, AuthError::Token(TokenError::UnknownIdentity)));
    }

    #[test]
    fn change_password_requires_current_password() {
        let h = harness();
        let id = register(&h);

        let err = change_password(&h.store, id, "nope", "new password!").unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));

        change_password(&h.store, id, "correct horse", "new password!").unwrap();
        assert!(login(&h.store, &h.issuer, "a@b.com", "new password!").is_ok());
    }

    #[test]
    fn change_password_for_missing_identity_is_not_found() {
        let h = harness();
        let err = change_password(&h.store, 404, "whatever1", "whatever2").unwrap_err();
        assert!(matches!(err, AuthError::NotFound));
    }
}
