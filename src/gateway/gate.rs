//! Request gate: authenticates `Authorization: Bearer <token>` before dispatch.
//!
//! Attached per route with `route_layer`, so each route decides whether a
//! credential is required or merely accepted.

use crate::auth::{Identity, TokenVerifier, VerifiedIdentity};
use axum::{
    extract::{FromRequestParts, OptionalFromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::convert::Infallible;
use std::sync::Arc;

/// Scheme marker in front of the token in the `Authorization` header.
pub const BEARER_PREFIX: &str = "Bearer ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    /// No credential → 401.
    Required,
    /// No credential → forwarded unauthenticated.
    Optional,
}

/// Middleware state: the verifier plus the route's mode.
#[derive(Clone)]
pub struct GateState {
    verifier: Arc<TokenVerifier>,
    mode: GateMode,
}

impl GateState {
    pub fn new(verifier: Arc<TokenVerifier>, mode: GateMode) -> Self {
        Self { verifier, mode }
    }
}

/// Identity attached to a request that passed the gate.
#[derive(Debug, Clone)]
pub struct AuthenticatedIdentity {
    pub identity: Identity,
    pub token: String,
}

impl From<VerifiedIdentity> for AuthenticatedIdentity {
    fn from(verified: VerifiedIdentity) -> Self {
        Self {
            identity: verified.identity,
            token: verified.token,
        }
    }
}

/// Extract bearer token from Authorization header.
///
/// A header with any other scheme counts as no credential at all.
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix(BEARER_PREFIX))
}

/// Gate middleware, used with `axum::middleware::from_fn_with_state`.
///
/// Rejections are a bare 401 so nothing about the failure reaches the client.
pub async fn request_gate(
    State(gate): State<GateState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = extract_bearer_token(request.headers()).map(str::to_owned) else {
        return match gate.mode {
            GateMode::Optional => next.run(request).await,
            GateMode::Required => {
                tracing::debug!(path = %request.uri().path(), "Missing credential");
                StatusCode::UNAUTHORIZED.into_response()
            }
        };
    };

    match gate.verifier.verify(&token) {
        Ok(verified) => {
            tracing::info!(
                user_id = verified.identity.id,
                method = %request.method(),
                path = %request.uri().path(),
                "Authenticated access"
            );
            request
                .extensions_mut()
                .insert(AuthenticatedIdentity::from(verified));
            next.run(request).await
        }
        Err(e) => {
            tracing::debug!(
                kind = e.kind(),
                path = %request.uri().path(),
                "Credential rejected: {e}"
            );
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

impl<S: Send + Sync> FromRequestParts<S> for AuthenticatedIdentity {
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedIdentity>()
            .cloned()
            .ok_or(StatusCode::UNAUTHORIZED)
    }
}

impl<S: Send + Sync> OptionalFromRequestParts<S> for AuthenticatedIdentity {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Option<Self>, Self::Rejection> {
        Ok(parts.extensions.get::<AuthenticatedIdentity>().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CredentialStore, ManualClock, NewIdentity, TokenConfig, TokenIssuer};
    use axum::{body::Body, middleware, routing::get, Router};
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct Fixture {
        _tmp: TempDir,
        issuer: TokenIssuer,
        clock: Arc<ManualClock>,
        identity: Identity,
        app: Router,
    }

    async fn whoami(identity: Option<AuthenticatedIdentity>) -> String {
        identity.map_or_else(|| "anonymous".into(), |i| i.identity.email)
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(CredentialStore::new(&tmp.path().join("gate.db")).unwrap());
        let identity = store
            .register(&NewIdentity {
                email: "a@b.com".into(),
                phone_number: "1".into(),
                password: "password123".into(),
                ..NewIdentity::default()
            })
            .unwrap();
        let config = Arc::new(TokenConfig::new(b"gate-secret", 300, 600));
        let clock = Arc::new(ManualClock::new(1_000));
        let verifier = Arc::new(TokenVerifier::new(config.clone(), clock.clone(), store));

        let app = Router::new()
            .route(
                "/required",
                get(whoami).route_layer(middleware::from_fn_with_state(
                    GateState::new(verifier.clone(), GateMode::Required),
                    request_gate,
                )),
            )
            .route(
                "/optional",
                get(whoami).route_layer(middleware::from_fn_with_state(
                    GateState::new(verifier, GateMode::Optional),
                    request_gate,
                )),
            );

        Fixture {
            issuer: TokenIssuer::new(config, clock.clone()),
            clock,
            identity,
            app,
            _tmp: tmp,
        }
    }

    async fn call(app: &Router, path: &str, auth: Option<&str>) -> (StatusCode, String) {
        let mut builder = Request::builder().uri(path);
        if let Some(value) = auth {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        let response = app
            .clone()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn required_route_rejects_missing_credential() {
        let f = fixture();
        let (status, body) = call(&f.app, "/required", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn optional_route_forwards_anonymous() {
        let f = fixture();
        let (status, body) = call(&f.app, "/optional", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "anonymous");
    }

    #[tokio::test]
    async fn valid_token_attaches_identity() {
        let f = fixture();
        let auth = format!("Bearer {}", f.issuer.issue_access(&f.identity));
        for path in ["/required", "/optional"] {
            let (status, body) = call(&f.app, path, Some(auth.as_str())).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, "a@b.com");
        }
    }

    #[tokio::test]
    async fn bad_token_is_rejected_even_when_optional() {
        let f = fixture();
        for path in ["/required", "/optional"] {
            let (status, body) = call(&f.app, path, Some("Bearer not.a.token")).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert!(body.is_empty());
        }
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let f = fixture();
        let auth = format!("Bearer {}", f.issuer.issue_access(&f.identity));
        f.clock.advance(300);
        let (status, _) = call(&f.app, "/required", Some(auth.as_str())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn other_scheme_counts_as_absent() {
        let f = fixture();
        let token = f.issuer.issue_access(&f.identity);

        let (status, body) = call(&f.app, "/optional", Some(format!("Token {token}").as_str())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "anonymous");

        let (status, _) = call(&f.app, "/required", Some(format!("Token {token}").as_str())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), Some("abc"));
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), None);
    }
}
