//! Axum-based HTTP gateway with body limits, timeouts and per-route auth gates.
//!
//! Route groups:
//! - `/api/auth/*`: registration, login, token renewal, profile
//! - `/api/courses*`, `/api/enrollments`: course catalog
//! - `/api/admin/*`: staff-only actions
//!
//! Login and renewal are never behind the gate; everything that needs an
//! identity declares `GateMode::Required` or `GateMode::Optional` on its route.

pub mod gate;
pub mod rate_limit;

use crate::auth::store::MIN_PASSWORD_LEN;
use crate::auth::{
    flow, Clock, CredentialStore, NewIdentity, SystemClock, TokenConfig, TokenIssuer,
    TokenVerifier,
};
use crate::config::Config;
use crate::courses::{CourseQuery, CourseStore, EnrollOutcome, OwnedChange, PAGE_SIZE};
use crate::error::{AuthError, CourseError, RegisterError, TokenError};
use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::Json,
    routing::{get, post, put},
    Router,
};
use self::gate::{request_gate, AuthenticatedIdentity, GateMode, GateState};
use self::rate_limit::{client_address, throttle_key, LoginThrottle, PeerAddr};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB)
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout (30s)
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub identities: Arc<CredentialStore>,
    pub courses: Arc<CourseStore>,
    pub issuer: Arc<TokenIssuer>,
    pub verifier: Arc<TokenVerifier>,
    pub login_throttle: Arc<LoginThrottle>,
    /// Read the client address from forwarding headers.
    pub trust_forwarded_headers: bool,
    /// Whether new registrations are accepted.
    pub allow_registration: bool,
    /// Maximum registered identities (0 = unlimited).
    pub max_users: u64,
}

impl AppState {
    /// Open the stores at `db_path` and build the token services from `config`.
    pub fn open(config: &Config, db_path: &FsPath, clock: Arc<dyn Clock>) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let identities = Arc::new(
            CredentialStore::new(db_path)
                .with_context(|| format!("Failed to open credential store {}", db_path.display()))?,
        );
        let courses = Arc::new(
            CourseStore::new(db_path)
                .with_context(|| format!("Failed to open course store {}", db_path.display()))?,
        );
        let tokens = Arc::new(TokenConfig::from_auth_config(&config.auth));

        Ok(Self {
            issuer: Arc::new(TokenIssuer::new(tokens.clone(), clock.clone())),
            verifier: Arc::new(TokenVerifier::new(tokens, clock, identities.clone())),
            identities,
            courses,
            login_throttle: Arc::new(LoginThrottle::per_minute(
                config.auth.failed_logins_per_minute,
            )),
            trust_forwarded_headers: config.gateway.trust_forwarded_headers,
            allow_registration: config.auth.allow_registration,
            max_users: config.auth.max_users,
        })
    }
}

/// Build the router with every route and its gate. Transport layers (CORS,
/// limits, timeouts) are added by `run_gateway`.
pub fn build_router(state: AppState) -> Router {
    let required = middleware::from_fn_with_state(
        GateState::new(state.verifier.clone(), GateMode::Required),
        request_gate,
    );
    let optional = middleware::from_fn_with_state(
        GateState::new(state.verifier.clone(), GateMode::Optional),
        request_gate,
    );

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/auth/register", post(handle_auth_register))
        .route("/api/auth/login", post(handle_auth_login))
        .route("/api/auth/refresh", post(handle_auth_refresh))
        .route(
            "/api/auth/protected",
            get(handle_auth_protected).route_layer(required.clone()),
        )
        .route("/api/auth/me", get(handle_auth_me).route_layer(required.clone()))
        .route(
            "/api/auth/password",
            post(handle_auth_change_password).route_layer(required.clone()),
        )
        .route("/api/users/count", get(handle_user_count))
        .route(
            "/api/courses",
            get(handle_course_list)
                .route_layer(optional.clone())
                .merge(post(handle_course_create).route_layer(required.clone())),
        )
        .route(
            "/api/courses/{id}",
            get(handle_course_get).route_layer(optional).merge(
                put(handle_course_update)
                    .delete(handle_course_delete)
                    .route_layer(required.clone()),
            ),
        )
        .route(
            "/api/courses/{id}/enroll",
            post(handle_course_enroll).route_layer(required.clone()),
        )
        .route(
            "/api/enrollments",
            get(handle_enrollments_list).route_layer(required.clone()),
        )
        .route(
            "/api/admin/users/{id}/deactivate",
            post(handle_admin_deactivate).route_layer(required),
        )
        .with_state(state)
}

fn is_public_bind(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return false;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map_or(true, |ip| !ip.is_loopback())
}

/// Run the HTTP gateway until Ctrl-C.
pub async fn run_gateway(config: Config) -> Result<()> {
    config.validate()?;
    let host = config.gateway.host.as_str();
    let port = config.gateway.port;

    // ── Security: refuse public bind without explicit opt-in ──
    if is_public_bind(host) && !config.gateway.allow_public_bind {
        anyhow::bail!(
            "Refusing to bind to {host}: the API would be reachable from other hosts.\n\
             Fix: use --host 127.0.0.1 (default), or set\n\
             [gateway] allow_public_bind = true in config.toml."
        );
    }

    let db_path = config.database_path()?;
    let state = AppState::open(&config, &db_path, Arc::new(SystemClock))?;
    tracing::info!(database = %db_path.display(), "Stores initialized");

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Gateway listening on http://{}", listener.local_addr()?);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    let app = build_router(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ));

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    tracing::info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// Concrete return type for handlers (avoids `impl IntoResponse` inference issues).
type ApiResponse = (StatusCode, Json<serde_json::Value>);

fn error_response(status: StatusCode, message: impl Into<String>) -> ApiResponse {
    (status, Json(serde_json::json!({ "error": message.into() })))
}

fn internal_error(context: &str, err: &anyhow::Error) -> ApiResponse {
    tracing::error!("{context}: {err:#}");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

fn bad_body(rejection: &JsonRejection) -> ApiResponse {
    error_response(
        StatusCode::BAD_REQUEST,
        format!("Invalid request: {rejection}"),
    )
}

/// GET /health: always public
async fn handle_health() -> ApiResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

// ══════════════════════════════════════════════════════════════════════════════
// AUTH HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

const LOGIN_FAILED: &str = "Wrong username or password.";

#[derive(Deserialize)]
struct RegisterBody {
    email: String,
    phone_number: String,
    password: String,
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: String,
}

/// Missing fields behave like a wrong password.
#[derive(Deserialize)]
struct LoginBody {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

#[derive(Deserialize)]
struct RefreshBody {
    #[serde(default)]
    refresh: String,
}

#[derive(Deserialize)]
struct ChangePasswordBody {
    current_password: String,
    new_password: String,
}

/// POST /api/auth/register: create a new identity.
async fn handle_auth_register(
    State(state): State<AppState>,
    body: Result<Json<RegisterBody>, JsonRejection>,
) -> ApiResponse {
    if !state.allow_registration {
        return error_response(StatusCode::FORBIDDEN, "Registration is disabled");
    }

    // Enforce max_users limit (0 = unlimited)
    if state.max_users > 0 {
        match state.identities.identity_count() {
            Ok(count) if count >= state.max_users => {
                return error_response(StatusCode::FORBIDDEN, "Maximum user limit reached");
            }
            Ok(_) => {}
            Err(e) => return internal_error("Failed to count identities", &e),
        }
    }

    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => return bad_body(&e),
    };

    let new = NewIdentity {
        email: body.email,
        phone_number: body.phone_number,
        password: body.password,
        first_name: body.first_name,
        last_name: body.last_name,
        is_staff: false,
    };
    match state.identities.register(&new) {
        Ok(identity) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "id": identity.id,
                "email": identity.email,
            })),
        ),
        Err(e @ RegisterError::Duplicate) => error_response(StatusCode::CONFLICT, e.to_string()),
        Err(RegisterError::Invalid(msg)) => error_response(StatusCode::BAD_REQUEST, msg),
        Err(RegisterError::Storage(e)) => internal_error("Registration failed", &e),
    }
}

/// POST /api/auth/login: exchange credentials for an access/renewal pair.
///
/// Repeated failures for one handle from one client are answered with 429
/// before the password is checked.
async fn handle_auth_login(
    State(state): State<AppState>,
    peer: PeerAddr,
    headers: HeaderMap,
    body: Result<Json<LoginBody>, JsonRejection>,
) -> ApiResponse {
    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => return bad_body(&e),
    };

    let client = client_address(peer, &headers, state.trust_forwarded_headers);
    let key = throttle_key(&client, &body.email);
    if state.login_throttle.is_blocked(&key) {
        tracing::warn!(client = %client, "Login throttled after repeated failures");
        return error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "Too many failed login attempts. Try again later.",
        );
    }

    match flow::login(&state.identities, &state.issuer, &body.email, &body.password) {
        Ok(pair) => {
            state.login_throttle.clear(&key);
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "access": pair.access,
                    "refresh": pair.refresh,
                })),
            )
        }
        Err(AuthError::Storage(e)) => internal_error("Login lookup failed", &e),
        Err(_) => {
            state.login_throttle.record_failure(&key);
            error_response(StatusCode::UNAUTHORIZED, LOGIN_FAILED)
        }
    }
}

/// POST /api/auth/refresh: mint a new access token from a renewal token.
///
/// Expired and malformed renewal tokens are reported differently so clients
/// know whether to log in again or give up.
async fn handle_auth_refresh(
    State(state): State<AppState>,
    body: Result<Json<RefreshBody>, JsonRejection>,
) -> ApiResponse {
    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => return bad_body(&e),
    };

    match flow::renew(&state.verifier, &state.issuer, &body.refresh) {
        Ok(access) => (StatusCode::OK, Json(serde_json::json!({ "access": access }))),
        Err(AuthError::Token(e)) => {
            let status = match e {
                TokenError::Malformed | TokenError::MalformedPayload => StatusCode::BAD_REQUEST,
                TokenError::Expired | TokenError::UnknownIdentity => StatusCode::UNAUTHORIZED,
                TokenError::Store => StatusCode::SERVICE_UNAVAILABLE,
            };
            error_response(status, e.kind())
        }
        Err(AuthError::Storage(e)) => internal_error("Renewal failed", &e),
        Err(_) => error_response(StatusCode::UNAUTHORIZED, "unknown_identity"),
    }
}

/// GET /api/auth/protected: smoke route for bearer authentication.
async fn handle_auth_protected(auth: AuthenticatedIdentity) -> ApiResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "message": format!("Hello, {}! Access granted.", auth.identity.email),
        })),
    )
}

/// GET /api/auth/me: profile of the authenticated identity.
async fn handle_auth_me(auth: AuthenticatedIdentity) -> ApiResponse {
    let identity = auth.identity;
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "id": identity.id,
            "email": identity.email,
            "phone_number": identity.phone_number,
            "first_name": identity.first_name,
            "last_name": identity.last_name,
            "full_name": identity.full_name(),
            "is_staff": identity.is_staff,
            "date_joined": identity.date_joined.to_rfc3339(),
        })),
    )
}

/// POST /api/auth/password: change the caller's password.
///
/// Tokens issued before the change stay valid until they expire.
async fn handle_auth_change_password(
    State(state): State<AppState>,
    auth: AuthenticatedIdentity,
    body: Result<Json<ChangePasswordBody>, JsonRejection>,
) -> ApiResponse {
    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => return bad_body(&e),
    };
    if body.new_password.len() < MIN_PASSWORD_LEN {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("Password must be at least {MIN_PASSWORD_LEN} characters"),
        );
    }

    match flow::change_password(
        &state.identities,
        auth.identity.id,
        &body.current_password,
        &body.new_password,
    ) {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "password_changed" })),
        ),
        Err(AuthError::InvalidCredentials) => {
            error_response(StatusCode::UNAUTHORIZED, "Current password is incorrect")
        }
        Err(AuthError::NotFound) => error_response(StatusCode::NOT_FOUND, "User not found"),
        Err(AuthError::Storage(e)) => internal_error("Password change failed", &e),
        Err(AuthError::Token(e)) => error_response(StatusCode::UNAUTHORIZED, e.kind()),
    }
}

/// GET /api/users/count: total registered identities.
async fn handle_user_count(State(state): State<AppState>) -> ApiResponse {
    match state.identities.identity_count() {
        Ok(total) => (
            StatusCode::OK,
            Json(serde_json::json!({ "total_users": total })),
        ),
        Err(e) => internal_error("Failed to count identities", &e),
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// COURSE HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct CourseListParams {
    search: Option<String>,
    page: Option<u32>,
}

#[derive(Deserialize)]
struct CreateCourseBody {
    title: String,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
struct UpdateCourseBody {
    title: Option<String>,
    description: Option<String>,
}

fn course_not_found() -> ApiResponse {
    error_response(StatusCode::NOT_FOUND, "Course not found")
}

/// GET /api/courses: paginated, searchable; adds `enrolled` when authenticated.
async fn handle_course_list(
    State(state): State<AppState>,
    auth: Option<AuthenticatedIdentity>,
    Query(params): Query<CourseListParams>,
) -> ApiResponse {
    let query = CourseQuery {
        search: params.search,
        page: params.page.unwrap_or(1),
    };
    let page = match state.courses.list(&query) {
        Ok(p) => p,
        Err(e) => return internal_error("Failed to list courses", &e),
    };

    let mut items = Vec::with_capacity(page.items.len());
    for course in &page.items {
        let mut item = serde_json::json!(course);
        if let Some(ref auth) = auth {
            match state.courses.is_enrolled(auth.identity.id, course.id) {
                Ok(enrolled) => item["enrolled"] = serde_json::Value::Bool(enrolled),
                Err(e) => return internal_error("Failed to check enrollment", &e),
            }
        }
        items.push(item);
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "items": items,
            "page": page.page,
            "page_size": PAGE_SIZE,
            "total": page.total,
        })),
    )
}

/// POST /api/courses: create a course owned by the caller.
async fn handle_course_create(
    State(state): State<AppState>,
    auth: AuthenticatedIdentity,
    body: Result<Json<CreateCourseBody>, JsonRejection>,
) -> ApiResponse {
    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => return bad_body(&e),
    };
    match state
        .courses
        .create(auth.identity.id, &body.title, &body.description)
    {
        Ok(course) => (StatusCode::CREATED, Json(serde_json::json!(course))),
        Err(CourseError::Invalid(msg)) => error_response(StatusCode::BAD_REQUEST, msg),
        Err(CourseError::Storage(e)) => internal_error("Failed to create course", &e),
    }
}

/// GET /api/courses/{id}
async fn handle_course_get(
    State(state): State<AppState>,
    auth: Option<AuthenticatedIdentity>,
    Path(id): Path<i64>,
) -> ApiResponse {
    let course = match state.courses.get(id) {
        Ok(Some(c)) => c,
        Ok(None) => return course_not_found(),
        Err(e) => return internal_error("Failed to load course", &e),
    };
    let mut body = serde_json::json!(course);
    if let Some(auth) = auth {
        match state.courses.is_enrolled(auth.identity.id, id) {
            Ok(enrolled) => body["enrolled"] = serde_json::Value::Bool(enrolled),
            Err(e) => return internal_error("Failed to check enrollment", &e),
        }
    }
    (StatusCode::OK, Json(body))
}

/// PUT /api/courses/{id}: owner only; anyone else sees 404.
async fn handle_course_update(
    State(state): State<AppState>,
    auth: AuthenticatedIdentity,
    Path(id): Path<i64>,
    body: Result<Json<UpdateCourseBody>, JsonRejection>,
) -> ApiResponse {
    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => return bad_body(&e),
    };
    match state.courses.update(
        id,
        auth.identity.id,
        body.title.as_deref(),
        body.description.as_deref(),
    ) {
        Ok(OwnedChange::Applied) => match state.courses.get(id) {
            Ok(Some(course)) => (StatusCode::OK, Json(serde_json::json!(course))),
            Ok(None) => course_not_found(),
            Err(e) => internal_error("Failed to reload course", &e),
        },
        Ok(OwnedChange::NotFound | OwnedChange::NotOwner) => course_not_found(),
        Err(CourseError::Invalid(msg)) => error_response(StatusCode::BAD_REQUEST, msg),
        Err(CourseError::Storage(e)) => internal_error("Failed to update course", &e),
    }
}

/// DELETE /api/courses/{id}: owner only; anyone else sees 404.
async fn handle_course_delete(
    State(state): State<AppState>,
    auth: AuthenticatedIdentity,
    Path(id): Path<i64>,
) -> ApiResponse {
    match state.courses.delete(id, auth.identity.id) {
        Ok(OwnedChange::Applied) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "deleted", "course_id": id })),
        ),
        Ok(OwnedChange::NotFound | OwnedChange::NotOwner) => course_not_found(),
        Err(e) => internal_error("Failed to delete course", &e),
    }
}

/// POST /api/courses/{id}/enroll: idempotent.
async fn handle_course_enroll(
    State(state): State<AppState>,
    auth: AuthenticatedIdentity,
    Path(id): Path<i64>,
) -> ApiResponse {
    match state.courses.enroll(auth.identity.id, id) {
        Ok(EnrollOutcome::Enrolled) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "status": "enrolled", "course_id": id })),
        ),
        Ok(EnrollOutcome::AlreadyEnrolled) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "already_enrolled", "course_id": id })),
        ),
        Ok(EnrollOutcome::CourseNotFound) => course_not_found(),
        Err(e) => internal_error("Failed to enroll", &e),
    }
}

/// GET /api/enrollments: the caller's enrollments.
async fn handle_enrollments_list(
    State(state): State<AppState>,
    auth: AuthenticatedIdentity,
) -> ApiResponse {
    match state.courses.enrollments_for(auth.identity.id) {
        Ok(enrollments) => (
            StatusCode::OK,
            Json(serde_json::json!({ "enrollments": enrollments })),
        ),
        Err(e) => internal_error("Failed to list enrollments", &e),
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// ADMIN HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// POST /api/admin/users/{id}/deactivate: staff only; others get 404.
async fn handle_admin_deactivate(
    State(state): State<AppState>,
    auth: AuthenticatedIdentity,
    Path(user_id): Path<i64>,
) -> ApiResponse {
    if !auth.identity.is_staff {
        return error_response(StatusCode::NOT_FOUND, "Not found");
    }
    if auth.identity.id == user_id {
        return error_response(StatusCode::BAD_REQUEST, "Cannot deactivate yourself");
    }
    match state.identities.deactivate(user_id) {
        Ok(true) => {
            tracing::info!(admin_id = auth.identity.id, user_id, "Admin deactivated identity");
            (
                StatusCode::OK,
                Json(serde_json::json!({ "status": "deactivated", "user_id": user_id })),
            )
        }
        Ok(false) => error_response(StatusCode::NOT_FOUND, "User not found"),
        Err(e) => internal_error("Failed to deactivate identity", &e),
    }
}
