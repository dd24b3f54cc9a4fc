//! HTTP handlers.

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::header::SET_COOKIE,
    response::{AppendHeaders, IntoResponse},
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::auth::{AUTH_COOKIE, AuthError, CurrentUser, IssuedToken};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Live location streams.
    pub connections: usize,
    pub located_users: usize,
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connections: state.hub.live_connection_count(),
        located_users: state.hub.locations().len(),
    })
}

/// Login request.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Response for login and token refresh.
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    /// Seconds until the token expires.
    pub expires_in: i64,
    pub user: UserInfo,
}

/// User info in auth responses.
#[derive(Debug, Serialize)]
pub struct UserInfo {
    pub id: String,
    pub name: String,
}

fn session_cookie(issued: &IssuedToken) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        AUTH_COOKIE, issued.token, issued.expires_in
    )
}

fn auth_response(issued: IssuedToken, user: UserInfo) -> impl IntoResponse {
    let cookie = session_cookie(&issued);
    (
        AppendHeaders([(SET_COOKIE, cookie)]),
        Json(AuthResponse {
            token: issued.token,
            expires_in: issued.expires_in,
            user,
        }),
    )
}

/// Exchange a username and password for a session token.
///
/// POST /login
#[instrument(skip_all)]
pub async fn login(
    State(state): State<AppState>,
    request: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = request.map_err(|e| ApiError::bad_request(e.body_text()))?;

    let user = state
        .auth
        .verify_credentials(&request.username, &request.password)
        .ok_or(AuthError::InvalidCredentials)?;

    let issued = state.auth.issue_token(&user.id, &user.name)?;
    info!(user_id = %user.id, "User logged in successfully");

    Ok(auth_response(
        issued,
        UserInfo {
            id: user.id.clone(),
            name: user.name.clone(),
        },
    ))
}

/// Validate the caller's token and hand back a fresh one.
///
/// POST /authenticate
#[instrument(skip_all, fields(user_id = %user.id()))]
pub async fn authenticate(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<impl IntoResponse> {
    let issued = state.auth.issue_token(user.id(), user.display_name())?;
    info!("Session refreshed");

    Ok(auth_response(
        issued,
        UserInfo {
            id: user.id().to_string(),
            name: user.display_name().to_string(),
        },
    ))
}

/// Fallback for unknown routes.
pub async fn not_found() -> ApiError {
    ApiError::not_found("No such route")
}
