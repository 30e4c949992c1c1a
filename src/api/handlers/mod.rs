//! Request handlers, one file per route group.

pub mod apiversion;
pub mod handshake;
pub mod hello;
pub mod jwks;
pub mod recipe;
pub mod session;
pub mod users;

use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};
use tracing::error;

use crate::distributor::DistributorError;
use crate::session::{SessionError, SessionInformation, TokenInfo};
use crate::tenant::{TenantScope, PUBLIC};

const APP_ID_HEADER: &str = "app-id";
const TENANT_ID_HEADER: &str = "tenant-id";
const CONNECTION_URI_DOMAIN_HEADER: &str = "connection-uri-domain";

/// Resolves the tenant scope a request addresses. Absent headers fall back
/// to the base namespace.
pub(crate) fn scope_from_headers(headers: &HeaderMap) -> TenantScope {
    TenantScope::new(
        header_value(headers, CONNECTION_URI_DOMAIN_HEADER).unwrap_or_default(),
        header_value(headers, APP_ID_HEADER).unwrap_or_else(|| PUBLIC.to_string()),
        header_value(headers, TENANT_ID_HEADER).unwrap_or_else(|| PUBLIC.to_string()),
    )
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Maps the error taxonomy onto wire statuses. Internal details stay in the
/// logs; the client only sees the taxonomy.
pub(crate) fn error_response(err: &SessionError) -> Response {
    let (status, body) = match err {
        SessionError::Unauthorised(message) => (
            StatusCode::UNAUTHORIZED,
            json!({"status": "UNAUTHORISED", "message": message}),
        ),
        SessionError::TokenTheftDetected { .. } => (
            StatusCode::UNAUTHORIZED,
            json!({"status": "UNAUTHORISED", "message": "token theft detected"}),
        ),
        SessionError::TryRefreshToken => (
            StatusCode::UNAUTHORIZED,
            json!({"status": "TRY_REFRESH_TOKEN", "message": "access token requires refresh"}),
        ),
        SessionError::DuplicateEmail => (
            StatusCode::CONFLICT,
            json!({"status": "EMAIL_ALREADY_EXISTS", "message": "email already exists"}),
        ),
        SessionError::WrongCredentials => (
            StatusCode::UNAUTHORIZED,
            json!({"status": "WRONG_CREDENTIALS", "message": "wrong credentials"}),
        ),
        SessionError::InvalidEmail => (
            StatusCode::BAD_REQUEST,
            json!({"status": "BAD_INPUT", "message": "invalid email"}),
        ),
        SessionError::Distributor(DistributorError::TenantOrAppNotFound { scope }) => (
            StatusCode::BAD_REQUEST,
            json!({"status": "TENANT_OR_APP_NOT_FOUND", "message": scope}),
        ),
        other => {
            error!("request failed: {other}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"status": "INTERNAL_ERROR", "message": "internal error"}),
            )
        }
    };
    (status, Json(body)).into_response()
}

pub(crate) fn token_json(token: &TokenInfo) -> Value {
    json!({
        "token": token.token,
        "expiry": token.expires_at_millis,
        "createdTime": token.created_at_millis,
    })
}

/// Shared `status: OK` body for create/refresh/sign-in responses.
pub(crate) fn session_json(session: &SessionInformation) -> Value {
    let mut body = json!({
        "status": "OK",
        "session": {
            "handle": session.session_handle,
            "userId": session.user_id,
            "userDataInJWT": session.user_data,
        },
        "accessToken": token_json(&session.access_token),
        "refreshToken": token_json(&session.refresh_token),
    });
    if let Some(anti_csrf) = &session.anti_csrf_token {
        body["antiCsrfToken"] = json!(anti_csrf);
    }
    body
}
