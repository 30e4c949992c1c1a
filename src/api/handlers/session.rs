//! Session lifecycle endpoints: create, verify, refresh, remove.

use std::sync::Arc;

use axum::{
    extract::Extension,
    http::HeaderMap,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use serde_json::{json, Value};
use utoipa::ToSchema;

use crate::runtime::RuntimeContext;
use crate::session;

use super::{error_response, scope_from_headers, session_json};

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub user_id: String,
    #[serde(rename = "userDataInJWT", default)]
    #[schema(value_type = Object)]
    pub user_data_in_jwt: Value,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerifySessionRequest {
    pub access_token: String,
    #[serde(default)]
    pub anti_csrf_token: Option<String>,
    #[serde(default = "default_true")]
    pub do_anti_csrf_check: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSessionRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemoveSessionRequest {
    #[serde(default)]
    pub session_handles: Option<Vec<String>>,
    #[serde(default)]
    pub user_id: Option<String>,
}

fn default_true() -> bool {
    true
}

#[utoipa::path(
    post,
    path = "/session",
    request_body = CreateSessionRequest,
    responses(
        (status = 200, description = "Session created with fresh token pair"),
        (status = 400, description = "Tenant or app not found")
    ),
    tag = "session"
)]
pub async fn create(
    headers: HeaderMap,
    ctx: Extension<Arc<RuntimeContext>>,
    Json(request): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    let scope = scope_from_headers(&headers);
    match session::create_new_session(&ctx, &scope, &request.user_id, request.user_data_in_jwt)
        .await
    {
        Ok(info) => Json(session_json(&info)).into_response(),
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    post,
    path = "/session/verify",
    request_body = VerifySessionRequest,
    responses(
        (status = 200, description = "Access token is valid"),
        (status = 401, description = "Token expired or unverifiable")
    ),
    tag = "session"
)]
pub async fn verify(
    headers: HeaderMap,
    ctx: Extension<Arc<RuntimeContext>>,
    Json(request): Json<VerifySessionRequest>,
) -> impl IntoResponse {
    let scope = scope_from_headers(&headers);
    match session::get_session(
        &ctx,
        &scope,
        &request.access_token,
        request.anti_csrf_token.as_deref(),
        request.do_anti_csrf_check,
    )
    .await
    {
        Ok(verified) => Json(json!({
            "status": "OK",
            "session": {
                "handle": verified.session_handle,
                "userId": verified.user_id,
                "userDataInJWT": verified.user_data,
            },
        }))
        .into_response(),
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    post,
    path = "/session/refresh",
    request_body = RefreshSessionRequest,
    responses(
        (status = 200, description = "Token pair rotated"),
        (status = 401, description = "Invalid, expired, or reused refresh token")
    ),
    tag = "session"
)]
pub async fn refresh(
    headers: HeaderMap,
    ctx: Extension<Arc<RuntimeContext>>,
    Json(request): Json<RefreshSessionRequest>,
) -> impl IntoResponse {
    let scope = scope_from_headers(&headers);
    match session::refresh_session(&ctx, &scope, &request.refresh_token).await {
        Ok(info) => Json(session_json(&info)).into_response(),
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    post,
    path = "/session/remove",
    request_body = RemoveSessionRequest,
    responses(
        (status = 200, description = "Sessions revoked")
    ),
    tag = "session"
)]
pub async fn remove(
    headers: HeaderMap,
    ctx: Extension<Arc<RuntimeContext>>,
    Json(request): Json<RemoveSessionRequest>,
) -> impl IntoResponse {
    let scope = scope_from_headers(&headers);
    let result = match (&request.session_handles, &request.user_id) {
        (Some(handles), _) => session::revoke_sessions(&ctx, &scope, handles).await,
        (None, Some(user_id)) => {
            session::revoke_all_sessions_for_user(&ctx, &scope, user_id).await
        }
        (None, None) => Ok(0),
    };
    match result {
        Ok(revoked) => Json(json!({"status": "OK", "sessionsRevoked": revoked})).into_response(),
        Err(err) => error_response(&err),
    }
}
