//! Sign-up and sign-in endpoints.
//!
//! The credential digest arrives pre-hashed from the recipe layer; this core
//! neither chooses nor applies a hashing policy.

use std::sync::Arc;

use axum::{
    extract::Extension,
    http::HeaderMap,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use serde_json::json;
use utoipa::ToSchema;

use crate::runtime::RuntimeContext;
use crate::session;
use crate::storage::UserRecord;

use super::{error_response, scope_from_headers, session_json};

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsRequest {
    pub email: String,
    pub credential_digest: String,
}

fn user_session_response(
    user: &UserRecord,
    info: &session::SessionInformation,
) -> Json<serde_json::Value> {
    let mut body = session_json(info);
    body["user"] = json!({
        "id": user.user_id,
        "email": user.email,
        "timeJoined": user.created_at_millis,
    });
    Json(body)
}

#[utoipa::path(
    post,
    path = "/recipe/signup",
    request_body = CredentialsRequest,
    responses(
        (status = 200, description = "User created, session opened"),
        (status = 409, description = "Email already exists")
    ),
    tag = "recipe"
)]
pub async fn sign_up(
    headers: HeaderMap,
    ctx: Extension<Arc<RuntimeContext>>,
    Json(request): Json<CredentialsRequest>,
) -> impl IntoResponse {
    let scope = scope_from_headers(&headers);
    match session::sign_up(&ctx, &scope, &request.email, &request.credential_digest).await {
        Ok((user, info)) => user_session_response(&user, &info).into_response(),
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    post,
    path = "/recipe/signin",
    request_body = CredentialsRequest,
    responses(
        (status = 200, description = "Credentials accepted, session opened"),
        (status = 401, description = "Wrong credentials")
    ),
    tag = "recipe"
)]
pub async fn sign_in(
    headers: HeaderMap,
    ctx: Extension<Arc<RuntimeContext>>,
    Json(request): Json<CredentialsRequest>,
) -> impl IntoResponse {
    let scope = scope_from_headers(&headers);
    match session::sign_in(&ctx, &scope, &request.email, &request.credential_digest).await {
        Ok((user, info)) => user_session_response(&user, &info).into_response(),
        Err(err) => error_response(&err),
    }
}
