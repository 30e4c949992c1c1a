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

use super::{error_response, scope_from_headers};

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemoveUserRequest {
    pub user_id: String,
}

#[utoipa::path(
    post,
    path = "/user/remove",
    request_body = RemoveUserRequest,
    responses(
        (status = 200, description = "User deleted and all sessions revoked")
    ),
    tag = "users"
)]
pub async fn remove(
    headers: HeaderMap,
    ctx: Extension<Arc<RuntimeContext>>,
    Json(request): Json<RemoveUserRequest>,
) -> impl IntoResponse {
    let scope = scope_from_headers(&headers);
    match session::remove_user(&ctx, &scope, &request.user_id).await {
        Ok(did_exist) => Json(json!({"status": "OK", "didUserExist": did_exist})).into_response(),
        Err(err) => error_response(&err),
    }
}
