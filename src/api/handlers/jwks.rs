use std::sync::Arc;

use axum::{
    extract::Extension,
    http::HeaderMap,
    response::{IntoResponse, Json},
};

use crate::runtime::RuntimeContext;
use crate::signing_keys::SigningKeyManager;
use crate::session::SessionError;

use super::{error_response, scope_from_headers};

#[utoipa::path(
    get,
    path = "/.well-known/jwks.json",
    responses(
        (status = 200, description = "Public keys for access token verification", body = crate::signing_keys::Jwks),
        (status = 400, description = "Tenant or app not found")
    ),
    tag = "session"
)]
pub async fn jwks(headers: HeaderMap, ctx: Extension<Arc<RuntimeContext>>) -> impl IntoResponse {
    let scope = scope_from_headers(&headers);
    let manager = match SigningKeyManager::instance(&ctx, &scope) {
        Ok(manager) => manager,
        Err(err) => return error_response(&SessionError::Distributor(err)),
    };
    match manager.jwks().await {
        Ok(jwks) => Json(jwks).into_response(),
        Err(err) => error_response(&SessionError::SigningKeys(err)),
    }
}
