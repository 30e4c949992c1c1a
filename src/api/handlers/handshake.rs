use std::sync::Arc;

use axum::{
    extract::Extension,
    http::HeaderMap,
    response::{IntoResponse, Json},
};
use serde_json::json;

use crate::runtime::RuntimeContext;
use crate::session;

use super::{error_response, scope_from_headers};

#[utoipa::path(
    post,
    path = "/handshake",
    responses(
        (status = 200, description = "SDK bootstrap data for the requesting tenant"),
        (status = 400, description = "Tenant or app not found")
    ),
    tag = "session"
)]
pub async fn handshake(
    headers: HeaderMap,
    ctx: Extension<Arc<RuntimeContext>>,
) -> impl IntoResponse {
    let scope = scope_from_headers(&headers);
    match session::handshake_info(&ctx, &scope).await {
        Ok(info) => Json(json!({
            "status": "OK",
            "jwtSigningPublicKey": info.jwt_signing_public_key,
            "jwtSigningPublicKeyExpiryTime": info.jwt_signing_public_key_expiry_time,
            "cookieDomain": info.cookie_domain,
            "cookieSecure": info.cookie_secure,
            "accessTokenPath": info.access_token_path,
            "refreshTokenPath": info.refresh_token_path,
            "enableAntiCsrf": info.enable_anti_csrf,
            "accessTokenBlacklistingEnabled": info.access_token_blacklisting_enabled,
        }))
        .into_response(),
        Err(err) => error_response(&err),
    }
}
