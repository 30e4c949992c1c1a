//! HTTP surface over the session façade.
//!
//! The transport stays thin: handlers translate JSON to façade calls and map
//! the error taxonomy to wire statuses. Requests negotiate a core interface
//! version through the `cdi-version` header.

pub mod handlers;

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::Request,
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Extension, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;

use crate::runtime::RuntimeContext;

/// Core interface versions this build can speak.
pub const SUPPORTED_CDI_VERSIONS: &[&str] = &["4.0", "5.0", "5.1"];

const CDI_VERSION_HEADER: &str = "cdi-version";

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::hello::hello,
        handlers::handshake::handshake,
        handlers::session::create,
        handlers::session::verify,
        handlers::session::refresh,
        handlers::session::remove,
        handlers::recipe::sign_up,
        handlers::recipe::sign_in,
        handlers::users::remove,
        handlers::jwks::jwks,
        handlers::apiversion::versions,
    ),
    components(schemas(
        handlers::session::CreateSessionRequest,
        handlers::session::VerifySessionRequest,
        handlers::session::RefreshSessionRequest,
        handlers::session::RemoveSessionRequest,
        handlers::recipe::CredentialsRequest,
        handlers::users::RemoveUserRequest,
        crate::signing_keys::Jwk,
        crate::signing_keys::Jwks,
    ))
)]
struct ApiDoc;

/// Builds the service router with the runtime context installed.
#[must_use]
pub fn router(ctx: Arc<RuntimeContext>) -> Router {
    Router::new()
        .route("/hello", get(handlers::hello::hello))
        .route("/handshake", post(handlers::handshake::handshake))
        .route("/session", post(handlers::session::create))
        .route("/session/verify", post(handlers::session::verify))
        .route("/session/refresh", post(handlers::session::refresh))
        .route("/session/remove", post(handlers::session::remove))
        .route("/recipe/signup", post(handlers::recipe::sign_up))
        .route("/recipe/signin", post(handlers::recipe::sign_in))
        .route("/user/remove", post(handlers::users::remove))
        .route("/.well-known/jwks.json", get(handlers::jwks::jwks))
        .route("/apiversion", get(handlers::apiversion::versions))
        .route("/openapi.json", get(openapi))
        .layer(middleware::from_fn(check_cdi_version))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(ctx))
}

/// Binds and serves until the process is stopped.
///
/// # Errors
/// Returns an error if the listener cannot bind or the server fails.
pub async fn serve(port: u16, ctx: Arc<RuntimeContext>) -> Result<()> {
    let listener = TcpListener::bind(format!("::0:{port}")).await?;
    info!(port, "listening");
    let app = router(ctx);
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

async fn openapi() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

/// Rejects requests that pin an unsupported core interface version. Requests
/// without the header get the latest behavior.
async fn check_cdi_version(request: Request, next: Next) -> Response {
    if let Some(requested) = request
        .headers()
        .get(CDI_VERSION_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        if !SUPPORTED_CDI_VERSIONS.contains(&requested) {
            let body = Json(json!({
                "message": format!("cdi-version {requested} not supported"),
            }));
            return (StatusCode::BAD_REQUEST, body).into_response();
        }
    }
    next.run(request).await
}
