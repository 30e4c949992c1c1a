use axum::response::{IntoResponse, Json};
use serde_json::json;

use crate::api::SUPPORTED_CDI_VERSIONS;

#[utoipa::path(
    get,
    path = "/apiversion",
    responses(
        (status = 200, description = "Core interface versions this build can speak")
    ),
    tag = "misc"
)]
pub async fn versions() -> impl IntoResponse {
    Json(json!({ "versions": SUPPORTED_CDI_VERSIONS }))
}
