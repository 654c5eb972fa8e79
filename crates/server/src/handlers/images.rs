//! Image endpoints.

use crate::auth::require_auth;
use crate::error::ApiResult;
use crate::handlers::common::{parse_image_id, read_json};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use clonedb_core::Image;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Request to register a new backup.
#[derive(Debug, Deserialize)]
pub struct CreateImageRequest {
    #[serde(with = "time::serde::rfc3339")]
    pub backed_up_at: OffsetDateTime,
    /// SQL (or any script) run against the upload on finalise.
    #[serde(default)]
    pub anonymisation_script: String,
}

/// Image representation returned to clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ImageResponse {
    pub id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub backed_up_at: OffsetDateTime,
    pub ready: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<Image> for ImageResponse {
    fn from(image: Image) -> Self {
        Self {
            id: image.id.get(),
            backed_up_at: image.backed_up_at,
            ready: image.ready,
            created_at: image.created_at,
            updated_at: image.updated_at,
        }
    }
}

/// Response for listing images.
#[derive(Debug, Serialize, Deserialize)]
pub struct ImageListResponse {
    pub images: Vec<ImageResponse>,
}

/// GET /images - List all images.
pub async fn list_images(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<Json<ImageListResponse>> {
    require_auth(&req)?;

    let images = state.lifecycle.list_images().await?;
    Ok(Json(ImageListResponse {
        images: images.into_iter().map(ImageResponse::from).collect(),
    }))
}

/// POST /images - Register a backup and create its upload subvolume.
pub async fn create_image(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<(StatusCode, Json<ImageResponse>)> {
    let auth = require_auth(&req)?.clone();
    let body: CreateImageRequest = read_json(req).await?;

    let image = state
        .lifecycle
        .create_image(body.backed_up_at, body.anonymisation_script.into_bytes())
        .await?;
    tracing::debug!(image_id = %image.id, principal = %auth.principal.identity, "Image registered");

    Ok((StatusCode::CREATED, Json(ImageResponse::from(image))))
}

/// GET /images/{id} - Get one image.
pub async fn get_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: Request,
) -> ApiResult<Json<ImageResponse>> {
    require_auth(&req)?;
    let image_id = parse_image_id(&id)?;

    let image = state.lifecycle.get_image(image_id).await?;
    Ok(Json(ImageResponse::from(image)))
}

/// POST /images/{id}/done - Finalise an image.
pub async fn finalise_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: Request,
) -> ApiResult<Json<ImageResponse>> {
    require_auth(&req)?;
    let image_id = parse_image_id(&id)?;

    let image = state.lifecycle.finalise_image(image_id).await?;
    Ok(Json(ImageResponse::from(image)))
}

/// DELETE /images/{id} - Destroy an image.
///
/// For the upload principal this also destroys every instance of the image.
pub async fn destroy_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: Request,
) -> ApiResult<StatusCode> {
    let auth = require_auth(&req)?;
    let image_id = parse_image_id(&id)?;

    state
        .lifecycle
        .destroy_image_as(&auth.principal, image_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
