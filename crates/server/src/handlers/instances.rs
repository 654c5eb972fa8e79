//! Instance endpoints.

use crate::auth::require_auth;
use crate::error::ApiResult;
use crate::handlers::common::{parse_instance_id, read_json};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use clonedb_core::{ImageId, Instance};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Request to clone an image.
#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    pub image_id: i64,
}

/// Instance representation returned to clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct InstanceResponse {
    pub id: i64,
    pub image_id: i64,
    pub port: u16,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<Instance> for InstanceResponse {
    fn from(instance: Instance) -> Self {
        Self {
            id: instance.id.get(),
            image_id: instance.image_id.get(),
            port: instance.port,
            created_at: instance.created_at,
            updated_at: instance.updated_at,
        }
    }
}

/// Response for listing instances.
#[derive(Debug, Serialize, Deserialize)]
pub struct InstanceListResponse {
    pub instances: Vec<InstanceResponse>,
}

/// GET /instances - List all instances.
pub async fn list_instances(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<Json<InstanceListResponse>> {
    require_auth(&req)?;

    let instances = state.lifecycle.list_instances().await?;
    Ok(Json(InstanceListResponse {
        instances: instances.into_iter().map(InstanceResponse::from).collect(),
    }))
}

/// POST /instances - Clone a ready image into a running instance.
pub async fn create_instance(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<(StatusCode, Json<InstanceResponse>)> {
    require_auth(&req)?;
    let body: CreateInstanceRequest = read_json(req).await?;

    let instance = state
        .lifecycle
        .create_instance(ImageId::new(body.image_id))
        .await?;
    Ok((StatusCode::CREATED, Json(InstanceResponse::from(instance))))
}

/// GET /instances/{id} - Get one instance.
pub async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: Request,
) -> ApiResult<Json<InstanceResponse>> {
    require_auth(&req)?;
    let instance_id = parse_instance_id(&id)?;

    let instance = state.lifecycle.get_instance(instance_id).await?;
    Ok(Json(InstanceResponse::from(instance)))
}

/// DELETE /instances/{id} - Stop and destroy an instance.
pub async fn destroy_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: Request,
) -> ApiResult<StatusCode> {
    require_auth(&req)?;
    let instance_id = parse_instance_id(&id)?;

    state.lifecycle.destroy_instance(instance_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
