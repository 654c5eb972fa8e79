//! Authentication-related endpoints.

use crate::auth::require_auth;
use crate::error::ApiResult;
use axum::Json;
use axum::extract::Request;
use clonedb_core::PrincipalClass;
use serde::Serialize;

/// Response for the authenticated caller.
#[derive(Debug, Serialize)]
pub struct WhoamiResponse {
    pub identity: String,
    pub class: PrincipalClass,
    pub token_id: String,
}

/// GET /whoami - Return the caller's identity and principal class.
pub async fn whoami(req: Request) -> ApiResult<Json<WhoamiResponse>> {
    let auth = require_auth(&req)?;

    Ok(Json(WhoamiResponse {
        identity: auth.principal.identity.clone(),
        class: auth.principal.class,
        token_id: auth.token_id.to_string(),
    }))
}
