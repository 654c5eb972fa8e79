//! Authentication middleware and principal resolution.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use clonedb_core::{Principal, Token, TokenId};
use clonedb_metadata::MetadataStore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::Instrument;
use uuid::Uuid;

/// Maximum length for trace IDs.
/// Longer trace IDs are truncated to prevent log bloat and potential log injection.
const MAX_TRACE_ID_LEN: usize = 128;

/// Trace ID for request correlation.
#[derive(Clone, Debug)]
pub struct TraceId(pub String);

impl TraceId {
    /// Generate a new random trace ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create a trace ID from a client-provided value, truncated to
    /// MAX_TRACE_ID_LEN characters with non-printable characters removed.
    pub fn from_client(value: &str) -> Self {
        // Count characters, not bytes, so multi-byte input cannot split.
        let sanitized: String = value
            .chars()
            .take(MAX_TRACE_ID_LEN)
            .filter(|c| c.is_ascii_graphic() || *c == ' ')
            .collect();

        if sanitized.is_empty() {
            Self::new()
        } else {
            Self(sanitized)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authenticated request extension.
#[derive(Clone, Debug)]
pub struct AuthenticatedPrincipal {
    pub principal: Principal,
    /// Token that authenticated the request.
    pub token_id: TokenId,
}

/// Resolves a bearer secret to the principal it belongs to.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Returns `Unauthorized` when no valid identity matches the secret.
    async fn authenticate(&self, bearer: &str) -> ApiResult<AuthenticatedPrincipal>;
}

/// Authenticator backed by the token table.
pub struct TokenAuthenticator {
    metadata: Arc<dyn MetadataStore>,
}

impl TokenAuthenticator {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, bearer: &str) -> ApiResult<AuthenticatedPrincipal> {
        let token_hash = hash_token(bearer);

        let Some(row) = self.metadata.get_token_by_hash(&token_hash).await? else {
            return Err(ApiError::Unauthorized("invalid token".to_string()));
        };
        let raw_id = row.token_id;
        let token = Token::try_from(row)
            .map_err(|e| ApiError::Internal(format!("invalid token record {raw_id}: {e}")))?;

        if !token.is_valid() {
            return Err(ApiError::Unauthorized(
                "token expired or revoked".to_string(),
            ));
        }

        // Update last used time (fire and forget)
        let metadata = self.metadata.clone();
        tokio::spawn(async move {
            let _ = metadata
                .touch_token(raw_id, OffsetDateTime::now_utc())
                .await;
        });

        Ok(AuthenticatedPrincipal {
            principal: token.principal(),
            token_id: token.id,
        })
    }
}

/// Extract bearer token from Authorization header.
/// Per RFC 6750, the "Bearer" scheme is case-insensitive.
fn extract_bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            if v.len() >= 7 && v[..7].eq_ignore_ascii_case("bearer ") {
                Some(v[7..].trim())
            } else {
                None
            }
        })
        .filter(|token| !token.is_empty())
}

/// Extract trace ID from X-Trace-Id header or generate a new one.
fn extract_or_generate_trace_id(req: &Request) -> TraceId {
    req.headers()
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(TraceId::from_client)
        .unwrap_or_else(TraceId::new)
}

/// SHA256 hex of a bearer secret, as stored in the token table.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Authentication middleware that resolves the principal and sets up
/// trace context.
///
/// A missing token passes through; handlers reject it with
/// [`require_auth`]. A token that is present but invalid is rejected here.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let trace_id = extract_or_generate_trace_id(&req);
    let span = tracing::info_span!(
        "request",
        trace_id = %trace_id,
        principal = tracing::field::Empty
    );
    req.extensions_mut().insert(trace_id);

    if let Some(bearer) = extract_bearer_token(&req).map(str::to_owned) {
        let authenticated = state
            .authenticator
            .authenticate(&bearer)
            .instrument(span.clone())
            .await?;
        span.record("principal", authenticated.principal.identity.as_str());
        req.extensions_mut().insert(authenticated);
    }

    Ok(next.run(req).instrument(span).await)
}

/// Require authentication (token must be present).
pub fn require_auth(req: &Request) -> ApiResult<&AuthenticatedPrincipal> {
    req.extensions()
        .get::<AuthenticatedPrincipal>()
        .ok_or_else(|| ApiError::Unauthorized("authentication required".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_hash_token_matches_test_config() {
        let config = clonedb_core::config::AuthConfig::for_testing();
        assert_eq!(hash_token("test-upload-token"), config.upload_token_hash);
        assert_eq!(
            hash_token("test-user-token"),
            config.principals[0].token_hash
        );
    }

    #[test]
    fn test_trace_id_sanitized() {
        let long = "a".repeat(500);
        assert_eq!(TraceId::from_client(&long).as_str().len(), MAX_TRACE_ID_LEN);
        assert_eq!(TraceId::from_client("abc\ndef").as_str(), "abcdef");
        assert!(!TraceId::from_client("\n\t").as_str().is_empty());
    }

    #[test]
    fn test_bearer_scheme_case_insensitive() {
        let req = Request::builder()
            .header(AUTHORIZATION, "bEaReR secret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_bearer_token(&req), Some("secret"));

        let req = Request::builder()
            .header(AUTHORIZATION, "Basic secret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_bearer_token(&req), None);

        let req = Request::builder()
            .header(AUTHORIZATION, "Bearer ")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_bearer_token(&req), None);
    }

    #[test]
    fn test_require_auth_without_principal() {
        let req = Request::new(Body::empty());
        assert!(matches!(
            require_auth(&req),
            Err(ApiError::Unauthorized(_))
        ));
    }
}
