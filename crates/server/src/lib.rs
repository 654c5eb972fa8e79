//! HTTP control plane for clonedb.
//!
//! This crate provides:
//! - Image registration, finalisation and destruction
//! - Instance cloning and teardown
//! - Cascade destruction for the upload principal
//! - Bearer token authentication and API version negotiation

pub mod auth;
pub mod bootstrap;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod metrics;
pub mod routes;
pub mod state;
pub mod version;

pub use auth::{AuthenticatedPrincipal, Authenticator, TokenAuthenticator, TraceId};
pub use error::ApiError;
pub use lifecycle::{Lifecycle, LifecycleError, LifecycleResult};
pub use routes::create_router;
pub use state::AppState;
