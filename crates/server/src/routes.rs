//! Route configuration.

use crate::auth::auth_middleware;
use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use crate::version::api_version_middleware;
use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/whoami", get(handlers::whoami))
        .route(
            "/images",
            get(handlers::list_images).post(handlers::create_image),
        )
        .route(
            "/images/{id}",
            get(handlers::get_image).delete(handlers::destroy_image),
        )
        .route("/images/{id}/done", post(handlers::finalise_image))
        .route(
            "/instances",
            get(handlers::list_instances).post(handlers::create_instance),
        )
        .route(
            "/instances/{id}",
            get(handlers::get_instance).delete(handlers::destroy_instance),
        )
        // Layers run outermost first: auth, then the version check.
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api_version_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // Health check stays unauthenticated for load balancers and probes.
    let mut router = Router::new()
        .route("/health_check", get(handlers::health_check))
        .merge(api_routes);

    // SECURITY: when enabled, /metrics must be network-restricted to the
    // Prometheus scrapers.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
