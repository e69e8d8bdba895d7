mod classify;
mod health;
mod metrics;

use crate::{auth::require_bearer, server::SharedState};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use classify::classify_image;
use health::healthcheck;
use metrics::metrics_handler;

/// `/classify` sits behind the bearer gate; health and metrics stay open.
pub fn api_routes(state: &SharedState) -> Router<SharedState> {
    Router::new()
        .route("/classify", post(classify_image))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ))
        .route("/health", get(healthcheck))
        .route("/metrics", get(metrics_handler))
}
