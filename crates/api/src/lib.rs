//! HTTP transport for the checkout and inventory-reservation core.
//!
//! Exposes the reserve/confirm protocol, reservation lookup, and a minimal
//! cart surface over JSON, with structured logging (tracing) and Prometheus
//! metrics. Caller identity arrives in the `X-Caller-Id` header.

pub mod config;
pub mod error;
pub mod rate_limit;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::http::HeaderValue;
use axum::routing::{get, post, put};
use metrics_exporter_prometheus::PrometheusHandle;
use store::CheckoutStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use routes::checkout::AppState;

/// Creates the Axum application router with all routes and shared state.
///
/// `allowed_origin` restricts CORS to one origin; `None` allows any.
pub fn create_app<S: CheckoutStore + Clone + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
    allowed_origin: Option<&str>,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::render))
        .with_state(metrics_handle);

    let cors = match allowed_origin.and_then(|origin| origin.parse::<HeaderValue>().ok()) {
        Some(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(Any)
            .allow_headers(Any),
        None => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    };

    Router::new()
        .route("/health", get(routes::health::check::<S>))
        .route(
            "/cart",
            put(routes::cart::put::<S>)
                .get(routes::cart::get::<S>)
                .delete(routes::cart::clear::<S>),
        )
        .route("/checkout/reserve", post(routes::checkout::reserve::<S>))
        .route("/checkout/confirm", post(routes::checkout::confirm::<S>))
        .route(
            "/reservations/{id}",
            get(routes::checkout::get_reservation::<S>),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
