//! Health and readiness endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;
use store::CheckoutStore;

use crate::routes::checkout::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub store: &'static str,
}

/// GET /health — liveness plus a storage round trip.
///
/// Every operation this service exists for goes through the store, so a
/// probe that cannot reach it reports 503 and orchestrators stop routing
/// checkouts here. The unprocessed-signal scan is the cheapest read the
/// store exposes.
pub async fn check<S: CheckoutStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> (StatusCode, Json<HealthResponse>) {
    match state.store.unprocessed_signals().await {
        Ok(_) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                store: "reachable",
            }),
        ),
        Err(err) => {
            tracing::error!(error = %err, "health probe could not reach the store");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "degraded",
                    store: "unreachable",
                }),
            )
        }
    }
}
