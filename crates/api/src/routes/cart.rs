//! Minimal cart surface so the checkout flow is drivable end-to-end.
//!
//! The cart subsystem proper lives outside the core; these handlers only
//! exercise the store interface the engine depends on.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use common::ProductId;
use serde::{Deserialize, Serialize};
use store::{CartLine, CheckoutStore};
use uuid::Uuid;

use crate::error::ApiError;
use crate::routes::checkout::{AppState, caller_from};

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLinePayload {
    pub product_id: Uuid,
    pub quantity: u32,
}

#[derive(Deserialize)]
pub struct PutCartRequest {
    pub lines: Vec<CartLinePayload>,
}

#[derive(Serialize)]
pub struct CartResponse {
    pub lines: Vec<CartLinePayload>,
}

/// PUT /cart — replace the caller's cart wholesale.
#[tracing::instrument(skip(state, headers, req))]
pub async fn put<S: CheckoutStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    Json(req): Json<PutCartRequest>,
) -> Result<Json<CartResponse>, ApiError> {
    let caller = caller_from(&headers)?;

    let lines: Vec<CartLine> = req
        .lines
        .iter()
        .map(|l| CartLine {
            product_id: ProductId::from_uuid(l.product_id),
            quantity: l.quantity,
        })
        .collect();

    state
        .store
        .replace_cart(&caller, lines)
        .await
        .map_err(|err| ApiError::Engine(err.into()))?;

    Ok(Json(CartResponse { lines: req.lines }))
}

/// GET /cart — the caller's current cart lines.
#[tracing::instrument(skip(state, headers))]
pub async fn get<S: CheckoutStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
) -> Result<Json<CartResponse>, ApiError> {
    let caller = caller_from(&headers)?;

    let lines = state
        .store
        .cart_lines(&caller)
        .await
        .map_err(|err| ApiError::Engine(err.into()))?
        .into_iter()
        .map(|l| CartLinePayload {
            product_id: l.product_id.as_uuid(),
            quantity: l.quantity,
        })
        .collect();

    Ok(Json(CartResponse { lines }))
}

/// DELETE /cart — drop the caller's cart.
#[tracing::instrument(skip(state, headers))]
pub async fn clear<S: CheckoutStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
) -> Result<axum::http::StatusCode, ApiError> {
    let caller = caller_from(&headers)?;

    state
        .store
        .delete_cart(&caller)
        .await
        .map_err(|err| ApiError::Engine(err.into()))?;

    Ok(axum::http::StatusCode::NO_CONTENT)
}
