//! Checkout endpoints: reserve, confirm, and reservation lookup.
//!
//! Caller identity arrives out of band in the `X-Caller-Id` header; a
//! request without it never reaches the engine. The confirm fingerprint is
//! computed here, over the request body as received, before the body is
//! interpreted.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use common::{CallerId, ReservationId};
use engine::{ConfirmReceipt, ReservationEngine, ReservationStatus, ReserveReceipt, fingerprint};
use serde::Deserialize;
use store::{Address, CheckoutStore, ShippingMethod};
use uuid::Uuid;

use crate::error::ApiError;
use crate::rate_limit::RateLimiter;

/// Header carrying the opaque caller identity.
pub const CALLER_HEADER: &str = "x-caller-id";

/// Header carrying the caller-generated confirm token.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Shared application state accessible from all handlers.
pub struct AppState<S: CheckoutStore> {
    pub engine: ReservationEngine<S>,
    pub store: S,
    pub limiter: RateLimiter,
}

pub(crate) fn caller_from(headers: &HeaderMap) -> Result<CallerId, ApiError> {
    headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(CallerId::new)
        .ok_or_else(|| ApiError::Unauthorized(format!("missing {CALLER_HEADER} header")))
}

// -- Request types --

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveRequest {
    pub address: AddressRequest,
    pub shipping_method: String,
}

#[derive(Deserialize)]
pub struct AddressRequest {
    pub name: String,
    pub phone: String,
    pub line1: String,
    pub city: String,
    pub state: String,
    pub pincode: String,
}

impl From<AddressRequest> for Address {
    fn from(req: AddressRequest) -> Self {
        Address {
            name: req.name,
            phone: req.phone,
            line1: req.line1,
            city: req.city,
            state: req.state,
            pincode: req.pincode,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmRequest {
    reservation_id: Uuid,
}

// -- Handlers --

/// POST /checkout/reserve — place a soft hold on the caller's cart.
#[tracing::instrument(skip(state, headers, req))]
pub async fn reserve<S: CheckoutStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    Json(req): Json<ReserveRequest>,
) -> Result<Json<ReserveReceipt>, ApiError> {
    let caller = caller_from(&headers)?;
    if !state.limiter.check(caller.as_str()) {
        return Err(ApiError::RateLimited);
    }

    let shipping_method = ShippingMethod::parse(&req.shipping_method).ok_or_else(|| {
        ApiError::BadRequest(format!(
            "unknown shipping method '{}'",
            req.shipping_method
        ))
    })?;

    // The cart is read server-side; the request never carries lines.
    let lines = state
        .store
        .cart_lines(&caller)
        .await
        .map_err(|err| ApiError::Engine(err.into()))?;

    let receipt = state
        .engine
        .reserve(&caller, lines, req.address.into(), shipping_method)
        .await?;
    Ok(Json(receipt))
}

/// POST /checkout/confirm — turn a held reservation into an order.
#[tracing::instrument(skip(state, headers, payload))]
pub async fn confirm<S: CheckoutStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<ConfirmReceipt>, ApiError> {
    let caller = caller_from(&headers)?;
    if !state.limiter.check(caller.as_str()) {
        return Err(ApiError::RateLimited);
    }

    let key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            ApiError::BadRequest(format!("missing {IDEMPOTENCY_KEY_HEADER} header"))
        })?
        .to_string();

    let request_fingerprint = fingerprint(&payload);
    let req: ConfirmRequest = serde_json::from_value(payload)
        .map_err(|err| ApiError::BadRequest(format!("invalid confirm body: {err}")))?;

    let receipt = state
        .engine
        .confirm(
            &caller,
            ReservationId::from_uuid(req.reservation_id),
            &key,
            &request_fingerprint,
        )
        .await?;
    Ok(Json(receipt))
}

/// GET /reservations/{id} — a reservation with its current validity.
#[tracing::instrument(skip(state, headers))]
pub async fn get_reservation<S: CheckoutStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<ReservationStatus>, ApiError> {
    let caller = caller_from(&headers)?;
    let status = state
        .engine
        .get_reservation(&caller, ReservationId::from_uuid(id))
        .await?;
    Ok(Json(status))
}
