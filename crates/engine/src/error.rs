//! The engine's error taxonomy.
//!
//! Each variant maps to exactly one transport status: Validation=400,
//! UnknownProduct=400, Forbidden=403, NotFound=404, Insufficient=409,
//! IdempotencyMismatch=409, Gone=410; Storage and Internal surface as
//! opaque 500s. A reserve that references a product absent from the
//! catalog is a bad request (the caller sent a stale or bogus cart), not
//! a 404 lookup failure, so it gets its own variant.

use common::ProductId;
use store::StoreError;
use thiserror::Error;

/// Errors surfaced by reserve, confirm, and the sweeper.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or out-of-range input; never retried automatically.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A referenced reservation or order is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// A reserve request named a product the catalog does not have.
    #[error("unknown product {product_id}")]
    UnknownProduct { product_id: ProductId },

    /// The reservation does not belong to the calling identity.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A conditional inventory update's guard failed under concurrent
    /// depletion; the caller is expected to re-plan their cart.
    #[error("insufficient stock for product {product_id}")]
    Insufficient { product_id: ProductId },

    /// The reservation is in a terminal state or past its expiry.
    #[error("gone: {0}")]
    Gone(String),

    /// The idempotency token was reused with a different payload.
    #[error("idempotency key reused with a different request payload")]
    IdempotencyMismatch,

    /// A storage failure; surfaced to callers as an opaque internal error.
    #[error("storage error: {0}")]
    Storage(StoreError),

    /// Invariant violation or unexpected state; logged with full context.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Insufficient { product_id, .. } => EngineError::Insufficient { product_id },
            StoreError::NotFound(msg) => EngineError::NotFound(msg),
            other => EngineError::Storage(other),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
