use common::ProductId;
use thiserror::Error;

/// Errors that can occur when interacting with the checkout stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A guarded inventory update found fewer units than requested.
    #[error("insufficient stock for product {product_id}: requested {requested}, available {available}")]
    Insufficient {
        product_id: ProductId,
        requested: i64,
        available: i64,
    },

    /// The referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A unique index rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A database error occurred.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
