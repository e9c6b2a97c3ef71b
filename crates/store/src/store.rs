//! Storage traits for the checkout collections.
//!
//! Every mutating primitive on [`InventoryStore`] is a single conditional
//! atomic update against the backend, never a read-then-write. Callers that
//! touch multiple products in one logical operation must issue the updates
//! in ascending [`ProductId`] order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CallerId, OrderId, ProductId, ReservationId};

use crate::error::Result;
use crate::model::{
    CartLine, IdempotencyRecord, IdempotencyState, LowStockSignal, Order, Product, Reservation,
    ReservationState,
};

/// Stock and reserved counters for a product, with the derived available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockLevels {
    pub stock: i64,
    pub reserved: i64,
    /// `stock - reserved`; never negative at any committed state.
    pub available: i64,
}

/// Post-update counters returned by a successful commit, so the caller can
/// decide whether to emit a low-stock signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    pub stock_after: i64,
    pub low_stock_threshold: i64,
}

/// Result of an atomic insert-if-absent on the idempotency index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotOutcome {
    /// This caller created the record; it holds the slot.
    Inserted,
    /// The record already existed; the existing row is returned unchanged.
    Existing(IdempotencyRecord),
}

/// Per-product counters with conditional guarded updates.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Inserts a product. Fails with `Conflict` if the SKU is taken.
    async fn insert_product(&self, product: Product) -> Result<()>;

    /// Loads a product by ID.
    async fn get_product(&self, id: ProductId) -> Result<Option<Product>>;

    /// Reads the counters and derived available for a product.
    async fn stock_levels(&self, id: ProductId) -> Result<StockLevels>;

    /// Succeeds iff `stock - reserved >= n`; on success `reserved += n`.
    ///
    /// Fails with `Insufficient` when the guard is unmet and `NotFound` for
    /// an unknown product. Never blocks.
    async fn try_increment_reserved(&self, id: ProductId, n: u32) -> Result<()>;

    /// Succeeds iff `reserved >= n` and `stock >= n`; on success both
    /// counters drop by `n`. Returns the post-update stock and the
    /// product's low-stock threshold.
    async fn try_commit(&self, id: ProductId, n: u32) -> Result<CommitOutcome>;

    /// Guarded decrement of `reserved` (must stay `>= 0`). Used by the
    /// sweeper and by compensation when a multi-line hold aborts.
    async fn release_reserved(&self, id: ProductId, n: u32) -> Result<()>;

    /// Inverse of [`Self::try_commit`]: `stock += n` and `reserved += n`.
    /// Only the confirm abort path calls this, to unwind lines already
    /// committed before a later line failed.
    async fn restore_committed(&self, id: ProductId, n: u32) -> Result<()>;
}

/// Soft-hold records with a conditional state transition.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Inserts a new reservation.
    async fn insert_reservation(&self, reservation: Reservation) -> Result<()>;

    /// Loads a reservation by ID.
    async fn get_reservation(&self, id: ReservationId) -> Result<Option<Reservation>>;

    /// Conditionally moves a reservation from `from` to `to`.
    ///
    /// Returns `false` when zero records matched (the reservation is absent
    /// or no longer in `from`) — the loser of a confirm/sweep race observes
    /// exactly this.
    async fn transition_reservation(
        &self,
        id: ReservationId,
        from: ReservationState,
        to: ReservationState,
    ) -> Result<bool>;

    /// Active reservations with `expires_at <= now`, oldest first, capped at
    /// `limit`. Backed by the `(state, expires_at)` index.
    async fn find_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Reservation>>;
}

/// Keyed records of in-flight and completed commit attempts.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomic insert-if-absent on the unique `(caller, endpoint, key)`
    /// triple. Exactly one concurrent creator observes `Inserted`; all
    /// others get the existing record.
    async fn reserve_slot(
        &self,
        caller: &CallerId,
        endpoint: &str,
        key: &str,
        fingerprint: &str,
    ) -> Result<SlotOutcome>;

    /// Overwrites the record's state and cached response.
    ///
    /// A record already in `Succeeded` is frozen: the update is silently
    /// ignored, so a slower failed attempt can never clobber the cached
    /// response of the attempt that committed.
    async fn finish_slot(
        &self,
        caller: &CallerId,
        endpoint: &str,
        key: &str,
        state: IdempotencyState,
        response: Option<serde_json::Value>,
    ) -> Result<()>;
}

/// Orders produced by confirm; append-only from the core's perspective.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Inserts a new order.
    async fn insert_order(&self, order: Order) -> Result<()>;

    /// Loads an order by ID.
    async fn get_order(&self, id: OrderId) -> Result<Option<Order>>;
}

/// The cart collaborator's interface: read by reserve, deleted by confirm.
#[async_trait]
pub trait CartStore: Send + Sync {
    /// Returns the caller's cart lines (empty if no cart exists).
    async fn cart_lines(&self, caller: &CallerId) -> Result<Vec<CartLine>>;

    /// Replaces the caller's cart wholesale.
    async fn replace_cart(&self, caller: &CallerId, lines: Vec<CartLine>) -> Result<()>;

    /// Removes the caller's cart. Deleting an absent cart is not an error.
    async fn delete_cart(&self, caller: &CallerId) -> Result<()>;
}

/// Append-only low-stock signals for the alerting collaborator.
#[async_trait]
pub trait LowStockStore: Send + Sync {
    /// Appends a signal.
    async fn insert_signal(&self, signal: LowStockSignal) -> Result<()>;

    /// Signals not yet picked up by the alerting sink, oldest first.
    async fn unprocessed_signals(&self) -> Result<Vec<LowStockSignal>>;
}

/// Everything the reservation engine and sweeper need from a backend.
pub trait CheckoutStore:
    InventoryStore + ReservationStore + IdempotencyStore + OrderStore + CartStore + LowStockStore
{
}

// Blanket implementation for any backend providing all six collections.
impl<T> CheckoutStore for T where
    T: InventoryStore
        + ReservationStore
        + IdempotencyStore
        + OrderStore
        + CartStore
        + LowStockStore
{
}
