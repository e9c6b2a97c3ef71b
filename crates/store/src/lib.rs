//! Persistent state for the checkout core: products with guarded counters,
//! reservations, orders, idempotency records, low-stock signals, and carts.
//!
//! The crate exposes one storage trait per collection plus the
//! [`CheckoutStore`] supertrait the engine is generic over, with two
//! interchangeable backends: [`InMemoryStore`] (tests and the default
//! runtime) and [`PostgresStore`] (sqlx).

pub mod error;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::InMemoryStore;
pub use model::{
    Address, CartLine, IdempotencyRecord, IdempotencyState, LineSnapshot, LowStockSignal, Order,
    OrderState, Product, Reservation, ReservationState, ShippingMethod,
};
pub use postgres::PostgresStore;
pub use store::{
    CartStore, CheckoutStore, CommitOutcome, IdempotencyStore, InventoryStore, LowStockStore,
    OrderStore, ReservationStore, SlotOutcome, StockLevels,
};
