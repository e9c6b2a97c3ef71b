//! The reservation engine: two-phase reserve → confirm over the checkout
//! stores, the idempotency layer guarding confirm, and the background
//! expiry sweeper that returns stale holds to the free pool.

pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod sweeper;
mod validate;

pub use engine::{
    ConfirmReceipt, EngineConfig, ReservationEngine, ReservationStatus, ReserveReceipt,
};
pub use error::{EngineError, Result};
pub use fingerprint::fingerprint;
pub use sweeper::{SweepStats, Sweeper, SweeperConfig, SweeperHandle};
pub use validate::{MAX_LINE_QUANTITY, MIN_LINE_QUANTITY};
