//! Persisted entities and their lifecycle state machines.
//!
//! Reservation and order lines carry copies of the product's SKU, name, and
//! unit price taken at reserve time, so later catalog edits cannot rewrite
//! history.

use chrono::{DateTime, Utc};
use common::{CallerId, Money, OrderId, ProductId, ReservationId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A catalog product with its two guarded counters.
///
/// The core never mutates anything here except `stock` and `reserved`,
/// and only through the conditional primitives on `InventoryStore`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    /// Human-facing SKU, unique across the catalog.
    pub sku: String,
    pub name: String,
    /// Unit price in integer minor units.
    pub unit_price: Money,
    pub stock: i64,
    pub reserved: i64,
    /// A confirm that drops `stock` strictly below this emits a low-stock signal.
    pub low_stock_threshold: i64,
    pub image: Option<String>,
}

impl Product {
    /// Units a new reservation may claim: `stock - reserved`.
    pub fn available(&self) -> i64 {
        self.stock - self.reserved
    }
}

/// A line snapshot copied into reservations and orders at reserve time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSnapshot {
    pub product_id: ProductId,
    pub sku: String,
    pub name: String,
    pub unit_price: Money,
    pub quantity: u32,
}

impl LineSnapshot {
    /// Returns `unit_price * quantity` for this line.
    pub fn line_total(&self) -> Money {
        self.unit_price.multiply(self.quantity)
    }
}

/// The state of a reservation in its lifecycle.
///
/// State transitions:
/// ```text
/// Active ──┬──► Consumed   (confirm)
///          ├──► Expired    (sweeper)
///          └──► Cancelled  (reserved for user cancellation)
/// ```
///
/// `Consumed`, `Expired`, and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReservationState {
    /// Units are held; the reservation can still be confirmed.
    #[default]
    Active,

    /// Confirm turned the hold into an order (terminal).
    Consumed,

    /// The sweeper returned the held units to the free pool (terminal).
    Expired,

    /// Cancelled by the caller (terminal; not reachable through the engine).
    Cancelled,
}

impl ReservationState {
    /// Returns true if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationState::Active)
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Active => "active",
            ReservationState::Consumed => "consumed",
            ReservationState::Expired => "expired",
            ReservationState::Cancelled => "cancelled",
        }
    }

    /// Parses a state name produced by [`Self::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ReservationState::Active),
            "consumed" => Some(ReservationState::Consumed),
            "expired" => Some(ReservationState::Expired),
            "cancelled" => Some(ReservationState::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReservationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A time-bounded, all-or-nothing soft hold on a set of product quantities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub caller: CallerId,
    pub state: ReservationState,
    pub lines: Vec<LineSnapshot>,
    pub address: Address,
    pub shipping_method: ShippingMethod,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    /// True if the reservation can still be confirmed at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.state == ReservationState::Active && self.expires_at > now
    }

    /// Sum of `unit_price * quantity` over all lines.
    pub fn total(&self) -> Money {
        self.lines.iter().map(LineSnapshot::line_total).sum()
    }
}

/// The state of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    /// The order exists; the core never mutates it afterwards.
    #[default]
    Created,

    /// Cancelled outside the core (modeled, not reachable through the engine).
    Cancelled,
}

impl OrderState {
    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Created => "created",
            OrderState::Cancelled => "cancelled",
        }
    }

    /// Parses a state name produced by [`Self::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(OrderState::Created),
            "cancelled" => Some(OrderState::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An order produced by a successful confirm; immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub caller: CallerId,
    pub state: OrderState,
    /// Copied verbatim from the originating reservation.
    pub lines: Vec<LineSnapshot>,
    pub address: Address,
    pub shipping_method: ShippingMethod,
    /// Sum of `unit_price * quantity` over the lines, in minor units.
    pub total: Money,
    pub created_at: DateTime<Utc>,
}

/// The state of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyState {
    /// A confirm attempt holds the slot; retries with the same fingerprint may proceed.
    InProgress,

    /// The attempt committed; fingerprint and cached response are frozen.
    Succeeded,

    /// The attempt failed; a retry with the same fingerprint may proceed.
    Failed,
}

impl IdempotencyState {
    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyState::InProgress => "in_progress",
            IdempotencyState::Succeeded => "succeeded",
            IdempotencyState::Failed => "failed",
        }
    }

    /// Parses a state name produced by [`Self::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(IdempotencyState::InProgress),
            "succeeded" => Some(IdempotencyState::Succeeded),
            "failed" => Some(IdempotencyState::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for IdempotencyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One commit attempt, keyed by the unique `(caller, endpoint, key)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub caller: CallerId,
    pub endpoint: String,
    pub key: String,
    /// Hex-encoded hash of the canonicalized request payload.
    pub fingerprint: String,
    pub state: IdempotencyState,
    /// Cached success response, present once `state` is `Succeeded`.
    pub response: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only signal emitted when a confirm drops stock below a threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowStockSignal {
    pub id: Uuid,
    pub product_id: ProductId,
    pub stock_after: i64,
    pub threshold: i64,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

impl LowStockSignal {
    /// Creates an unprocessed signal for a product that just crossed its threshold.
    pub fn new(product_id: ProductId, stock_after: i64, threshold: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            product_id,
            stock_after,
            threshold,
            processed: false,
            created_at: Utc::now(),
        }
    }
}

/// Destination address snapshot carried on reservations and orders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub name: String,
    pub phone: String,
    pub line1: String,
    pub city: String,
    pub state: String,
    pub pincode: String,
}

/// Recognized shipping methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShippingMethod {
    Standard,
    Express,
}

impl ShippingMethod {
    /// Returns the method name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ShippingMethod::Standard => "standard",
            ShippingMethod::Express => "express",
        }
    }

    /// Parses a method name produced by [`Self::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(ShippingMethod::Standard),
            "express" => Some(ShippingMethod::Express),
            _ => None,
        }
    }
}

impl std::fmt::Display for ShippingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A requested line in a caller's cart; quantities are validated by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: ProductId,
    pub quantity: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn snapshot(price: i64, quantity: u32) -> LineSnapshot {
        LineSnapshot {
            product_id: ProductId::new(),
            sku: "SKU-001".to_string(),
            name: "Widget".to_string(),
            unit_price: Money::from_minor(price),
            quantity,
        }
    }

    #[test]
    fn available_is_stock_minus_reserved() {
        let product = Product {
            id: ProductId::new(),
            sku: "SKU-001".to_string(),
            name: "Widget".to_string(),
            unit_price: Money::from_minor(4999),
            stock: 50,
            reserved: 12,
            low_stock_threshold: 10,
            image: None,
        };
        assert_eq!(product.available(), 38);
    }

    #[test]
    fn reservation_total_sums_line_totals() {
        let now = Utc::now();
        let reservation = Reservation {
            id: ReservationId::new(),
            caller: CallerId::new("x"),
            state: ReservationState::Active,
            lines: vec![snapshot(4999, 2), snapshot(1500, 1)],
            address: test_address(),
            shipping_method: ShippingMethod::Standard,
            expires_at: now + Duration::minutes(10),
            created_at: now,
        };
        assert_eq!(reservation.total().minor(), 2 * 4999 + 1500);
    }

    #[test]
    fn reservation_validity_requires_active_and_unexpired() {
        let now = Utc::now();
        let mut reservation = Reservation {
            id: ReservationId::new(),
            caller: CallerId::new("x"),
            state: ReservationState::Active,
            lines: vec![snapshot(100, 1)],
            address: test_address(),
            shipping_method: ShippingMethod::Express,
            expires_at: now + Duration::minutes(10),
            created_at: now,
        };
        assert!(reservation.is_valid_at(now));

        reservation.state = ReservationState::Consumed;
        assert!(!reservation.is_valid_at(now));

        reservation.state = ReservationState::Active;
        reservation.expires_at = now - Duration::seconds(1);
        assert!(!reservation.is_valid_at(now));
    }

    #[test]
    fn only_active_is_non_terminal() {
        assert!(!ReservationState::Active.is_terminal());
        assert!(ReservationState::Consumed.is_terminal());
        assert!(ReservationState::Expired.is_terminal());
        assert!(ReservationState::Cancelled.is_terminal());
    }

    #[test]
    fn state_names_round_trip() {
        for state in [
            ReservationState::Active,
            ReservationState::Consumed,
            ReservationState::Expired,
            ReservationState::Cancelled,
        ] {
            assert_eq!(ReservationState::parse(state.as_str()), Some(state));
        }
        assert_eq!(ReservationState::parse("bogus"), None);

        for state in [
            IdempotencyState::InProgress,
            IdempotencyState::Succeeded,
            IdempotencyState::Failed,
        ] {
            assert_eq!(IdempotencyState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn shipping_method_serializes_lowercase() {
        let json = serde_json::to_string(&ShippingMethod::Express).unwrap();
        assert_eq!(json, "\"express\"");
        assert_eq!(ShippingMethod::parse("standard"), Some(ShippingMethod::Standard));
        assert_eq!(ShippingMethod::parse("overnight"), None);
    }

    fn test_address() -> Address {
        Address {
            name: "Asha Rao".to_string(),
            phone: "9999999999".to_string(),
            line1: "12 MG Road".to_string(),
            city: "Bengaluru".to_string(),
            state: "KA".to_string(),
            pincode: "560001".to_string(),
        }
    }
}
