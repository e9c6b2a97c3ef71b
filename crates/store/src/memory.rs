//! In-memory backend.
//!
//! All collections live under a single `RwLock`; every conditional
//! primitive checks its guard and mutates inside one write-lock scope,
//! which is what makes it a single atomic update. This backend is both the
//! test substrate and the default runtime store when no database is
//! configured.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{CallerId, OrderId, ProductId, ReservationId};
use tokio::sync::RwLock;

use crate::error::{Result, StoreError};
use crate::model::{
    CartLine, IdempotencyRecord, IdempotencyState, LowStockSignal, Order, Product, Reservation,
    ReservationState,
};
use crate::store::{
    CartStore, CommitOutcome, IdempotencyStore, InventoryStore, LowStockStore, OrderStore,
    ReservationStore, SlotOutcome, StockLevels,
};

type IdempotencyKey = (CallerId, String, String);

#[derive(Default)]
struct State {
    products: HashMap<ProductId, Product>,
    reservations: HashMap<ReservationId, Reservation>,
    orders: HashMap<OrderId, Order>,
    idempotency: HashMap<IdempotencyKey, IdempotencyRecord>,
    carts: HashMap<CallerId, Vec<CartLine>>,
    signals: Vec<LowStockSignal>,
}

/// In-memory implementation of all checkout stores.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of orders in the store.
    pub async fn order_count(&self) -> usize {
        self.state.read().await.orders.len()
    }

    /// Returns all low-stock signals, in emission order.
    pub async fn signals(&self) -> Vec<LowStockSignal> {
        self.state.read().await.signals.clone()
    }

    /// Test hook: back-dates a reservation's expiry so the next sweep picks
    /// it up.
    pub async fn force_expire(&self, id: ReservationId) {
        let mut state = self.state.write().await;
        if let Some(reservation) = state.reservations.get_mut(&id) {
            reservation.expires_at = Utc::now() - Duration::seconds(1);
        }
    }

    /// Clears all collections.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        *state = State::default();
    }
}

#[async_trait]
impl InventoryStore for InMemoryStore {
    async fn insert_product(&self, product: Product) -> Result<()> {
        let mut state = self.state.write().await;
        if state.products.values().any(|p| p.sku == product.sku) {
            return Err(StoreError::Conflict(format!(
                "sku {} already exists",
                product.sku
            )));
        }
        state.products.insert(product.id, product);
        Ok(())
    }

    async fn get_product(&self, id: ProductId) -> Result<Option<Product>> {
        Ok(self.state.read().await.products.get(&id).cloned())
    }

    async fn stock_levels(&self, id: ProductId) -> Result<StockLevels> {
        let state = self.state.read().await;
        let product = state
            .products
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(format!("product {id}")))?;
        Ok(StockLevels {
            stock: product.stock,
            reserved: product.reserved,
            available: product.available(),
        })
    }

    async fn try_increment_reserved(&self, id: ProductId, n: u32) -> Result<()> {
        let n = i64::from(n);
        let mut state = self.state.write().await;
        let product = state
            .products
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("product {id}")))?;
        let available = product.available();
        if available < n {
            return Err(StoreError::Insufficient {
                product_id: id,
                requested: n,
                available,
            });
        }
        product.reserved += n;
        Ok(())
    }

    async fn try_commit(&self, id: ProductId, n: u32) -> Result<CommitOutcome> {
        let n = i64::from(n);
        let mut state = self.state.write().await;
        let product = state
            .products
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("product {id}")))?;
        if product.reserved < n || product.stock < n {
            return Err(StoreError::Insufficient {
                product_id: id,
                requested: n,
                available: product.reserved.min(product.stock),
            });
        }
        product.reserved -= n;
        product.stock -= n;
        Ok(CommitOutcome {
            stock_after: product.stock,
            low_stock_threshold: product.low_stock_threshold,
        })
    }

    async fn release_reserved(&self, id: ProductId, n: u32) -> Result<()> {
        let n = i64::from(n);
        let mut state = self.state.write().await;
        let product = state
            .products
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("product {id}")))?;
        if product.reserved < n {
            return Err(StoreError::Insufficient {
                product_id: id,
                requested: n,
                available: product.reserved,
            });
        }
        product.reserved -= n;
        Ok(())
    }

    async fn restore_committed(&self, id: ProductId, n: u32) -> Result<()> {
        let n = i64::from(n);
        let mut state = self.state.write().await;
        let product = state
            .products
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("product {id}")))?;
        product.stock += n;
        product.reserved += n;
        Ok(())
    }
}

#[async_trait]
impl ReservationStore for InMemoryStore {
    async fn insert_reservation(&self, reservation: Reservation) -> Result<()> {
        let mut state = self.state.write().await;
        state.reservations.insert(reservation.id, reservation);
        Ok(())
    }

    async fn get_reservation(&self, id: ReservationId) -> Result<Option<Reservation>> {
        Ok(self.state.read().await.reservations.get(&id).cloned())
    }

    async fn transition_reservation(
        &self,
        id: ReservationId,
        from: ReservationState,
        to: ReservationState,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.reservations.get_mut(&id) {
            Some(reservation) if reservation.state == from => {
                reservation.state = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Reservation>> {
        let state = self.state.read().await;
        let mut expired: Vec<Reservation> = state
            .reservations
            .values()
            .filter(|r| r.state == ReservationState::Active && r.expires_at <= now)
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.expires_at);
        expired.truncate(limit);
        Ok(expired)
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryStore {
    async fn reserve_slot(
        &self,
        caller: &CallerId,
        endpoint: &str,
        key: &str,
        fingerprint: &str,
    ) -> Result<SlotOutcome> {
        let mut state = self.state.write().await;
        let slot = (caller.clone(), endpoint.to_string(), key.to_string());
        if let Some(existing) = state.idempotency.get(&slot) {
            return Ok(SlotOutcome::Existing(existing.clone()));
        }
        let now = Utc::now();
        state.idempotency.insert(
            slot,
            IdempotencyRecord {
                caller: caller.clone(),
                endpoint: endpoint.to_string(),
                key: key.to_string(),
                fingerprint: fingerprint.to_string(),
                state: IdempotencyState::InProgress,
                response: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(SlotOutcome::Inserted)
    }

    async fn finish_slot(
        &self,
        caller: &CallerId,
        endpoint: &str,
        key: &str,
        new_state: IdempotencyState,
        response: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let slot = (caller.clone(), endpoint.to_string(), key.to_string());
        let record = state
            .idempotency
            .get_mut(&slot)
            .ok_or_else(|| StoreError::NotFound(format!("idempotency record {key}")))?;
        if record.state == IdempotencyState::Succeeded {
            return Ok(());
        }
        record.state = new_state;
        record.response = response;
        record.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl OrderStore for InMemoryStore {
    async fn insert_order(&self, order: Order) -> Result<()> {
        let mut state = self.state.write().await;
        state.orders.insert(order.id, order);
        Ok(())
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        Ok(self.state.read().await.orders.get(&id).cloned())
    }
}

#[async_trait]
impl CartStore for InMemoryStore {
    async fn cart_lines(&self, caller: &CallerId) -> Result<Vec<CartLine>> {
        Ok(self
            .state
            .read()
            .await
            .carts
            .get(caller)
            .cloned()
            .unwrap_or_default())
    }

    async fn replace_cart(&self, caller: &CallerId, lines: Vec<CartLine>) -> Result<()> {
        let mut state = self.state.write().await;
        state.carts.insert(caller.clone(), lines);
        Ok(())
    }

    async fn delete_cart(&self, caller: &CallerId) -> Result<()> {
        let mut state = self.state.write().await;
        state.carts.remove(caller);
        Ok(())
    }
}

#[async_trait]
impl LowStockStore for InMemoryStore {
    async fn insert_signal(&self, signal: LowStockSignal) -> Result<()> {
        let mut state = self.state.write().await;
        state.signals.push(signal);
        Ok(())
    }

    async fn unprocessed_signals(&self) -> Result<Vec<LowStockSignal>> {
        Ok(self
            .state
            .read()
            .await
            .signals
            .iter()
            .filter(|s| !s.processed)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Address, LineSnapshot, ShippingMethod};
    use common::Money;

    fn product(stock: i64, reserved: i64) -> Product {
        Product {
            id: ProductId::new(),
            sku: format!("SKU-{}", ProductId::new()),
            name: "Widget".to_string(),
            unit_price: Money::from_minor(4999),
            stock,
            reserved,
            low_stock_threshold: 10,
            image: None,
        }
    }

    fn reservation(caller: &str, expires_in_secs: i64) -> Reservation {
        let now = Utc::now();
        Reservation {
            id: ReservationId::new(),
            caller: CallerId::new(caller),
            state: ReservationState::Active,
            lines: vec![LineSnapshot {
                product_id: ProductId::new(),
                sku: "SKU-001".to_string(),
                name: "Widget".to_string(),
                unit_price: Money::from_minor(4999),
                quantity: 2,
            }],
            address: Address {
                name: "Asha Rao".to_string(),
                phone: "9999999999".to_string(),
                line1: "12 MG Road".to_string(),
                city: "Bengaluru".to_string(),
                state: "KA".to_string(),
                pincode: "560001".to_string(),
            },
            shipping_method: ShippingMethod::Standard,
            expires_at: now + Duration::seconds(expires_in_secs),
            created_at: now,
        }
    }

    #[tokio::test]
    async fn increment_reserved_respects_available() {
        let store = InMemoryStore::new();
        let p = product(8, 0);
        let id = p.id;
        store.insert_product(p).await.unwrap();

        store.try_increment_reserved(id, 5).await.unwrap();

        let err = store.try_increment_reserved(id, 5).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Insufficient {
                requested: 5,
                available: 3,
                ..
            }
        ));

        let levels = store.stock_levels(id).await.unwrap();
        assert_eq!(levels.reserved, 5);
        assert_eq!(levels.available, 3);
    }

    #[tokio::test]
    async fn commit_decrements_both_counters() {
        let store = InMemoryStore::new();
        let p = product(50, 2);
        let id = p.id;
        store.insert_product(p).await.unwrap();

        let outcome = store.try_commit(id, 2).await.unwrap();
        assert_eq!(outcome.stock_after, 48);
        assert_eq!(outcome.low_stock_threshold, 10);

        let levels = store.stock_levels(id).await.unwrap();
        assert_eq!(levels.stock, 48);
        assert_eq!(levels.reserved, 0);
    }

    #[tokio::test]
    async fn commit_requires_reserved_units() {
        let store = InMemoryStore::new();
        let p = product(50, 1);
        let id = p.id;
        store.insert_product(p).await.unwrap();

        let err = store.try_commit(id, 2).await.unwrap_err();
        assert!(matches!(err, StoreError::Insufficient { .. }));
    }

    #[tokio::test]
    async fn release_is_guarded() {
        let store = InMemoryStore::new();
        let p = product(50, 3);
        let id = p.id;
        store.insert_product(p).await.unwrap();

        store.release_reserved(id, 3).await.unwrap();
        let err = store.release_reserved(id, 1).await.unwrap_err();
        assert!(matches!(err, StoreError::Insufficient { .. }));
    }

    #[tokio::test]
    async fn restore_undoes_commit() {
        let store = InMemoryStore::new();
        let p = product(50, 2);
        let id = p.id;
        store.insert_product(p).await.unwrap();

        store.try_commit(id, 2).await.unwrap();
        store.restore_committed(id, 2).await.unwrap();

        let levels = store.stock_levels(id).await.unwrap();
        assert_eq!(levels.stock, 50);
        assert_eq!(levels.reserved, 2);
    }

    #[tokio::test]
    async fn unknown_product_is_not_found() {
        let store = InMemoryStore::new();
        let err = store
            .try_increment_reserved(ProductId::new(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn duplicate_sku_is_rejected() {
        let store = InMemoryStore::new();
        let mut a = product(1, 0);
        let mut b = product(1, 0);
        a.sku = "SKU-DUP".to_string();
        b.sku = "SKU-DUP".to_string();
        store.insert_product(a).await.unwrap();
        let err = store.insert_product(b).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn transition_matches_expected_state_only() {
        let store = InMemoryStore::new();
        let r = reservation("x", 600);
        let id = r.id;
        store.insert_reservation(r).await.unwrap();

        let won = store
            .transition_reservation(id, ReservationState::Active, ReservationState::Consumed)
            .await
            .unwrap();
        assert!(won);

        // Second transition out of Active loses.
        let won = store
            .transition_reservation(id, ReservationState::Active, ReservationState::Expired)
            .await
            .unwrap();
        assert!(!won);

        let stored = store.get_reservation(id).await.unwrap().unwrap();
        assert_eq!(stored.state, ReservationState::Consumed);
    }

    #[tokio::test]
    async fn find_expired_returns_only_overdue_active() {
        let store = InMemoryStore::new();
        let fresh = reservation("x", 600);
        let stale = reservation("y", -5);
        let stale_id = stale.id;
        store.insert_reservation(fresh).await.unwrap();
        store.insert_reservation(stale).await.unwrap();

        let expired = store.find_expired(Utc::now(), 10).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, stale_id);
    }

    #[tokio::test]
    async fn reserve_slot_is_insert_if_absent() {
        let store = InMemoryStore::new();
        let caller = CallerId::new("x");

        let first = store
            .reserve_slot(&caller, "confirm", "K1", "fp-1")
            .await
            .unwrap();
        assert_eq!(first, SlotOutcome::Inserted);

        let second = store
            .reserve_slot(&caller, "confirm", "K1", "fp-2")
            .await
            .unwrap();
        match second {
            SlotOutcome::Existing(record) => {
                // The stored fingerprint is the original one.
                assert_eq!(record.fingerprint, "fp-1");
                assert_eq!(record.state, IdempotencyState::InProgress);
            }
            SlotOutcome::Inserted => panic!("expected existing record"),
        }
    }

    #[tokio::test]
    async fn finish_slot_freezes_response() {
        let store = InMemoryStore::new();
        let caller = CallerId::new("x");
        store
            .reserve_slot(&caller, "confirm", "K1", "fp-1")
            .await
            .unwrap();

        let response = serde_json::json!({"orderId": "abc", "status": "created"});
        store
            .finish_slot(
                &caller,
                "confirm",
                "K1",
                IdempotencyState::Succeeded,
                Some(response.clone()),
            )
            .await
            .unwrap();

        // A slower failed attempt cannot clobber the frozen record.
        store
            .finish_slot(&caller, "confirm", "K1", IdempotencyState::Failed, None)
            .await
            .unwrap();

        match store
            .reserve_slot(&caller, "confirm", "K1", "fp-1")
            .await
            .unwrap()
        {
            SlotOutcome::Existing(record) => {
                assert_eq!(record.state, IdempotencyState::Succeeded);
                assert_eq!(record.response, Some(response));
            }
            SlotOutcome::Inserted => panic!("expected existing record"),
        }
    }

    #[tokio::test]
    async fn cart_replace_read_delete() {
        let store = InMemoryStore::new();
        let caller = CallerId::new("x");
        assert!(store.cart_lines(&caller).await.unwrap().is_empty());

        let lines = vec![CartLine {
            product_id: ProductId::new(),
            quantity: 2,
        }];
        store.replace_cart(&caller, lines.clone()).await.unwrap();
        assert_eq!(store.cart_lines(&caller).await.unwrap(), lines);

        store.delete_cart(&caller).await.unwrap();
        assert!(store.cart_lines(&caller).await.unwrap().is_empty());
        // Deleting again is fine.
        store.delete_cart(&caller).await.unwrap();
    }

    #[tokio::test]
    async fn signals_append_and_filter() {
        let store = InMemoryStore::new();
        let product_id = ProductId::new();
        store
            .insert_signal(LowStockSignal::new(product_id, 7, 10))
            .await
            .unwrap();

        let unprocessed = store.unprocessed_signals().await.unwrap();
        assert_eq!(unprocessed.len(), 1);
        assert_eq!(unprocessed[0].stock_after, 7);
        assert_eq!(unprocessed[0].threshold, 10);
        assert!(!unprocessed[0].processed);
    }
}
