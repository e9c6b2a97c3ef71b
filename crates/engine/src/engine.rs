//! Reserve → confirm orchestration over the checkout stores.
//!
//! Multi-line operations issue their guarded updates in ascending product
//! order and unwind already-applied lines in reverse when a later line
//! fails, so no partial hold or partial commit survives an abort. Mutual
//! exclusion between concurrent confirms, and between confirm and the
//! sweeper, rests entirely on the store's conditional updates and the
//! unique idempotency index; no locks are held across store calls.

use chrono::{DateTime, Duration, Utc};
use common::{CallerId, Money, OrderId, ProductId, ReservationId};
use serde::{Deserialize, Serialize};
use store::{
    Address, CartLine, CheckoutStore, CommitOutcome, IdempotencyState, LineSnapshot,
    LowStockSignal, Order, OrderState, Reservation, ReservationState, ShippingMethod, SlotOutcome,
};

use crate::error::{EngineError, Result};
use crate::validate;

/// Endpoint tag under which confirm attempts are idempotency-keyed.
const CONFIRM_ENDPOINT: &str = "confirm";

/// Tunables for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a reservation holds its units before the sweeper may
    /// reclaim them.
    pub hold_duration: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hold_duration: Duration::minutes(10),
        }
    }
}

/// Returned by a successful reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveReceipt {
    pub reservation_id: ReservationId,
    pub expires_at: DateTime<Utc>,
}

/// Returned by a successful confirm; also the shape cached on the
/// idempotency record, so a replay serves byte-identical content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmReceipt {
    pub order_id: OrderId,
    pub status: String,
}

/// A reservation read back with its current validity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationStatus {
    #[serde(flatten)]
    pub reservation: Reservation,
    pub is_valid: bool,
}

/// Enforces the two-phase reserve → confirm protocol.
pub struct ReservationEngine<S> {
    store: S,
    config: EngineConfig,
}

impl<S: CheckoutStore> ReservationEngine<S> {
    /// Creates an engine with the default ten-minute hold.
    pub fn new(store: S) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    /// Creates an engine with explicit tunables.
    pub fn with_config(store: S, config: EngineConfig) -> Self {
        Self { store, config }
    }

    /// Phase 1: places an all-or-nothing soft hold on the requested lines.
    ///
    /// Either every line's guarded increment succeeds and an `Active`
    /// reservation is written, or the holds taken so far are released and
    /// no reservation exists.
    #[tracing::instrument(skip(self, lines, address), fields(caller = %caller))]
    pub async fn reserve(
        &self,
        caller: &CallerId,
        lines: Vec<CartLine>,
        address: Address,
        shipping_method: ShippingMethod,
    ) -> Result<ReserveReceipt> {
        validate::validate_reserve(&lines, &address)?;

        let mut lines = lines;
        lines.sort_by_key(|l| l.product_id);

        // Snapshot SKU, name, and price before holding anything; a missing
        // product fails the whole request with no stock held.
        let mut snapshots = Vec::with_capacity(lines.len());
        for line in &lines {
            let product = self
                .store
                .get_product(line.product_id)
                .await?
                .ok_or(EngineError::UnknownProduct {
                    product_id: line.product_id,
                })?;
            snapshots.push(LineSnapshot {
                product_id: product.id,
                sku: product.sku,
                name: product.name,
                unit_price: product.unit_price,
                quantity: line.quantity,
            });
        }

        // Guarded holds in ascending product order; any failure unwinds the
        // holds taken so far.
        let mut held: Vec<(ProductId, u32)> = Vec::with_capacity(lines.len());
        for line in &lines {
            match self
                .store
                .try_increment_reserved(line.product_id, line.quantity)
                .await
            {
                Ok(()) => held.push((line.product_id, line.quantity)),
                Err(err) => {
                    self.release_lines(&held).await;
                    metrics::counter!("reserve_rejected_total").increment(1);
                    return Err(err.into());
                }
            }
        }

        let now = Utc::now();
        let reservation = Reservation {
            id: ReservationId::new(),
            caller: caller.clone(),
            state: ReservationState::Active,
            lines: snapshots,
            address,
            shipping_method,
            expires_at: now + self.config.hold_duration,
            created_at: now,
        };
        let receipt = ReserveReceipt {
            reservation_id: reservation.id,
            expires_at: reservation.expires_at,
        };

        if let Err(err) = self.store.insert_reservation(reservation).await {
            self.release_lines(&held).await;
            return Err(err.into());
        }

        metrics::counter!("reserve_total").increment(1);
        tracing::info!(
            reservation_id = %receipt.reservation_id,
            expires_at = %receipt.expires_at,
            "reservation created"
        );
        Ok(receipt)
    }

    /// Phase 2: turns an active reservation into an order, exactly once per
    /// `(caller, endpoint, key)`.
    ///
    /// `fingerprint` is the canonical hash of the request payload (see
    /// [`crate::fingerprint`]); a key reused with a different fingerprint
    /// is rejected, a replay of a completed confirm returns the cached
    /// receipt without touching any state.
    #[tracing::instrument(skip(self, fingerprint), fields(caller = %caller, %reservation_id))]
    pub async fn confirm(
        &self,
        caller: &CallerId,
        reservation_id: ReservationId,
        idempotency_key: &str,
        fingerprint: &str,
    ) -> Result<ConfirmReceipt> {
        match self
            .store
            .reserve_slot(caller, CONFIRM_ENDPOINT, idempotency_key, fingerprint)
            .await?
        {
            SlotOutcome::Existing(record) => {
                if record.fingerprint != fingerprint {
                    metrics::counter!("confirm_key_mismatch_total").increment(1);
                    return Err(EngineError::IdempotencyMismatch);
                }
                if record.state == IdempotencyState::Succeeded {
                    let cached = record.response.ok_or_else(|| {
                        EngineError::Internal(format!(
                            "idempotency record {idempotency_key} succeeded without a cached response"
                        ))
                    })?;
                    let receipt: ConfirmReceipt = serde_json::from_value(cached).map_err(|err| {
                        EngineError::Internal(format!("cached confirm response is unreadable: {err}"))
                    })?;
                    metrics::counter!("confirm_replayed_total").increment(1);
                    tracing::info!(order_id = %receipt.order_id, "confirm replayed from cache");
                    return Ok(receipt);
                }
                // InProgress or Failed with a matching fingerprint: a retry
                // of the same request. The conditional state transition
                // below keeps the commit at-most-once.
            }
            SlotOutcome::Inserted => {}
        }

        match self.confirm_held(caller, reservation_id).await {
            Ok(receipt) => {
                match serde_json::to_value(&receipt) {
                    // The order exists; failing to cache the response must
                    // not fail the request.
                    Ok(response) => {
                        if let Err(err) = self
                            .store
                            .finish_slot(
                                caller,
                                CONFIRM_ENDPOINT,
                                idempotency_key,
                                IdempotencyState::Succeeded,
                                Some(response),
                            )
                            .await
                        {
                            tracing::error!(
                                key = idempotency_key,
                                error = %err,
                                "failed to record confirm success"
                            );
                        }
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "confirm receipt failed to serialize");
                    }
                }
                metrics::counter!("confirm_total").increment(1);
                Ok(receipt)
            }
            Err(err) => {
                // Best-effort failure marker; never masks the original error.
                if let Err(finish_err) = self
                    .store
                    .finish_slot(
                        caller,
                        CONFIRM_ENDPOINT,
                        idempotency_key,
                        IdempotencyState::Failed,
                        None,
                    )
                    .await
                {
                    tracing::warn!(
                        key = idempotency_key,
                        error = %finish_err,
                        "failed to record confirm failure"
                    );
                }
                Err(err)
            }
        }
    }

    /// Reads a reservation back with its current validity.
    ///
    /// A reservation belonging to another caller is indistinguishable from
    /// an absent one.
    #[tracing::instrument(skip(self), fields(caller = %caller))]
    pub async fn get_reservation(
        &self,
        caller: &CallerId,
        id: ReservationId,
    ) -> Result<ReservationStatus> {
        let reservation = self
            .store
            .get_reservation(id)
            .await?
            .filter(|r| r.caller == *caller)
            .ok_or_else(|| EngineError::NotFound(format!("reservation {id}")))?;
        let is_valid = reservation.is_valid_at(Utc::now());
        Ok(ReservationStatus {
            reservation,
            is_valid,
        })
    }

    /// The commit body: runs once the caller holds the idempotency slot.
    async fn confirm_held(
        &self,
        caller: &CallerId,
        reservation_id: ReservationId,
    ) -> Result<ConfirmReceipt> {
        let reservation = self
            .store
            .get_reservation(reservation_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("reservation {reservation_id}")))?;

        if reservation.caller != *caller {
            return Err(EngineError::Forbidden(format!(
                "reservation {reservation_id} belongs to another caller"
            )));
        }
        if reservation.state != ReservationState::Active {
            return Err(EngineError::Gone(format!(
                "reservation {reservation_id} is {}",
                reservation.state
            )));
        }
        let now = Utc::now();
        if reservation.expires_at <= now {
            return Err(EngineError::Gone(format!(
                "reservation {reservation_id} expired at {}",
                reservation.expires_at
            )));
        }

        // Claiming the Active → Consumed transition is the linearization
        // point against both the sweeper and a concurrent confirm under a
        // different key; the loser sees zero matched records.
        let claimed = self
            .store
            .transition_reservation(
                reservation_id,
                ReservationState::Active,
                ReservationState::Consumed,
            )
            .await?;
        if !claimed {
            return Err(EngineError::Gone(format!(
                "reservation {reservation_id} left the active state during confirm"
            )));
        }

        // Permanent decrements in ascending product order. A guard failure
        // here is exceptional: the reserve phase already held the units.
        let mut ordered: Vec<(ProductId, u32)> = reservation
            .lines
            .iter()
            .map(|l| (l.product_id, l.quantity))
            .collect();
        ordered.sort_by_key(|(id, _)| *id);

        let mut committed: Vec<(ProductId, u32, CommitOutcome)> =
            Vec::with_capacity(ordered.len());
        for (product_id, quantity) in &ordered {
            match self.store.try_commit(*product_id, *quantity).await {
                Ok(outcome) => committed.push((*product_id, *quantity, outcome)),
                Err(err) => {
                    self.abort_confirm(reservation_id, &committed).await;
                    return Err(err.into());
                }
            }
        }

        let total: Money = reservation.total();
        let order = Order {
            id: OrderId::new(),
            caller: caller.clone(),
            state: OrderState::Created,
            lines: reservation.lines.clone(),
            address: reservation.address.clone(),
            shipping_method: reservation.shipping_method,
            total,
            created_at: now,
        };
        let order_id = order.id;

        if let Err(err) = self.store.insert_order(order).await {
            self.abort_confirm(reservation_id, &committed).await;
            return Err(err.into());
        }

        // The order is committed. Cart cleanup and signal emission are
        // bookkeeping; failures are logged, not surfaced.
        if let Err(err) = self.store.delete_cart(caller).await {
            tracing::warn!(caller = %caller, error = %err, "failed to delete cart after confirm");
        }

        for (product_id, _, outcome) in &committed {
            if outcome.stock_after < outcome.low_stock_threshold {
                let signal = LowStockSignal::new(
                    *product_id,
                    outcome.stock_after,
                    outcome.low_stock_threshold,
                );
                if let Err(err) = self.store.insert_signal(signal).await {
                    tracing::warn!(%product_id, error = %err, "failed to emit low-stock signal");
                } else {
                    tracing::info!(
                        %product_id,
                        stock_after = outcome.stock_after,
                        threshold = outcome.low_stock_threshold,
                        "low stock signal emitted"
                    );
                }
            }
        }

        tracing::info!(%order_id, %reservation_id, total = total.minor(), "order created");
        Ok(ConfirmReceipt {
            order_id,
            status: "created".to_string(),
        })
    }

    /// Unwinds a confirm that failed after claiming the reservation:
    /// restores committed lines in reverse order, then puts the
    /// reservation back into `Active` so its hold can expire normally.
    async fn abort_confirm(
        &self,
        reservation_id: ReservationId,
        committed: &[(ProductId, u32, CommitOutcome)],
    ) {
        for (product_id, quantity, _) in committed.iter().rev() {
            if let Err(err) = self.store.restore_committed(*product_id, *quantity).await {
                tracing::error!(
                    %product_id,
                    quantity,
                    error = %err,
                    "failed to restore committed units during confirm abort"
                );
            }
        }
        match self
            .store
            .transition_reservation(
                reservation_id,
                ReservationState::Consumed,
                ReservationState::Active,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::error!(
                %reservation_id,
                "reservation left the consumed state during confirm abort"
            ),
            Err(err) => tracing::error!(
                %reservation_id,
                error = %err,
                "failed to reactivate reservation during confirm abort"
            ),
        }
    }

    /// Releases held lines in reverse order after a failed reserve.
    async fn release_lines(&self, held: &[(ProductId, u32)]) {
        for (product_id, quantity) in held.iter().rev() {
            if let Err(err) = self.store.release_reserved(*product_id, *quantity).await {
                tracing::error!(
                    %product_id,
                    quantity,
                    error = %err,
                    "failed to release held units during reserve abort"
                );
            }
        }
    }
}
