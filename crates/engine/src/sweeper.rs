//! Background task that expires stale reservations and returns their held
//! units to the free pool.

use std::time::Duration;

use chrono::Utc;
use store::{CheckoutStore, ReservationState};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::Result;

/// Tunables for the sweeper.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Cadence between cycles.
    pub interval: Duration,
    /// Maximum reservations examined per cycle.
    pub batch_limit: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_limit: 100,
        }
    }
}

/// Per-cycle counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Overdue reservations the scan returned.
    pub examined: u64,
    /// Reservations transitioned to `Expired` this cycle.
    pub expired: u64,
    /// Units returned to the free pool.
    pub released_units: u64,
    /// Release failures logged and skipped.
    pub errors: u64,
}

/// Moves stale active reservations to `Expired` and releases their units.
///
/// At most one cycle runs at a time; an invocation that finds a cycle in
/// flight returns immediately.
pub struct Sweeper<S> {
    store: S,
    config: SweeperConfig,
    cycle_lock: Mutex<()>,
}

impl<S: CheckoutStore + 'static> Sweeper<S> {
    /// Creates a sweeper over the given store.
    pub fn new(store: S, config: SweeperConfig) -> Self {
        Self {
            store,
            config,
            cycle_lock: Mutex::new(()),
        }
    }

    /// Runs one sweep cycle.
    ///
    /// Returns `None` without doing anything when another cycle is already
    /// in flight.
    #[tracing::instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<Option<SweepStats>> {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            return Ok(None);
        };

        let now = Utc::now();
        let overdue = self.store.find_expired(now, self.config.batch_limit).await?;

        let mut stats = SweepStats::default();
        for reservation in overdue {
            stats.examined += 1;

            // Claim the transition first; if a confirm won in the meantime
            // the update matches zero records and the reservation is
            // silently skipped.
            match self
                .store
                .transition_reservation(
                    reservation.id,
                    ReservationState::Active,
                    ReservationState::Expired,
                )
                .await
            {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    stats.errors += 1;
                    tracing::warn!(
                        reservation_id = %reservation.id,
                        error = %err,
                        "failed to expire reservation"
                    );
                    continue;
                }
            }

            let mut lines: Vec<_> = reservation
                .lines
                .iter()
                .map(|l| (l.product_id, l.quantity))
                .collect();
            lines.sort_by_key(|(id, _)| *id);

            for (product_id, quantity) in lines {
                match self.store.release_reserved(product_id, quantity).await {
                    Ok(()) => stats.released_units += u64::from(quantity),
                    // A failed guard here implies a prior partial release;
                    // log and keep going.
                    Err(err) => {
                        stats.errors += 1;
                        tracing::warn!(
                            reservation_id = %reservation.id,
                            %product_id,
                            quantity,
                            error = %err,
                            "failed to release units for expired reservation"
                        );
                    }
                }
            }

            stats.expired += 1;
        }

        metrics::counter!("sweeper_cycles_total").increment(1);
        metrics::counter!("sweeper_expired_total").increment(stats.expired);
        metrics::counter!("sweeper_released_units_total").increment(stats.released_units);
        metrics::counter!("sweeper_errors_total").increment(stats.errors);

        if stats.examined > 0 {
            tracing::info!(
                expired = stats.expired,
                released_units = stats.released_units,
                errors = stats.errors,
                "sweep cycle complete"
            );
        }

        Ok(Some(stats))
    }

    /// Spawns the sweeper's background task.
    ///
    /// The first cycle runs immediately; subsequent cycles run on the
    /// configured interval. The returned handle cancels the next tick and
    /// waits for any in-flight cycle on shutdown.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = self.config.interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.run_cycle().await {
                            tracing::error!(error = %err, "sweep cycle failed");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            tracing::info!("expiry sweeper stopped");
        });

        SweeperHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle to a spawned sweeper task.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Cancels the next scheduled cycle and waits for any in-flight cycle
    /// to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            tracing::error!(error = %err, "sweeper task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use common::{CallerId, Money, ProductId, ReservationId};
    use store::{
        Address, InMemoryStore, InventoryStore, LineSnapshot, Product, Reservation,
        ReservationStore, ShippingMethod,
    };

    async fn seed_product(store: &InMemoryStore, stock: i64, reserved: i64) -> ProductId {
        let product = Product {
            id: ProductId::new(),
            sku: format!("SKU-{}", ProductId::new()),
            name: "Widget".to_string(),
            unit_price: Money::from_minor(4999),
            stock,
            reserved,
            low_stock_threshold: 0,
            image: None,
        };
        let id = product.id;
        store.insert_product(product).await.unwrap();
        id
    }

    async fn seed_reservation(
        store: &InMemoryStore,
        product_id: ProductId,
        quantity: u32,
        expires_in_secs: i64,
    ) -> ReservationId {
        let now = Utc::now();
        let reservation = Reservation {
            id: ReservationId::new(),
            caller: CallerId::new("x"),
            state: ReservationState::Active,
            lines: vec![LineSnapshot {
                product_id,
                sku: "SKU-001".to_string(),
                name: "Widget".to_string(),
                unit_price: Money::from_minor(4999),
                quantity,
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
            expires_at: now + ChronoDuration::seconds(expires_in_secs),
            created_at: now,
        };
        let id = reservation.id;
        store.insert_reservation(reservation).await.unwrap();
        id
    }

    #[tokio::test]
    async fn cycle_expires_overdue_holds_and_releases_units() {
        let store = InMemoryStore::new();
        let product = seed_product(&store, 20, 3).await;
        let reservation = seed_reservation(&store, product, 3, -5).await;

        let sweeper = Sweeper::new(store.clone(), SweeperConfig::default());
        let stats = sweeper.run_cycle().await.unwrap().unwrap();

        assert_eq!(stats.expired, 1);
        assert_eq!(stats.released_units, 3);
        assert_eq!(stats.errors, 0);

        let stored = store.get_reservation(reservation).await.unwrap().unwrap();
        assert_eq!(stored.state, ReservationState::Expired);
        assert_eq!(store.stock_levels(product).await.unwrap().reserved, 0);
    }

    #[tokio::test]
    async fn cycle_leaves_fresh_holds_alone() {
        let store = InMemoryStore::new();
        let product = seed_product(&store, 20, 2).await;
        let reservation = seed_reservation(&store, product, 2, 600).await;

        let sweeper = Sweeper::new(store.clone(), SweeperConfig::default());
        let stats = sweeper.run_cycle().await.unwrap().unwrap();

        assert_eq!(stats.examined, 0);
        let stored = store.get_reservation(reservation).await.unwrap().unwrap();
        assert_eq!(stored.state, ReservationState::Active);
        assert_eq!(store.stock_levels(product).await.unwrap().reserved, 2);
    }

    #[tokio::test]
    async fn cycle_skips_reservations_a_confirm_already_won() {
        let store = InMemoryStore::new();
        let product = seed_product(&store, 20, 0).await;
        let reservation = seed_reservation(&store, product, 2, -5).await;

        // A confirm claimed the reservation between the scan and the sweep.
        store
            .transition_reservation(
                reservation,
                ReservationState::Active,
                ReservationState::Consumed,
            )
            .await
            .unwrap();

        let sweeper = Sweeper::new(store.clone(), SweeperConfig::default());
        let stats = sweeper.run_cycle().await.unwrap().unwrap();

        // The scan no longer sees it, and nothing is released.
        assert_eq!(stats.examined, 0);
        assert_eq!(stats.expired, 0);
        assert_eq!(stats.released_units, 0);

        let stored = store.get_reservation(reservation).await.unwrap().unwrap();
        assert_eq!(stored.state, ReservationState::Consumed);
    }

    #[tokio::test]
    async fn release_guard_failure_is_logged_and_skipped() {
        let store = InMemoryStore::new();
        // Reserved counter is short one unit relative to the hold.
        let product = seed_product(&store, 20, 1).await;
        seed_reservation(&store, product, 2, -5).await;

        let sweeper = Sweeper::new(store.clone(), SweeperConfig::default());
        let stats = sweeper.run_cycle().await.unwrap().unwrap();

        assert_eq!(stats.expired, 1);
        assert_eq!(stats.released_units, 0);
        assert_eq!(stats.errors, 1);
    }

    #[tokio::test]
    async fn batch_limit_caps_a_cycle() {
        let store = InMemoryStore::new();
        let product = seed_product(&store, 20, 4).await;
        for _ in 0..4 {
            seed_reservation(&store, product, 1, -5).await;
        }

        let config = SweeperConfig {
            batch_limit: 2,
            ..SweeperConfig::default()
        };
        let sweeper = Sweeper::new(store.clone(), config);

        let first = sweeper.run_cycle().await.unwrap().unwrap();
        assert_eq!(first.expired, 2);

        let second = sweeper.run_cycle().await.unwrap().unwrap();
        assert_eq!(second.expired, 2);

        assert_eq!(store.stock_levels(product).await.unwrap().reserved, 0);
    }

    #[tokio::test]
    async fn spawned_sweeper_runs_startup_cycle_and_shuts_down() {
        let store = InMemoryStore::new();
        let product = seed_product(&store, 20, 2).await;
        let reservation = seed_reservation(&store, product, 2, -5).await;

        let config = SweeperConfig {
            interval: Duration::from_secs(3600),
            ..SweeperConfig::default()
        };
        let handle = Sweeper::new(store.clone(), config).spawn();

        // The startup cycle fires without waiting for the interval.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stored = store.get_reservation(reservation).await.unwrap().unwrap();
        assert_eq!(stored.state, ReservationState::Expired);

        handle.shutdown().await;
    }
}
