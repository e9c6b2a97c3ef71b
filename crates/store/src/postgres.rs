//! PostgreSQL backend.
//!
//! Every guarded primitive is one conditional `UPDATE .. WHERE guard`
//! statement; `rows_affected` decides whether the guard held. The follow-up
//! read on the failure path only fills in the error payload, it is never
//! part of the update itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CallerId, Money, OrderId, ProductId, ReservationId};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::model::{
    Address, CartLine, IdempotencyRecord, IdempotencyState, LowStockSignal, Order, OrderState,
    Product, Reservation, ReservationState, ShippingMethod,
};
use crate::store::{
    CartStore, CommitOutcome, IdempotencyStore, InventoryStore, LowStockStore, OrderStore,
    ReservationStore, SlotOutcome, StockLevels,
};

/// PostgreSQL-backed implementation of all checkout stores.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new store on an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations, creating tables and indexes.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_product(row: PgRow) -> Result<Product> {
        Ok(Product {
            id: ProductId::from_uuid(row.try_get::<Uuid, _>("id")?),
            sku: row.try_get("sku")?,
            name: row.try_get("name")?,
            unit_price: Money::from_minor(row.try_get("unit_price")?),
            stock: row.try_get("stock")?,
            reserved: row.try_get("reserved")?,
            low_stock_threshold: row.try_get("low_stock_threshold")?,
            image: row.try_get("image")?,
        })
    }

    fn row_to_reservation(row: PgRow) -> Result<Reservation> {
        let state: String = row.try_get("state")?;
        let shipping: String = row.try_get("shipping_method")?;
        Ok(Reservation {
            id: ReservationId::from_uuid(row.try_get::<Uuid, _>("id")?),
            caller: CallerId::new(row.try_get::<String, _>("caller")?),
            state: parse_enum(&state)?,
            lines: serde_json::from_value(row.try_get("lines")?)?,
            address: serde_json::from_value(row.try_get("address")?)?,
            shipping_method: parse_enum(&shipping)?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_order(row: PgRow) -> Result<Order> {
        let state: String = row.try_get("state")?;
        let shipping: String = row.try_get("shipping_method")?;
        Ok(Order {
            id: OrderId::from_uuid(row.try_get::<Uuid, _>("id")?),
            caller: CallerId::new(row.try_get::<String, _>("caller")?),
            state: parse_enum::<OrderState>(&state)?,
            lines: serde_json::from_value(row.try_get("lines")?)?,
            address: serde_json::from_value(row.try_get("address")?)?,
            shipping_method: parse_enum(&shipping)?,
            total: Money::from_minor(row.try_get("total")?),
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_idempotency(row: PgRow) -> Result<IdempotencyRecord> {
        let state: String = row.try_get("state")?;
        Ok(IdempotencyRecord {
            caller: CallerId::new(row.try_get::<String, _>("caller")?),
            endpoint: row.try_get("endpoint")?,
            key: row.try_get("key")?,
            fingerprint: row.try_get("fingerprint")?,
            state: parse_enum(&state)?,
            response: row.try_get("response")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_signal(row: PgRow) -> Result<LowStockSignal> {
        Ok(LowStockSignal {
            id: row.try_get("id")?,
            product_id: ProductId::from_uuid(row.try_get::<Uuid, _>("product_id")?),
            stock_after: row.try_get("stock_after")?,
            threshold: row.try_get("threshold")?,
            processed: row.try_get("processed")?,
            created_at: row.try_get("created_at")?,
        })
    }

    /// Builds the error for a guarded product update that matched no rows:
    /// `NotFound` when the product is absent, `Insufficient` otherwise.
    async fn guard_failure(&self, id: ProductId, requested: i64) -> StoreError {
        match self.stock_levels(id).await {
            Ok(levels) => StoreError::Insufficient {
                product_id: id,
                requested,
                available: levels.available,
            },
            Err(err) => err,
        }
    }
}

/// Parses a lowercase enum name the way its serde representation does.
fn parse_enum<T: serde::de::DeserializeOwned>(s: &str) -> Result<T> {
    Ok(serde_json::from_value(serde_json::Value::String(
        s.to_string(),
    ))?)
}

#[async_trait]
impl InventoryStore for PostgresStore {
    async fn insert_product(&self, product: Product) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO products (id, sku, name, unit_price, stock, reserved, low_stock_threshold, image)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(product.id.as_uuid())
        .bind(&product.sku)
        .bind(&product.name)
        .bind(product.unit_price.minor())
        .bind(product.stock)
        .bind(product.reserved)
        .bind(product.low_stock_threshold)
        .bind(&product.image)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("products_sku_key")
            {
                return StoreError::Conflict(format!("sku {} already exists", product.sku));
            }
            StoreError::Database(e)
        })?;
        Ok(())
    }

    async fn get_product(&self, id: ProductId) -> Result<Option<Product>> {
        let row = sqlx::query(
            r#"
            SELECT id, sku, name, unit_price, stock, reserved, low_stock_threshold, image
            FROM products
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_product).transpose()
    }

    async fn stock_levels(&self, id: ProductId) -> Result<StockLevels> {
        let row = sqlx::query("SELECT stock, reserved FROM products WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("product {id}")))?;

        let stock: i64 = row.try_get("stock")?;
        let reserved: i64 = row.try_get("reserved")?;
        Ok(StockLevels {
            stock,
            reserved,
            available: stock - reserved,
        })
    }

    async fn try_increment_reserved(&self, id: ProductId, n: u32) -> Result<()> {
        let n = i64::from(n);
        let result = sqlx::query(
            r#"
            UPDATE products
            SET reserved = reserved + $2
            WHERE id = $1 AND stock - reserved >= $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(n)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.guard_failure(id, n).await);
        }
        Ok(())
    }

    async fn try_commit(&self, id: ProductId, n: u32) -> Result<CommitOutcome> {
        let n = i64::from(n);
        let row = sqlx::query(
            r#"
            UPDATE products
            SET stock = stock - $2, reserved = reserved - $2
            WHERE id = $1 AND reserved >= $2 AND stock >= $2
            RETURNING stock, low_stock_threshold
            "#,
        )
        .bind(id.as_uuid())
        .bind(n)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(CommitOutcome {
                stock_after: row.try_get("stock")?,
                low_stock_threshold: row.try_get("low_stock_threshold")?,
            }),
            None => Err(self.guard_failure(id, n).await),
        }
    }

    async fn release_reserved(&self, id: ProductId, n: u32) -> Result<()> {
        let n = i64::from(n);
        let result = sqlx::query(
            r#"
            UPDATE products
            SET reserved = reserved - $2
            WHERE id = $1 AND reserved >= $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(n)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.guard_failure(id, n).await);
        }
        Ok(())
    }

    async fn restore_committed(&self, id: ProductId, n: u32) -> Result<()> {
        let n = i64::from(n);
        let result = sqlx::query(
            r#"
            UPDATE products
            SET stock = stock + $2, reserved = reserved + $2
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(n)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("product {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ReservationStore for PostgresStore {
    async fn insert_reservation(&self, reservation: Reservation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reservations (id, caller, state, lines, address, shipping_method, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(reservation.id.as_uuid())
        .bind(reservation.caller.as_str())
        .bind(reservation.state.as_str())
        .bind(serde_json::to_value(&reservation.lines)?)
        .bind(serde_json::to_value(&reservation.address)?)
        .bind(reservation.shipping_method.as_str())
        .bind(reservation.expires_at)
        .bind(reservation.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_reservation(&self, id: ReservationId) -> Result<Option<Reservation>> {
        let row = sqlx::query(
            r#"
            SELECT id, caller, state, lines, address, shipping_method, expires_at, created_at
            FROM reservations
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_reservation).transpose()
    }

    async fn transition_reservation(
        &self,
        id: ReservationId,
        from: ReservationState,
        to: ReservationState,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE reservations SET state = $3 WHERE id = $1 AND state = $2")
            .bind(id.as_uuid())
            .bind(from.as_str())
            .bind(to.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Reservation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, caller, state, lines, address, shipping_method, expires_at, created_at
            FROM reservations
            WHERE state = 'active' AND expires_at <= $1
            ORDER BY expires_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_reservation).collect()
    }
}

#[async_trait]
impl IdempotencyStore for PostgresStore {
    async fn reserve_slot(
        &self,
        caller: &CallerId,
        endpoint: &str,
        key: &str,
        fingerprint: &str,
    ) -> Result<SlotOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_records (caller, endpoint, key, fingerprint, state, response, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'in_progress', NULL, NOW(), NOW())
            ON CONFLICT (caller, endpoint, key) DO NOTHING
            "#,
        )
        .bind(caller.as_str())
        .bind(endpoint)
        .bind(key)
        .bind(fingerprint)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(SlotOutcome::Inserted);
        }

        let row = sqlx::query(
            r#"
            SELECT caller, endpoint, key, fingerprint, state, response, created_at, updated_at
            FROM idempotency_records
            WHERE caller = $1 AND endpoint = $2 AND key = $3
            "#,
        )
        .bind(caller.as_str())
        .bind(endpoint)
        .bind(key)
        .fetch_one(&self.pool)
        .await?;

        Ok(SlotOutcome::Existing(Self::row_to_idempotency(row)?))
    }

    async fn finish_slot(
        &self,
        caller: &CallerId,
        endpoint: &str,
        key: &str,
        state: IdempotencyState,
        response: Option<serde_json::Value>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET state = $4, response = $5, updated_at = NOW()
            WHERE caller = $1 AND endpoint = $2 AND key = $3 AND state <> 'succeeded'
            "#,
        )
        .bind(caller.as_str())
        .bind(endpoint)
        .bind(key)
        .bind(state.as_str())
        .bind(response)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Either the record is absent or it is frozen in `succeeded`.
            let exists = sqlx::query(
                "SELECT 1 FROM idempotency_records WHERE caller = $1 AND endpoint = $2 AND key = $3",
            )
            .bind(caller.as_str())
            .bind(endpoint)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
            if exists.is_none() {
                return Err(StoreError::NotFound(format!("idempotency record {key}")));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl OrderStore for PostgresStore {
    async fn insert_order(&self, order: Order) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (id, caller, state, lines, address, shipping_method, total, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(order.caller.as_str())
        .bind(order.state.as_str())
        .bind(serde_json::to_value(&order.lines)?)
        .bind(serde_json::to_value(&order.address)?)
        .bind(order.shipping_method.as_str())
        .bind(order.total.minor())
        .bind(order.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(
            r#"
            SELECT id, caller, state, lines, address, shipping_method, total, created_at
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_order).transpose()
    }
}

#[async_trait]
impl CartStore for PostgresStore {
    async fn cart_lines(&self, caller: &CallerId) -> Result<Vec<CartLine>> {
        let row = sqlx::query("SELECT lines FROM carts WHERE caller = $1")
            .bind(caller.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(serde_json::from_value(row.try_get("lines")?)?),
            None => Ok(Vec::new()),
        }
    }

    async fn replace_cart(&self, caller: &CallerId, lines: Vec<CartLine>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO carts (caller, lines, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (caller) DO UPDATE SET lines = $2, updated_at = NOW()
            "#,
        )
        .bind(caller.as_str())
        .bind(serde_json::to_value(&lines)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_cart(&self, caller: &CallerId) -> Result<()> {
        sqlx::query("DELETE FROM carts WHERE caller = $1")
            .bind(caller.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LowStockStore for PostgresStore {
    async fn insert_signal(&self, signal: LowStockSignal) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO low_stock_signals (id, product_id, stock_after, threshold, processed, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(signal.id)
        .bind(signal.product_id.as_uuid())
        .bind(signal.stock_after)
        .bind(signal.threshold)
        .bind(signal.processed)
        .bind(signal.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unprocessed_signals(&self) -> Result<Vec<LowStockSignal>> {
        let rows = sqlx::query(
            r#"
            SELECT id, product_id, stock_after, threshold, processed, created_at
            FROM low_stock_signals
            WHERE processed = FALSE
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_signal).collect()
    }
}
