use async_trait::async_trait;
use common::OrderId;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};

use crate::error::{Result, SagaError};
use crate::instance::{Failures, LineItem, SagaInstance};
use crate::state::Position;
use crate::store::{PaymentRecord, RecordStatus, SagaStore, SideEffects, StepTransaction};

/// PostgreSQL-backed saga store.
///
/// Step transactions run at SERIALIZABLE isolation and lock the saga row
/// with `SELECT ... FOR UPDATE`. The `sagas_change_feed` trigger publishes
/// every saga row change to the `saga_events` outbox in the same
/// transaction.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations (stream tables included).
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_saga(row: PgRow) -> Result<SagaInstance> {
        let step: String = row.try_get("step")?;
        let status: String = row.try_get("status")?;
        let position = parse_position(step, status)?;
        let Json(products): Json<Vec<LineItem>> = row.try_get("products")?;
        let Json(failures): Json<Failures> = row.try_get("failures")?;

        Ok(SagaInstance {
            order_id: OrderId::from_uuid(row.try_get("order_id")?),
            payment: row.try_get("payment")?,
            products,
            step: position.step,
            status: position.status,
            failures,
        })
    }
}

fn parse_position(step: String, status: String) -> Result<Position> {
    Position::from_names(&step, &status).ok_or(SagaError::InvalidState { step, status })
}

fn parse_record_status(name: &str) -> Result<RecordStatus> {
    RecordStatus::from_name(name)
        .ok_or_else(|| SagaError::StoreRejected(format!("unknown record status {name:?}")))
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    type Tx = PostgresStepTransaction;

    async fn begin(&self) -> Result<Self::Tx> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        Ok(PostgresStepTransaction { tx })
    }

    async fn insert_saga(&self, saga: &SagaInstance) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sagas (order_id, payment, products, failures, step, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(saga.order_id.as_uuid())
        .bind(saga.payment)
        .bind(Json(&saga.products))
        .bind(Json(saga.failures))
        .bind(saga.step.as_str())
        .bind(saga.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.code().as_deref() == Some("23505")
            {
                return SagaError::AlreadyExists(saga.order_id);
            }
            SagaError::Store(e)
        })?;

        Ok(())
    }

    async fn get_saga(&self, order_id: OrderId) -> Result<Option<SagaInstance>> {
        let row = sqlx::query(
            r#"
            SELECT order_id, payment, products, failures, step, status
            FROM sagas
            WHERE order_id = $1
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_saga).transpose()
    }

    async fn side_effects(&self, order_id: OrderId) -> Result<SideEffects> {
        let id = order_id.as_uuid();

        let order: Option<String> = sqlx::query_scalar("SELECT status FROM orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let payment = sqlx::query("SELECT amount, status FROM payments WHERE order_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| -> Result<PaymentRecord> {
                let status: String = row.try_get("status")?;
                Ok(PaymentRecord {
                    amount: row.try_get("amount")?,
                    status: parse_record_status(&status)?,
                })
            })
            .transpose()?;

        let reservations = sqlx::query(
            "SELECT product_id, quantity FROM reservations WHERE order_id = $1 ORDER BY product_id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| -> Result<LineItem> {
            Ok(LineItem {
                id: row.try_get("product_id")?,
                quantity: row.try_get("quantity")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

        let shipment: Option<String> =
            sqlx::query_scalar("SELECT status FROM shipments WHERE order_id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(SideEffects {
            order: order.as_deref().map(parse_record_status).transpose()?,
            payment,
            reservations,
            shipment: shipment.as_deref().map(parse_record_status).transpose()?,
        })
    }
}

/// A SERIALIZABLE PostgreSQL transaction. Rolled back on drop.
pub struct PostgresStepTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PostgresStepTransaction {
    async fn execute(&mut self, sql: &str, order_id: OrderId) -> Result<()> {
        sqlx::query(sql)
            .bind(order_id.as_uuid())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StepTransaction for PostgresStepTransaction {
    async fn lock_saga(&mut self, order_id: OrderId) -> Result<Option<Position>> {
        let row = sqlx::query("SELECT step, status FROM sagas WHERE order_id = $1 FOR UPDATE")
            .bind(order_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await?;

        match row {
            Some(row) => Ok(Some(parse_position(
                row.try_get("step")?,
                row.try_get("status")?,
            )?)),
            None => Ok(None),
        }
    }

    async fn update_saga(&mut self, order_id: OrderId, position: Position) -> Result<()> {
        let result = sqlx::query(
            "UPDATE sagas SET step = $2, status = $3, updated_at = now() WHERE order_id = $1",
        )
        .bind(order_id.as_uuid())
        .bind(position.step.as_str())
        .bind(position.status.as_str())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SagaError::SagaNotFound(order_id));
        }
        Ok(())
    }

    async fn insert_order(&mut self, order_id: OrderId) -> Result<()> {
        self.execute(
            "INSERT INTO orders (id) VALUES ($1) ON CONFLICT (id) DO NOTHING",
            order_id,
        )
        .await
    }

    async fn cancel_order(&mut self, order_id: OrderId) -> Result<()> {
        self.execute(
            "UPDATE orders SET status = 'cancelled' WHERE id = $1",
            order_id,
        )
        .await
    }

    async fn insert_payment(&mut self, order_id: OrderId, amount: f64) -> Result<()> {
        sqlx::query(
            "INSERT INTO payments (order_id, amount) VALUES ($1, $2) ON CONFLICT (order_id) DO NOTHING",
        )
        .bind(order_id.as_uuid())
        .bind(amount)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn cancel_payment(&mut self, order_id: OrderId) -> Result<()> {
        self.execute(
            "UPDATE payments SET status = 'cancelled' WHERE order_id = $1",
            order_id,
        )
        .await
    }

    async fn insert_reservation(&mut self, order_id: OrderId, item: &LineItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reservations (order_id, product_id, quantity)
            VALUES ($1, $2, $3)
            ON CONFLICT (order_id, product_id) DO NOTHING
            "#,
        )
        .bind(order_id.as_uuid())
        .bind(&item.id)
        .bind(item.quantity)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_reservations(&mut self, order_id: OrderId) -> Result<()> {
        self.execute("DELETE FROM reservations WHERE order_id = $1", order_id)
            .await
    }

    async fn insert_shipment(&mut self, order_id: OrderId) -> Result<()> {
        self.execute(
            "INSERT INTO shipments (order_id) VALUES ($1) ON CONFLICT (order_id) DO NOTHING",
            order_id,
        )
        .await
    }

    async fn cancel_shipment(&mut self, order_id: OrderId) -> Result<()> {
        self.execute(
            "UPDATE shipments SET status = 'cancelled' WHERE order_id = $1",
            order_id,
        )
        .await
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
