use crate::adapters::traits::OrderStore;
use crate::domain::{Order, OrderStatus};
use crate::error::Result;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, instrument};

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    fn order_from_row(row: &PgRow) -> Result<Order> {
        let status: String = row.try_get("status")?;
        Ok(Order {
            order_id: row.try_get("order_id")?,
            user_id: row.try_get("user_id")?,
            product_id: row.try_get("product_id")?,
            quantity: row.try_get("quantity")?,
            status: OrderStatus::try_from(status.as_str())?,
            retry_count: row.try_get("retry_count")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl OrderStore for PostgresStore {
    #[instrument(skip(self, order), fields(order_id = %order.order_id))]
    async fn insert_order(&self, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (order_id, user_id, product_id, quantity, status, retry_count, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&order.order_id)
        .bind(&order.user_id)
        .bind(&order.product_id)
        .bind(order.quantity)
        .bind(order.status.as_str())
        .bind(order.retry_count)
        .bind(order.created_at)
        .execute(&self.pool)
        .await?;

        debug!("Inserted order");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_order(&self, order_id: &str) -> Result<Option<Order>> {
        let row = sqlx::query(
            r#"
            SELECT order_id, user_id, product_id, quantity, status, retry_count, created_at
            FROM orders WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::order_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn is_processed(&self, order_id: &str) -> Result<bool> {
        let found: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM processed_messages WHERE id = $1")
                .bind(order_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(found.is_some())
    }

    #[instrument(skip(self))]
    async fn mark_processing(&self, order_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders SET status = 'PROCESSING'
            WHERE order_id = $1 AND status IN ('PENDING', 'PROCESSING')
            "#,
        )
        .bind(order_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn complete_order(&self, order_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        // The primary key on processed_messages arbitrates concurrent completions.
        let inserted = sqlx::query(
            "INSERT INTO processed_messages (id) VALUES ($1) ON CONFLICT (id) DO NOTHING",
        )
        .bind(order_id)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            debug!("Ledger entry already present");
            return Ok(false);
        }

        let updated = sqlx::query(
            r#"
            UPDATE orders SET status = 'COMPLETED'
            WHERE order_id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(order_id)
        .execute(&mut *tx)
        .await?;

        // Settled elsewhere (e.g. FAILED by another consumer): no ledger row
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            debug!("Order no longer PROCESSING, completion dropped");
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn increment_retry(&self, order_id: &str, expected: i32) -> Result<Option<i32>> {
        let row = sqlx::query(
            r#"
            UPDATE orders SET retry_count = retry_count + 1
            WHERE order_id = $1 AND retry_count = $2
            RETURNING retry_count
            "#,
        )
        .bind(order_id)
        .bind(expected)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get("retry_count")))
    }

    #[instrument(skip(self))]
    async fn mark_failed(&self, order_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders SET status = 'FAILED'
            WHERE order_id = $1 AND status IN ('PENDING', 'PROCESSING')
            "#,
        )
        .bind(order_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}
