//! Postgres implementation of the warehouse traits over the star schema.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use opinion_core::{
    DimCustomer, DimDate, DimProduct, DimSentiment, DimSource, FactOpinion, Keyed,
};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, info, warn};

use crate::{Result, StoreError, WarehouseStore, WarehouseTx, SCHEMA};

/// Warehouse backed by the Postgres star schema in [`SCHEMA`].
#[derive(Clone)]
pub struct PgWarehouse {
    pool: PgPool,
    batch_size: usize,
}

impl PgWarehouse {
    pub async fn connect(url: &str, batch_size: usize) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(4).connect(url).await?;
        Ok(Self::from_pool(pool, batch_size))
    }

    pub fn from_pool(pool: PgPool, batch_size: usize) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("warehouse schema applied");
        Ok(())
    }
}

#[async_trait]
impl WarehouseStore for PgWarehouse {
    async fn begin(&self) -> Result<Box<dyn WarehouseTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx {
            tx,
            batch_size: self.batch_size,
        }))
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
    batch_size: usize,
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or_default()
}

#[async_trait]
impl WarehouseTx for PgTx {
    async fn load_customers(&mut self) -> Result<Vec<Keyed<DimCustomer>>> {
        let rows = sqlx::query(
            r#"
            SELECT customer_key, customer_id, name, email
              FROM dim_customer
             ORDER BY customer_key
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Keyed {
                key: row.try_get("customer_key")?,
                row: DimCustomer {
                    customer_id: row.try_get("customer_id")?,
                    name: row.try_get("name")?,
                    email: row.try_get("email")?,
                },
            });
        }
        Ok(out)
    }

    async fn insert_customers(&mut self, rows: &[DimCustomer]) -> Result<()> {
        for chunk in rows.chunks(self.batch_size) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO dim_customer (customer_id, name, email) ");
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.customer_id.clone())
                    .push_bind(row.name.clone())
                    .push_bind(row.email.clone());
            });
            qb.build().execute(&mut *self.tx).await?;
        }
        debug!(rows = rows.len(), "inserted customers");
        Ok(())
    }

    async fn update_customers(&mut self, rows: &[Keyed<DimCustomer>]) -> Result<()> {
        for keyed in rows {
            let done = sqlx::query(
                r#"
                UPDATE dim_customer
                   SET customer_id = $2, name = $3, email = $4
                 WHERE customer_key = $1
                "#,
            )
            .bind(keyed.key)
            .bind(&keyed.row.customer_id)
            .bind(&keyed.row.name)
            .bind(&keyed.row.email)
            .execute(&mut *self.tx)
            .await?;
            ensure_updated(done.rows_affected(), "dim_customer", keyed.key)?;
        }
        Ok(())
    }

    async fn load_products(&mut self) -> Result<Vec<Keyed<DimProduct>>> {
        let rows = sqlx::query(
            r#"
            SELECT product_key, product_id, name, category, subcategory
              FROM dim_product
             ORDER BY product_key
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Keyed {
                key: row.try_get("product_key")?,
                row: DimProduct {
                    product_id: row.try_get("product_id")?,
                    name: row.try_get("name")?,
                    category: row.try_get("category")?,
                    subcategory: row.try_get("subcategory")?,
                },
            });
        }
        Ok(out)
    }

    async fn insert_products(&mut self, rows: &[DimProduct]) -> Result<()> {
        for chunk in rows.chunks(self.batch_size) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO dim_product (product_id, name, category, subcategory) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.product_id.clone())
                    .push_bind(row.name.clone())
                    .push_bind(row.category.clone())
                    .push_bind(row.subcategory.clone());
            });
            qb.build().execute(&mut *self.tx).await?;
        }
        debug!(rows = rows.len(), "inserted products");
        Ok(())
    }

    async fn update_products(&mut self, rows: &[Keyed<DimProduct>]) -> Result<()> {
        for keyed in rows {
            let done = sqlx::query(
                r#"
                UPDATE dim_product
                   SET product_id = $2, name = $3, category = $4, subcategory = $5
                 WHERE product_key = $1
                "#,
            )
            .bind(keyed.key)
            .bind(&keyed.row.product_id)
            .bind(&keyed.row.name)
            .bind(&keyed.row.category)
            .bind(&keyed.row.subcategory)
            .execute(&mut *self.tx)
            .await?;
            ensure_updated(done.rows_affected(), "dim_product", keyed.key)?;
        }
        Ok(())
    }

    async fn load_sources(&mut self) -> Result<Vec<Keyed<DimSource>>> {
        let rows = sqlx::query(
            r#"
            SELECT source_key, source_id, name, kind, loaded_at
              FROM dim_source
             ORDER BY source_key
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let loaded_at: Option<DateTime<Utc>> = row.try_get("loaded_at")?;
            out.push(Keyed {
                key: row.try_get("source_key")?,
                row: DimSource {
                    source_id: row.try_get("source_id")?,
                    name: row.try_get("name")?,
                    kind: row.try_get("kind")?,
                    loaded_at,
                },
            });
        }
        Ok(out)
    }

    async fn insert_sources(&mut self, rows: &[DimSource]) -> Result<()> {
        for chunk in rows.chunks(self.batch_size) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO dim_source (source_id, name, kind, loaded_at) ");
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.source_id.clone())
                    .push_bind(row.name.clone())
                    .push_bind(row.kind.clone())
                    .push_bind(row.loaded_at);
            });
            qb.build().execute(&mut *self.tx).await?;
        }
        Ok(())
    }

    async fn update_sources(&mut self, rows: &[Keyed<DimSource>]) -> Result<()> {
        for keyed in rows {
            let done = sqlx::query(
                r#"
                UPDATE dim_source
                   SET source_id = $2, name = $3, kind = $4, loaded_at = $5
                 WHERE source_key = $1
                "#,
            )
            .bind(keyed.key)
            .bind(&keyed.row.source_id)
            .bind(&keyed.row.name)
            .bind(&keyed.row.kind)
            .bind(keyed.row.loaded_at)
            .execute(&mut *self.tx)
            .await?;
            ensure_updated(done.rows_affected(), "dim_source", keyed.key)?;
        }
        Ok(())
    }

    async fn load_sentiments(&mut self) -> Result<Vec<Keyed<DimSentiment>>> {
        let rows = sqlx::query(
            r#"
            SELECT sentiment_key, label, description, weight
              FROM dim_sentiment
             ORDER BY sentiment_key
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Keyed {
                key: row.try_get("sentiment_key")?,
                row: DimSentiment {
                    label: row.try_get("label")?,
                    description: row.try_get("description")?,
                    weight: row.try_get("weight")?,
                },
            });
        }
        Ok(out)
    }

    async fn insert_sentiments(&mut self, rows: &[DimSentiment]) -> Result<()> {
        for chunk in rows.chunks(self.batch_size) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO dim_sentiment (label, description, weight) ");
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.label.clone())
                    .push_bind(row.description.clone())
                    .push_bind(row.weight);
            });
            qb.build().execute(&mut *self.tx).await?;
        }
        Ok(())
    }

    async fn update_sentiments(&mut self, rows: &[Keyed<DimSentiment>]) -> Result<()> {
        for keyed in rows {
            let done = sqlx::query(
                r#"
                UPDATE dim_sentiment
                   SET label = $2, description = $3, weight = $4
                 WHERE sentiment_key = $1
                "#,
            )
            .bind(keyed.key)
            .bind(&keyed.row.label)
            .bind(&keyed.row.description)
            .bind(keyed.row.weight)
            .execute(&mut *self.tx)
            .await?;
            ensure_updated(done.rows_affected(), "dim_sentiment", keyed.key)?;
        }
        Ok(())
    }

    async fn load_dates(&mut self) -> Result<Vec<DimDate>> {
        let rows = sqlx::query(
            r#"
            SELECT date_key, full_date, year, quarter, month, month_name, iso_week, day
              FROM dim_date
             ORDER BY date_key
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let date: NaiveDate = row.try_get("full_date")?;
            out.push(DimDate {
                date_key: row.try_get("date_key")?,
                date,
                year: row.try_get("year")?,
                quarter: to_u32(row.try_get("quarter")?),
                month: to_u32(row.try_get("month")?),
                month_name: row.try_get("month_name")?,
                iso_week: to_u32(row.try_get("iso_week")?),
                day: to_u32(row.try_get("day")?),
            });
        }
        Ok(out)
    }

    async fn insert_dates(&mut self, rows: &[DimDate]) -> Result<()> {
        for chunk in rows.chunks(self.batch_size) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO dim_date (date_key, full_date, year, quarter, month, month_name, iso_week, day) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.date_key)
                    .push_bind(row.date)
                    .push_bind(row.year)
                    .push_bind(to_i32(row.quarter))
                    .push_bind(to_i32(row.month))
                    .push_bind(row.month_name.clone())
                    .push_bind(to_i32(row.iso_week))
                    .push_bind(to_i32(row.day));
            });
            qb.build().execute(&mut *self.tx).await?;
        }
        Ok(())
    }

    async fn update_dates(&mut self, rows: &[DimDate]) -> Result<()> {
        for row in rows {
            let done = sqlx::query(
                r#"
                UPDATE dim_date
                   SET full_date = $2, year = $3, quarter = $4, month = $5,
                       month_name = $6, iso_week = $7, day = $8
                 WHERE date_key = $1
                "#,
            )
            .bind(row.date_key)
            .bind(row.date)
            .bind(row.year)
            .bind(to_i32(row.quarter))
            .bind(to_i32(row.month))
            .bind(&row.month_name)
            .bind(to_i32(row.iso_week))
            .bind(to_i32(row.day))
            .execute(&mut *self.tx)
            .await?;
            ensure_updated(done.rows_affected(), "dim_date", row.date_key)?;
        }
        Ok(())
    }

    async fn truncate_facts(&mut self) -> Result<()> {
        // A failed statement aborts the whole transaction unless it ran
        // under a savepoint.
        sqlx::query("SAVEPOINT fact_truncate")
            .execute(&mut *self.tx)
            .await?;
        match sqlx::query("TRUNCATE TABLE fact_opinion")
            .execute(&mut *self.tx)
            .await
        {
            Ok(_) => {
                sqlx::query("RELEASE SAVEPOINT fact_truncate")
                    .execute(&mut *self.tx)
                    .await?;
                Ok(())
            }
            Err(err) => {
                sqlx::query("ROLLBACK TO SAVEPOINT fact_truncate")
                    .execute(&mut *self.tx)
                    .await?;
                Err(err.into())
            }
        }
    }

    async fn delete_all_facts(&mut self) -> Result<u64> {
        let done = sqlx::query("DELETE FROM fact_opinion")
            .execute(&mut *self.tx)
            .await?;
        Ok(done.rows_affected())
    }

    async fn insert_facts(&mut self, rows: &[FactOpinion]) -> Result<u64> {
        let mut inserted = 0;
        for chunk in rows.chunks(self.batch_size) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO fact_opinion (customer_key, product_key, source_key, sentiment_key, date_key, rating) ",
            );
            qb.push_values(chunk, |mut b, fact| {
                let rating: Decimal = fact.rating.round_dp(2);
                b.push_bind(fact.customer_key)
                    .push_bind(fact.product_key)
                    .push_bind(fact.source_key)
                    .push_bind(fact.sentiment_key)
                    .push_bind(fact.date_key)
                    .push_bind(rating);
            });
            inserted += qb.build().execute(&mut *self.tx).await?.rows_affected();
        }
        debug!(rows = inserted, "inserted facts");
        Ok(inserted)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        if let Err(err) = self.tx.rollback().await {
            warn!(error = %err, "warehouse rollback failed");
            return Err(err.into());
        }
        Ok(())
    }
}

fn ensure_updated(affected: u64, table: &'static str, key: i32) -> Result<()> {
    if affected == 0 {
        return Err(StoreError::NotFound { table, key });
    }
    Ok(())
}
