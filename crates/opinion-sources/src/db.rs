//! Web reviews read from the operational database view.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use opinion_core::WebReview;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::debug;

use crate::{SourceError, SourceReader};

/// View in the operational database that flattens reviews for the ETL.
pub const WEB_REVIEW_VIEW: &str = "vw_web_reviews_for_etl";

/// Reads every web review in one statement.
#[derive(Debug, Clone)]
pub struct WebReviewDbReader {
    pool: PgPool,
}

impl WebReviewDbReader {
    /// The pool connects on first use, so an unreachable database only fails
    /// the read, never construction.
    pub fn connect_lazy(url: &str) -> Result<Self, SourceError> {
        let pool = PgPoolOptions::new().max_connections(2).connect_lazy(url)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SourceReader<WebReview> for WebReviewDbReader {
    fn name(&self) -> &'static str {
        "Database"
    }

    async fn read_all(&self) -> Result<Vec<WebReview>, SourceError> {
        let sql = format!(
            r#"
            SELECT review_id::bigint        AS review_id,
                   customer_id::bigint      AS customer_id,
                   customer_name,
                   customer_email,
                   product_id::text         AS product_id,
                   product_name,
                   product_category,
                   review_date::timestamp   AS review_date,
                   COALESCE(comment, '')    AS comment,
                   rating::int              AS rating
              FROM {WEB_REVIEW_VIEW}
             ORDER BY review_id
            "#
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let date: NaiveDateTime = row.try_get("review_date")?;
            out.push(WebReview {
                review_id: row.try_get("review_id")?,
                customer_id: row.try_get("customer_id")?,
                customer_name: row.try_get("customer_name")?,
                customer_email: row.try_get("customer_email")?,
                product_id: row.try_get("product_id")?,
                product_name: row.try_get("product_name")?,
                product_category: row.try_get("product_category")?,
                date,
                comment: row.try_get("comment")?,
                rating: row.try_get("rating")?,
            });
        }
        debug!(records = out.len(), "web reviews read");
        Ok(out)
    }
}
