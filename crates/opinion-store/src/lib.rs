//! Star-schema warehouse contracts plus in-memory and Postgres backends.
//!
//! The ETL stages only see [`WarehouseStore`] and [`WarehouseTx`]; every
//! dimension read/write of one load goes through a single transaction so the
//! caller observes either the whole dimension set or the pre-run state.

use async_trait::async_trait;
use opinion_core::{
    DimCustomer, DimDate, DimProduct, DimSentiment, DimSource, FactOpinion, Keyed,
};
use thiserror::Error;

mod memory;
mod postgres;
mod schema;

pub use memory::{FailPoint, MemoryWarehouse, WarehouseSnapshot};
pub use postgres::PgWarehouse;
pub use schema::SCHEMA;

pub const CRATE_NAME: &str = "opinion-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("duplicate natural key in {table}: {key}")]
    Duplicate { table: &'static str, key: String },
    #[error("{table} has no row with key {key}")]
    NotFound { table: &'static str, key: i32 },
    #[error("fact references missing {dimension} key {key}")]
    MissingReference { dimension: &'static str, key: i32 },
    #[error("injected failure at {0:?}")]
    Injected(FailPoint),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Entry point to the warehouse. All reads and writes happen inside [`WarehouseTx`].
#[async_trait]
pub trait WarehouseStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn WarehouseTx>>;
}

/// One open warehouse transaction. Dropping it without `commit` discards all
/// of its writes.
#[async_trait]
pub trait WarehouseTx: Send {
    async fn load_customers(&mut self) -> Result<Vec<Keyed<DimCustomer>>>;
    async fn insert_customers(&mut self, rows: &[DimCustomer]) -> Result<()>;
    async fn update_customers(&mut self, rows: &[Keyed<DimCustomer>]) -> Result<()>;

    async fn load_products(&mut self) -> Result<Vec<Keyed<DimProduct>>>;
    async fn insert_products(&mut self, rows: &[DimProduct]) -> Result<()>;
    async fn update_products(&mut self, rows: &[Keyed<DimProduct>]) -> Result<()>;

    async fn load_sources(&mut self) -> Result<Vec<Keyed<DimSource>>>;
    async fn insert_sources(&mut self, rows: &[DimSource]) -> Result<()>;
    async fn update_sources(&mut self, rows: &[Keyed<DimSource>]) -> Result<()>;

    async fn load_sentiments(&mut self) -> Result<Vec<Keyed<DimSentiment>>>;
    async fn insert_sentiments(&mut self, rows: &[DimSentiment]) -> Result<()>;
    async fn update_sentiments(&mut self, rows: &[Keyed<DimSentiment>]) -> Result<()>;

    /// Calendar rows carry their own `YYYYMMDD` key.
    async fn load_dates(&mut self) -> Result<Vec<DimDate>>;
    async fn insert_dates(&mut self, rows: &[DimDate]) -> Result<()>;
    async fn update_dates(&mut self, rows: &[DimDate]) -> Result<()>;

    /// Fast path for clearing the fact table. A refused truncate leaves the
    /// transaction usable so the caller can fall back to [`Self::delete_all_facts`].
    async fn truncate_facts(&mut self) -> Result<()>;

    /// Row-by-row fallback when truncation is refused. Returns deleted rows.
    async fn delete_all_facts(&mut self) -> Result<u64>;

    async fn insert_facts(&mut self, rows: &[FactOpinion]) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}
