//! Opinion ETL: extraction, dimension mapping, transactional dimension upsert
//! and fact rebuild, plus the interval loop that drives them.

use std::future::Future;

use opinion_store::StoreError;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

mod config;
mod extract;
mod facts;
mod mapper;
mod pipeline;
mod sentiment;
mod upsert;

pub use config::EtlConfig;
pub use extract::{ExtractionMetrics, ExtractionOrchestrator, ExtractionResult, ExtractionStatus};
pub use facts::{FactRebuildEngine, FactReport};
pub use mapper::{
    is_generic_category, merge_customer_group, select_product, DimensionMapper, DimensionSet,
    Origin, ProductObservation,
};
pub use pipeline::{EtlPipeline, RunSummary};
pub use sentiment::{keyword_label, SentimentClassifier, SentimentScore};
pub use upsert::{DimensionCounts, DimensionUpsertEngine, LoadResult};

pub const CRATE_NAME: &str = "opinion-etl";

#[derive(Debug, Error)]
pub enum EtlError {
    #[error("run cancelled")]
    Cancelled,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Races a warehouse call against the run's cancellation token.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, EtlError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EtlError::Cancelled),
        result = fut => result.map_err(EtlError::from),
    }
}
