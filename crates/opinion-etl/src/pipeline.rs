//! One ETL run end to end, and the loop that repeats it.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use opinion_sources::{
    BackoffPolicy, CustomerMasterReader, ProductMasterReader, SocialCommentApiReader,
    SurveyCsvReader, WebReviewDbReader,
};
use opinion_store::{PgWarehouse, WarehouseStore};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::EtlConfig;
use crate::extract::{ExtractionMetrics, ExtractionOrchestrator, ExtractionStatus};
use crate::facts::{FactRebuildEngine, FactReport};
use crate::mapper::DimensionMapper;
use crate::upsert::{DimensionUpsertEngine, LoadResult};

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub extraction_status: ExtractionStatus,
    pub metrics: ExtractionMetrics,
    pub extraction_errors: Vec<String>,
    pub mapping_errors: Vec<String>,
    pub dimensions: LoadResult,
    /// `None` when the dimension load failed and facts were left untouched.
    pub facts: Option<FactReport>,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        self.extraction_errors.is_empty()
            && self.mapping_errors.is_empty()
            && self.dimensions.is_success()
            && self.facts.is_some()
    }
}

pub struct EtlPipeline {
    config: EtlConfig,
    orchestrator: ExtractionOrchestrator,
    mapper: DimensionMapper,
    upsert: DimensionUpsertEngine,
    facts: FactRebuildEngine,
}

impl EtlPipeline {
    pub fn new(
        config: EtlConfig,
        orchestrator: ExtractionOrchestrator,
        store: Arc<dyn WarehouseStore>,
    ) -> Self {
        Self {
            config,
            orchestrator,
            mapper: DimensionMapper::default(),
            upsert: DimensionUpsertEngine::new(Arc::clone(&store)),
            facts: FactRebuildEngine::new(store),
        }
    }

    /// Wires the file, database and API readers plus the Postgres warehouse
    /// described by `config`. Unset source URLs leave that branch out.
    pub async fn from_config(config: EtlConfig) -> Result<Self> {
        let mut orchestrator = ExtractionOrchestrator::new()
            .with_surveys(Arc::new(SurveyCsvReader::new(config.survey_csv.clone())))
            .with_product_master(Arc::new(ProductMasterReader::new(config.products_csv.clone())))
            .with_customer_master(Arc::new(CustomerMasterReader::new(
                config.customers_csv.clone(),
            )));

        if let Some(url) = &config.source_db_url {
            let reader = WebReviewDbReader::connect_lazy(url)
                .context("configuring web review database")?;
            orchestrator = orchestrator.with_web_reviews(Arc::new(reader));
        }
        if let Some(url) = &config.social_api_url {
            let reader = SocialCommentApiReader::new(
                url.clone(),
                config.api_timeout,
                BackoffPolicy::with_retries(config.api_retry_attempts),
                config.api_cache_ttl,
            )
            .context("building social comments client")?;
            orchestrator = orchestrator.with_social_comments(Arc::new(reader));
        }

        let warehouse = PgWarehouse::connect(&config.warehouse_url, config.batch_size)
            .await
            .context("connecting to warehouse")?;
        Ok(Self::new(config, orchestrator, Arc::new(warehouse)))
    }

    pub fn config(&self) -> &EtlConfig {
        &self.config
    }

    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("etl_run", %run_id);

        async move {
            let extraction = self
                .orchestrator
                .extract_all(cancel)
                .await
                .context("extracting sources")?;
            if extraction.status == ExtractionStatus::Error {
                bail!("extraction failed: {}", extraction.errors.join("; "));
            }

            let set = self.mapper.map(&extraction);
            for problem in &set.validation_errors {
                warn!(problem = %problem, "mapping validation error");
            }

            let dimensions = self
                .upsert
                .load_dimensions(&set, cancel)
                .await
                .context("loading dimensions")?;

            let facts = if dimensions.is_success() {
                Some(
                    self.facts
                        .rebuild_facts(&extraction, cancel)
                        .await
                        .context("rebuilding facts")?,
                )
            } else {
                warn!(errors = ?dimensions.errors, "dimension load failed, fact rebuild skipped");
                None
            };

            let summary = RunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                extraction_status: extraction.status,
                metrics: extraction.metrics,
                extraction_errors: extraction.errors,
                mapping_errors: set.validation_errors,
                dimensions,
                facts,
            };
            info!(
                status = summary.extraction_status.as_str(),
                records = summary.metrics.total_records(),
                facts = summary.facts.as_ref().map_or(0, |f| f.inserted),
                clean = summary.is_clean(),
                "etl run finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// Runs until `cancel` fires: the configured interval after a completed
    /// run, the failure backoff after an error or an invalid configuration.
    pub async fn run_scheduled(&self, cancel: &CancellationToken) -> Result<()> {
        info!(
            interval_secs = self.config.interval.as_secs(),
            backoff_secs = self.config.failure_backoff.as_secs(),
            "scheduler started"
        );
        while !cancel.is_cancelled() {
            let wait = match self.config.validate() {
                Err(err) => {
                    warn!(error = %err, "configuration invalid, backing off");
                    self.config.failure_backoff
                }
                Ok(()) => match self.run_once(cancel).await {
                    Ok(_) => self.config.interval,
                    Err(_) if cancel.is_cancelled() => break,
                    Err(err) => {
                        error!(error = %format!("{err:#}"), "etl run failed");
                        self.config.failure_backoff
                    }
                },
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!("scheduler stopped");
        Ok(())
    }
}
