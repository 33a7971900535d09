//! Concurrent extraction from every configured source into one
//! [`ExtractionResult`], with per-source timings and error strings.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use opinion_core::{CustomerMaster, ProductMaster, SocialComment, SurveyRecord, WebReview};
use opinion_sources::SourceReader;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::EtlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExtractionStatus {
    Success,
    Warning,
    Error,
}

impl ExtractionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtractionStatus::Success => "Success",
            ExtractionStatus::Warning => "Warning",
            ExtractionStatus::Error => "Error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionMetrics {
    pub csv_records: usize,
    pub database_records: usize,
    pub api_records: usize,
    pub product_master_records: usize,
    pub customer_master_records: usize,
    pub csv_elapsed: Duration,
    pub database_elapsed: Duration,
    pub api_elapsed: Duration,
    pub total_elapsed: Duration,
    /// Transactional sources that returned at least one record.
    pub extracted_sources: Vec<String>,
    pub per_source: Vec<(String, usize)>,
    pub api_calls: u64,
    pub extracted_at: DateTime<Utc>,
}

impl Default for ExtractionMetrics {
    fn default() -> Self {
        Self {
            csv_records: 0,
            database_records: 0,
            api_records: 0,
            product_master_records: 0,
            customer_master_records: 0,
            csv_elapsed: Duration::ZERO,
            database_elapsed: Duration::ZERO,
            api_elapsed: Duration::ZERO,
            total_elapsed: Duration::ZERO,
            extracted_sources: Vec::new(),
            per_source: Vec::new(),
            api_calls: 0,
            extracted_at: Utc::now(),
        }
    }
}

impl ExtractionMetrics {
    /// Survey + web + social records. Master data is reference input, not opinions.
    pub fn total_records(&self) -> usize {
        self.csv_records + self.database_records + self.api_records
    }

    pub fn records_per_second(&self) -> f64 {
        let secs = self.total_elapsed.as_secs_f64();
        if secs > 0.0 {
            self.total_records() as f64 / secs
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionResult {
    pub surveys: Vec<SurveyRecord>,
    pub web_reviews: Vec<WebReview>,
    pub social_comments: Vec<SocialComment>,
    pub product_masters: Vec<ProductMaster>,
    pub customer_masters: Vec<CustomerMaster>,
    pub metrics: ExtractionMetrics,
    pub status: ExtractionStatus,
    pub errors: Vec<String>,
}

impl ExtractionResult {
    pub fn empty(status: ExtractionStatus) -> Self {
        Self {
            surveys: Vec::new(),
            web_reviews: Vec::new(),
            social_comments: Vec::new(),
            product_masters: Vec::new(),
            customer_masters: Vec::new(),
            metrics: ExtractionMetrics::default(),
            status,
            errors: Vec::new(),
        }
    }
}

/// Outcome of one guarded extraction branch.
struct Branch<T> {
    records: Vec<T>,
    elapsed: Duration,
    error: Option<String>,
}

impl<T> Branch<T> {
    fn skipped() -> Self {
        Self {
            records: Vec::new(),
            elapsed: Duration::ZERO,
            error: None,
        }
    }
}

async fn read_guarded<T: Send + 'static>(
    reader: Option<&Arc<dyn SourceReader<T>>>,
    cancel: &CancellationToken,
) -> Result<Branch<T>, EtlError> {
    let Some(reader) = reader else {
        return Ok(Branch::skipped());
    };
    let name = reader.name();
    let started = Instant::now();
    let span = info_span!("extract", source = name);
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(EtlError::Cancelled),
        outcome = reader.read_all().instrument(span) => outcome,
    };
    let elapsed = started.elapsed();
    Ok(match outcome {
        Ok(records) => {
            info!(source = name, records = records.len(), elapsed_ms = elapsed.as_millis() as u64, "source extracted");
            Branch {
                records,
                elapsed,
                error: None,
            }
        }
        Err(err) => {
            warn!(source = name, error = %err, "source failed, continuing without it");
            Branch {
                records: Vec::new(),
                elapsed,
                error: Some(format!("{name}: {err}")),
            }
        }
    })
}

/// Runs every configured reader concurrently and folds the results into one
/// [`ExtractionResult`]. A failing reader costs only its own records.
#[derive(Default, Clone)]
pub struct ExtractionOrchestrator {
    surveys: Option<Arc<dyn SourceReader<SurveyRecord>>>,
    web_reviews: Option<Arc<dyn SourceReader<WebReview>>>,
    social_comments: Option<Arc<dyn SourceReader<SocialComment>>>,
    product_master: Option<Arc<dyn SourceReader<ProductMaster>>>,
    customer_master: Option<Arc<dyn SourceReader<CustomerMaster>>>,
}

impl ExtractionOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_surveys(mut self, reader: Arc<dyn SourceReader<SurveyRecord>>) -> Self {
        self.surveys = Some(reader);
        self
    }

    pub fn with_web_reviews(mut self, reader: Arc<dyn SourceReader<WebReview>>) -> Self {
        self.web_reviews = Some(reader);
        self
    }

    pub fn with_social_comments(mut self, reader: Arc<dyn SourceReader<SocialComment>>) -> Self {
        self.social_comments = Some(reader);
        self
    }

    pub fn with_product_master(mut self, reader: Arc<dyn SourceReader<ProductMaster>>) -> Self {
        self.product_master = Some(reader);
        self
    }

    pub fn with_customer_master(mut self, reader: Arc<dyn SourceReader<CustomerMaster>>) -> Self {
        self.customer_master = Some(reader);
        self
    }

    fn has_transactional_reader(&self) -> bool {
        self.surveys.is_some() || self.web_reviews.is_some() || self.social_comments.is_some()
    }

    /// Returns once every branch has finished. Only cancellation is an `Err`.
    pub async fn extract_all(&self, cancel: &CancellationToken) -> Result<ExtractionResult, EtlError> {
        if !self.has_transactional_reader() {
            warn!("no source reader configured");
            let mut result = ExtractionResult::empty(ExtractionStatus::Error);
            result.errors.push("no source reader configured".to_string());
            return Ok(result);
        }

        let started = Instant::now();
        let api_calls_before = self
            .social_comments
            .as_ref()
            .map_or(0, |r| r.remote_calls());

        let (surveys, web, social, products, customers) = tokio::join!(
            read_guarded(self.surveys.as_ref(), cancel),
            read_guarded(self.web_reviews.as_ref(), cancel),
            read_guarded(self.social_comments.as_ref(), cancel),
            read_guarded(self.product_master.as_ref(), cancel),
            read_guarded(self.customer_master.as_ref(), cancel),
        );
        let (surveys, web, social, products, customers) =
            (surveys?, web?, social?, products?, customers?);

        let mut errors = Vec::new();
        errors.extend(surveys.error);
        errors.extend(web.error);
        errors.extend(social.error);
        errors.extend(products.error);
        errors.extend(customers.error);

        let mut metrics = ExtractionMetrics {
            csv_records: surveys.records.len(),
            database_records: web.records.len(),
            api_records: social.records.len(),
            product_master_records: products.records.len(),
            customer_master_records: customers.records.len(),
            csv_elapsed: surveys.elapsed,
            database_elapsed: web.elapsed,
            api_elapsed: social.elapsed,
            total_elapsed: started.elapsed(),
            api_calls: self
                .social_comments
                .as_ref()
                .map_or(0, |r| r.remote_calls())
                .saturating_sub(api_calls_before),
            ..ExtractionMetrics::default()
        };
        metrics.per_source = vec![
            ("CSV".to_string(), metrics.csv_records),
            ("Database".to_string(), metrics.database_records),
            ("API".to_string(), metrics.api_records),
            ("ProductosMaestros".to_string(), metrics.product_master_records),
            ("ClientesMaestros".to_string(), metrics.customer_master_records),
        ];
        metrics.extracted_sources = metrics.per_source[..3]
            .iter()
            .filter(|(_, count)| *count > 0)
            .map(|(name, _)| name.clone())
            .collect();

        let status = if metrics.extracted_sources.is_empty() {
            warn!(errors = errors.len(), "extraction finished without records from any source");
            ExtractionStatus::Warning
        } else {
            info!(
                records = metrics.total_records(),
                sources = %metrics.extracted_sources.join(", "),
                elapsed_ms = metrics.total_elapsed.as_millis() as u64,
                "extraction finished"
            );
            ExtractionStatus::Success
        };

        Ok(ExtractionResult {
            surveys: surveys.records,
            web_reviews: web.records,
            social_comments: social.records,
            product_masters: products.records,
            customer_masters: customers.records,
            metrics,
            status,
            errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use opinion_sources::SourceError;

    struct Fixed<T>(Vec<T>);

    #[async_trait]
    impl<T: Clone + Send + Sync + 'static> SourceReader<T> for Fixed<T> {
        fn name(&self) -> &'static str {
            "Fixed"
        }

        async fn read_all(&self) -> Result<Vec<T>, SourceError> {
            Ok(self.0.clone())
        }
    }

    struct Failing(&'static str);

    #[async_trait]
    impl<T: Send + 'static> SourceReader<T> for Failing {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn read_all(&self) -> Result<Vec<T>, SourceError> {
            Err(SourceError::Message("connection refused".to_string()))
        }
    }

    struct Stuck;

    #[async_trait]
    impl<T: Send + 'static> SourceReader<T> for Stuck {
        fn name(&self) -> &'static str {
            "Stuck"
        }

        async fn read_all(&self) -> Result<Vec<T>, SourceError> {
            std::future::pending::<Result<Vec<T>, SourceError>>().await
        }
    }

    fn survey() -> SurveyRecord {
        SurveyRecord {
            opinion_id: 1,
            customer_id: 10,
            product_id: "42".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 3, 7).unwrap(),
            comment: "ok".to_string(),
            classification: "Positivo".to_string(),
            satisfaction: Some(5),
            channel: "Web".to_string(),
        }
    }

    fn review() -> WebReview {
        WebReview {
            review_id: 1,
            customer_id: Some(10),
            customer_name: None,
            customer_email: None,
            product_id: "42".to_string(),
            product_name: None,
            product_category: None,
            date: NaiveDate::from_ymd_opt(2024, 3, 7).unwrap().and_hms_opt(9, 0, 0).unwrap(),
            comment: "bien".to_string(),
            rating: 4,
        }
    }

    #[tokio::test]
    async fn api_failure_is_isolated() {
        let orchestrator = ExtractionOrchestrator::new()
            .with_surveys(Arc::new(Fixed(vec![survey()])))
            .with_web_reviews(Arc::new(Fixed(vec![review(), review()])))
            .with_social_comments(Arc::new(Failing("API")));

        let result = orchestrator.extract_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, ExtractionStatus::Success);
        assert_eq!(result.errors, vec!["API: connection refused".to_string()]);
        assert_eq!(result.metrics.api_records, 0);
        assert_eq!(result.metrics.csv_records, 1);
        assert_eq!(result.metrics.database_records, 2);
        assert_eq!(result.metrics.total_records(), 3);
        assert_eq!(result.metrics.extracted_sources, vec!["CSV", "Database"]);
        assert_eq!(result.metrics.per_source[2], ("API".to_string(), 0));
    }

    #[tokio::test]
    async fn all_sources_empty_is_a_warning() {
        let orchestrator = ExtractionOrchestrator::new()
            .with_surveys(Arc::new(Fixed(Vec::new())))
            .with_web_reviews(Arc::new(Failing("Database")));

        let result = orchestrator.extract_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, ExtractionStatus::Warning);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("Database: "));
    }

    #[tokio::test]
    async fn no_readers_is_an_error_status() {
        let result = ExtractionOrchestrator::new()
            .extract_all(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, ExtractionStatus::Error);
        assert_eq!(result.errors.len(), 1);
    }

    #[tokio::test]
    async fn master_data_does_not_count_as_opinions() {
        let orchestrator = ExtractionOrchestrator::new()
            .with_surveys(Arc::new(Fixed(vec![survey()])))
            .with_product_master(Arc::new(Fixed(vec![ProductMaster {
                product_id: "42".to_string(),
                name: "Auriculares".to_string(),
                category: None,
            }])));

        let result = orchestrator.extract_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(result.metrics.product_master_records, 1);
        assert_eq!(result.metrics.total_records(), 1);
        assert_eq!(result.product_masters.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_stuck_branch() {
        let orchestrator = ExtractionOrchestrator::new()
            .with_surveys(Arc::new(Fixed(vec![survey()])))
            .with_social_comments(Arc::new(Stuck));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = orchestrator.extract_all(&cancel).await.unwrap_err();
        assert!(matches!(err, EtlError::Cancelled));
    }
}
