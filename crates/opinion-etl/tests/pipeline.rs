use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use opinion_core::{SocialComment, SurveyRecord, WebReview};
use opinion_etl::{EtlConfig, EtlPipeline, ExtractionOrchestrator, ExtractionStatus};
use opinion_sources::{SourceError, SourceReader};
use opinion_store::{FailPoint, MemoryWarehouse};
use tokio_util::sync::CancellationToken;

struct Stub<T> {
    name: &'static str,
    records: Vec<T>,
    reads: Arc<AtomicUsize>,
}

impl<T> Stub<T> {
    fn new(name: &'static str, records: Vec<T>) -> Self {
        Self {
            name,
            records,
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> SourceReader<T> for Stub<T> {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn read_all(&self) -> Result<Vec<T>, SourceError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.records.clone())
    }
}

struct Unreachable;

#[async_trait]
impl SourceReader<SocialComment> for Unreachable {
    fn name(&self) -> &'static str {
        "API"
    }

    async fn read_all(&self) -> Result<Vec<SocialComment>, SourceError> {
        Err(SourceError::Message("connection refused".to_string()))
    }
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
}

fn surveys() -> Vec<SurveyRecord> {
    vec![
        SurveyRecord {
            opinion_id: 1,
            customer_id: 10,
            product_id: "P42".to_string(),
            date: day(7),
            comment: "Muy buen sonido".to_string(),
            classification: "Positiva".to_string(),
            satisfaction: Some(5),
            channel: "Tienda".to_string(),
        },
        SurveyRecord {
            opinion_id: 2,
            customer_id: 11,
            product_id: "P43".to_string(),
            date: day(7),
            comment: "Regular".to_string(),
            classification: "neutral".to_string(),
            satisfaction: None,
            channel: "Tienda".to_string(),
        },
    ]
}

fn web_reviews() -> Vec<WebReview> {
    vec![WebReview {
        review_id: 100,
        customer_id: Some(10),
        customer_name: Some("Ana Lopez".to_string()),
        customer_email: Some("Ana@Example.com".to_string()),
        product_id: "42".to_string(),
        product_name: Some("Auriculares X".to_string()),
        product_category: Some("Electronics".to_string()),
        date: day(8).and_hms_opt(10, 15, 0).unwrap(),
        comment: "Bien".to_string(),
        rating: 4,
    }]
}

fn social_comments() -> Vec<SocialComment> {
    vec![SocialComment {
        comment_id: 500,
        customer_id: None,
        customer_name: Some("Eva Ruiz".to_string()),
        customer_email: None,
        product_id: "p42".to_string(),
        product_name: None,
        product_category: Some("Sin Categoría".to_string()),
        channel: "Instagram".to_string(),
        date: day(9).and_hms_opt(20, 0, 0).unwrap(),
        comment: "no lo recomiendo, pesima calidad".to_string(),
    }]
}

fn config(survey_csv: std::path::PathBuf) -> EtlConfig {
    let mut config = EtlConfig::from_lookup(|_| None);
    config.survey_csv = survey_csv;
    config
}

fn orchestrator() -> ExtractionOrchestrator {
    ExtractionOrchestrator::new()
        .with_surveys(Arc::new(Stub::new("CSV", surveys())))
        .with_web_reviews(Arc::new(Stub::new("Database", web_reviews())))
        .with_social_comments(Arc::new(Stub::new("API", social_comments())))
}

fn pipeline(store: &MemoryWarehouse, orchestrator: ExtractionOrchestrator) -> EtlPipeline {
    EtlPipeline::new(config("unused.csv".into()), orchestrator, Arc::new(store.clone()))
}

#[tokio::test]
async fn full_run_loads_dimensions_and_facts() {
    let store = MemoryWarehouse::new();
    let summary = pipeline(&store, orchestrator())
        .run_once(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.extraction_status, ExtractionStatus::Success);
    assert!(summary.is_clean());
    assert_eq!(summary.metrics.total_records(), 4);

    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["extraction_status"], "Success");
    assert_eq!(json["facts"]["inserted"], 4);

    let snapshot = store.snapshot().await;
    assert_eq!(snapshot.customers.len(), 3);
    assert_eq!(snapshot.products.len(), 2);
    assert_eq!(snapshot.sources.len(), 3);
    assert_eq!(snapshot.sentiments.len(), 3);
    assert_eq!(snapshot.dates.len(), 3);

    let product = &snapshot.product("42").unwrap().row;
    assert_eq!(product.category.as_deref(), Some("Electronics"));
    assert_eq!(product.name, "Auriculares X");
    let customer = &snapshot.customer("10").unwrap().row;
    assert_eq!(customer.email.as_deref(), Some("ana@example.com"));
    let keys: Vec<&str> = snapshot.customers.iter().map(|c| c.row.customer_id.as_str()).collect();
    assert_eq!(keys, vec!["10", "11", "API_EVA_RUIZ"]);

    let facts = summary.facts.unwrap();
    assert_eq!(facts.inserted, 4);
    assert_eq!(snapshot.facts.len(), 4);

    let negative = snapshot.sentiment("Negativo").unwrap().key;
    let social_fact = snapshot.facts.last().unwrap();
    assert_eq!(social_fact.sentiment_key, negative);
    assert_eq!(social_fact.date_key, 20240309);
}

#[tokio::test]
async fn repeated_runs_are_idempotent() {
    let store = MemoryWarehouse::new();
    let pipeline = pipeline(&store, orchestrator());
    let cancel = CancellationToken::new();

    pipeline.run_once(&cancel).await.unwrap();
    let first = store.snapshot().await;
    let second = pipeline.run_once(&cancel).await.unwrap();

    assert_eq!(second.dimensions.total_inserted(), 0);
    assert_eq!(second.dimensions.total_updated(), 0);
    let after = store.snapshot().await;
    assert_eq!(after.customers, first.customers);
    assert_eq!(after.products, first.products);
    assert_eq!(after.facts, first.facts);
}

#[tokio::test]
async fn failing_api_still_loads_other_sources() {
    let store = MemoryWarehouse::new();
    let orchestrator = ExtractionOrchestrator::new()
        .with_surveys(Arc::new(Stub::new("CSV", surveys())))
        .with_web_reviews(Arc::new(Stub::new("Database", web_reviews())))
        .with_social_comments(Arc::new(Unreachable));

    let summary = pipeline(&store, orchestrator)
        .run_once(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.extraction_status, ExtractionStatus::Success);
    assert_eq!(summary.extraction_errors.len(), 1);
    assert!(summary.extraction_errors[0].starts_with("API: "));
    assert_eq!(summary.metrics.api_records, 0);
    assert_eq!(summary.facts.unwrap().inserted, 3);
    assert_eq!(store.snapshot().await.sources.len(), 2);
}

#[tokio::test]
async fn failed_dimension_load_skips_fact_rebuild() {
    let store = MemoryWarehouse::new();
    let cancel = CancellationToken::new();
    let pipeline = pipeline(&store, orchestrator());
    pipeline.run_once(&cancel).await.unwrap();
    let before = store.snapshot().await;

    store.fail_on(FailPoint::Commit).await;
    let summary = pipeline.run_once(&cancel).await.unwrap();

    assert!(!summary.dimensions.is_success());
    assert!(summary.facts.is_none());
    assert!(!summary.is_clean());
    assert_eq!(store.snapshot().await, before);
}

#[tokio::test]
async fn run_without_any_source_is_an_error() {
    let store = MemoryWarehouse::new();
    let err = pipeline(&store, ExtractionOrchestrator::new())
        .run_once(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("extraction failed"));
}

#[tokio::test]
async fn cancelled_run_fails_without_writing() {
    let store = MemoryWarehouse::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = pipeline(&store, orchestrator()).run_once(&cancel).await;
    assert!(result.is_err());
    assert!(store.snapshot().await.customers.is_empty());
}

#[tokio::test(start_paused = true)]
async fn scheduler_waits_the_interval_between_runs() {
    let dir = tempfile::tempdir().unwrap();
    let survey_csv = dir.path().join("encuestas.csv");
    std::fs::write(&survey_csv, "IdOpinion\n").unwrap();

    let surveys = Stub::new("CSV", surveys());
    let reads = Arc::clone(&surveys.reads);
    let store = MemoryWarehouse::new();
    let pipeline = Arc::new(EtlPipeline::new(
        config(survey_csv),
        ExtractionOrchestrator::new().with_surveys(Arc::new(surveys)),
        Arc::new(store.clone()),
    ));

    let cancel = CancellationToken::new();
    let handle = {
        let pipeline = Arc::clone(&pipeline);
        let cancel = cancel.clone();
        tokio::spawn(async move { pipeline.run_scheduled(&cancel).await })
    };

    tokio::time::sleep(Duration::from_secs(3 * 3600 + 60)).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(reads.load(Ordering::SeqCst), 4);
    assert_eq!(store.snapshot().await.facts.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn scheduler_backs_off_on_invalid_config() {
    let dir = tempfile::tempdir().unwrap();
    let surveys = Stub::new("CSV", surveys());
    let reads = Arc::clone(&surveys.reads);
    let pipeline = Arc::new(EtlPipeline::new(
        config(dir.path().join("missing.csv")),
        ExtractionOrchestrator::new().with_surveys(Arc::new(surveys)),
        Arc::new(MemoryWarehouse::new()),
    ));

    let cancel = CancellationToken::new();
    let handle = {
        let pipeline = Arc::clone(&pipeline);
        let cancel = cancel.clone();
        tokio::spawn(async move { pipeline.run_scheduled(&cancel).await })
    };

    tokio::time::sleep(Duration::from_secs(15 * 60)).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(reads.load(Ordering::SeqCst), 0);
}
