//! Transactional truncate-and-reload of `fact_opinion` from the current
//! extraction.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::NaiveDate;
use opinion_core::{
    date_key, normalize_natural_key, normalize_product_id, FactOpinion, SentimentLabel, SourceTag,
};
use opinion_store::{WarehouseStore, WarehouseTx};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::extract::ExtractionResult;
use crate::mapper::customer_key_for;
use crate::sentiment::keyword_label;
use crate::{cancellable, EtlError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FactReport {
    pub candidates: usize,
    pub inserted: u64,
    pub skipped_missing_customer: usize,
    pub skipped_missing_product: usize,
    pub skipped_missing_source: usize,
    pub skipped_missing_sentiment: usize,
    pub skipped_missing_date: usize,
    /// Truncation was refused and rows were deleted instead.
    pub cleaned_by_delete: bool,
}

impl FactReport {
    pub fn total_skipped(&self) -> usize {
        self.skipped_missing_customer
            + self.skipped_missing_product
            + self.skipped_missing_source
            + self.skipped_missing_sentiment
            + self.skipped_missing_date
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Skip {
    Customer,
    Product,
    Source,
    Sentiment,
    Date,
}

/// One raw record reduced to the natural keys a fact needs.
#[derive(Debug)]
struct Candidate {
    customer: Option<String>,
    product: String,
    source: SourceTag,
    sentiment: SentimentLabel,
    date: NaiveDate,
    rating: Decimal,
}

/// Natural key to surrogate key, per dimension.
#[derive(Debug, Default)]
struct KeyMaps {
    customers: HashMap<String, i32>,
    products: HashMap<String, i32>,
    sources: HashMap<String, i32>,
    sentiments: HashMap<String, i32>,
    dates: HashSet<i32>,
}

impl KeyMaps {
    async fn load(tx: &mut Box<dyn WarehouseTx>, cancel: &CancellationToken) -> Result<Self, EtlError> {
        let customers = cancellable(cancel, tx.load_customers()).await?;
        let products = cancellable(cancel, tx.load_products()).await?;
        let sources = cancellable(cancel, tx.load_sources()).await?;
        let sentiments = cancellable(cancel, tx.load_sentiments()).await?;
        let dates = cancellable(cancel, tx.load_dates()).await?;

        Ok(Self {
            customers: customers
                .into_iter()
                .map(|k| (normalize_natural_key(&k.row.customer_id), k.key))
                .collect(),
            products: products
                .into_iter()
                .map(|k| (normalize_natural_key(&k.row.product_id), k.key))
                .collect(),
            sources: sources
                .into_iter()
                .map(|k| (normalize_natural_key(&k.row.source_id), k.key))
                .collect(),
            sentiments: sentiments
                .into_iter()
                .map(|k| (normalize_natural_key(&k.row.label), k.key))
                .collect(),
            dates: dates.into_iter().map(|d| d.date_key).collect(),
        })
    }

    fn lookup(map: &HashMap<String, i32>, key: &str) -> Option<i32> {
        map.get(&normalize_natural_key(key)).copied().filter(|k| *k > 0)
    }

    /// Sentiment is resolved first, so a record missing several keys is
    /// counted under missing sentiment.
    fn resolve(&self, candidate: &Candidate) -> Result<FactOpinion, Skip> {
        let sentiment_key = Self::lookup(&self.sentiments, candidate.sentiment.as_str())
            .or_else(|| Self::lookup(&self.sentiments, SentimentLabel::Neutral.as_str()))
            .ok_or(Skip::Sentiment)?;
        let customer_key = candidate
            .customer
            .as_deref()
            .and_then(|c| Self::lookup(&self.customers, c))
            .ok_or(Skip::Customer)?;
        let product_key = Self::lookup(&self.products, &candidate.product).ok_or(Skip::Product)?;
        let source_key = Self::lookup(&self.sources, candidate.source.as_str()).ok_or(Skip::Source)?;
        let date_key = date_key(candidate.date);
        if date_key <= 0 || !self.dates.contains(&date_key) {
            return Err(Skip::Date);
        }

        Ok(FactOpinion {
            customer_key,
            product_key,
            source_key,
            sentiment_key,
            date_key,
            rating: candidate.rating,
        })
    }
}

fn candidates(extraction: &ExtractionResult) -> Vec<Candidate> {
    let mut out = Vec::with_capacity(extraction.metrics.total_records());

    for survey in &extraction.surveys {
        let sentiment = SentimentLabel::normalize(&survey.classification);
        let rating = match survey.satisfaction {
            Some(score) if score > 0 => Decimal::from(score),
            _ => sentiment.derived_rating(),
        };
        out.push(Candidate {
            customer: Some(survey.customer_id.to_string()),
            product: normalize_product_id(&survey.product_id),
            source: SourceTag::Csv,
            sentiment,
            date: survey.date,
            rating,
        });
    }

    for review in &extraction.web_reviews {
        out.push(Candidate {
            customer: customer_key_for(SourceTag::SaocDb, review.customer_id, review.customer_name.as_deref()),
            product: normalize_product_id(&review.product_id),
            source: SourceTag::SaocDb,
            sentiment: SentimentLabel::from_rating(review.rating),
            date: review.date.date(),
            rating: Decimal::from(review.rating),
        });
    }

    for comment in &extraction.social_comments {
        let sentiment = keyword_label(&comment.comment);
        out.push(Candidate {
            customer: customer_key_for(
                SourceTag::SocialApi,
                comment.customer_id,
                comment.customer_name.as_deref(),
            ),
            product: normalize_product_id(&comment.product_id),
            source: SourceTag::SocialApi,
            sentiment,
            date: comment.date.date(),
            rating: sentiment.derived_rating(),
        });
    }
    out
}

/// Rebuilds the fact table. Meant to run only after a successful dimension
/// load; candidates that cannot be tied to every dimension are counted and
/// dropped, never inserted with a placeholder key.
#[derive(Clone)]
pub struct FactRebuildEngine {
    store: Arc<dyn WarehouseStore>,
}

impl FactRebuildEngine {
    pub fn new(store: Arc<dyn WarehouseStore>) -> Self {
        Self { store }
    }

    pub async fn rebuild_facts(
        &self,
        extraction: &ExtractionResult,
        cancel: &CancellationToken,
    ) -> Result<FactReport, EtlError> {
        let mut report = FactReport::default();
        let mut tx = cancellable(cancel, self.store.begin()).await?;
        match self.build(extraction, &mut tx, cancel, &mut report).await {
            Ok(()) => cancellable(cancel, tx.commit()).await?,
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "rollback failed");
                }
                return Err(err);
            }
        }

        info!(
            candidates = report.candidates,
            inserted = report.inserted,
            skipped = report.total_skipped(),
            missing_customer = report.skipped_missing_customer,
            missing_product = report.skipped_missing_product,
            missing_source = report.skipped_missing_source,
            missing_sentiment = report.skipped_missing_sentiment,
            missing_date = report.skipped_missing_date,
            "facts rebuilt"
        );
        Ok(report)
    }

    async fn build(
        &self,
        extraction: &ExtractionResult,
        tx: &mut Box<dyn WarehouseTx>,
        cancel: &CancellationToken,
        report: &mut FactReport,
    ) -> Result<(), EtlError> {
        match cancellable(cancel, tx.truncate_facts()).await {
            Ok(()) => debug!("fact table truncated"),
            Err(EtlError::Cancelled) => return Err(EtlError::Cancelled),
            Err(err) => {
                warn!(error = %err, "truncate refused, deleting fact rows instead");
                let deleted = cancellable(cancel, tx.delete_all_facts()).await?;
                debug!(deleted, "fact rows deleted");
                report.cleaned_by_delete = true;
            }
        }

        let keys = KeyMaps::load(tx, cancel).await?;
        let candidates = candidates(extraction);
        report.candidates = candidates.len();

        let mut facts = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            match keys.resolve(candidate) {
                Ok(fact) => facts.push(fact),
                Err(skip) => {
                    debug!(?skip, source = %candidate.source, product = %candidate.product, "fact candidate skipped");
                    match skip {
                        Skip::Customer => report.skipped_missing_customer += 1,
                        Skip::Product => report.skipped_missing_product += 1,
                        Skip::Source => report.skipped_missing_source += 1,
                        Skip::Sentiment => report.skipped_missing_sentiment += 1,
                        Skip::Date => report.skipped_missing_date += 1,
                    }
                }
            }
        }

        report.inserted = cancellable(cancel, tx.insert_facts(&facts)).await?;
        Ok(())
    }
}
