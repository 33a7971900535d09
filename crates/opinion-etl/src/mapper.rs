//! Entity resolution from raw extraction records into conformed dimension rows.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use opinion_core::{
    is_blank, non_blank, normalize_natural_key, normalize_product_id, synthetic_customer_key,
    DimCustomer, DimDate, DimProduct, DimSentiment, DimSource, SentimentLabel, SourceTag,
};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::extract::ExtractionResult;
use crate::sentiment::SentimentClassifier;

pub(crate) const NAMELESS_PRODUCT: &str = "Sin Nombre";

/// Where a product observation came from. Lower priority wins among
/// categorized observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Origin {
    Web,
    Api,
    Csv,
    Master,
}

impl Origin {
    pub fn priority(self) -> u8 {
        match self {
            Origin::Web => 1,
            Origin::Api => 2,
            Origin::Csv => 3,
            Origin::Master => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductObservation {
    pub key: String,
    pub name: String,
    pub category: Option<String>,
    pub origin: Origin,
}

#[derive(Debug, Clone, Serialize)]
pub struct DimensionSet {
    pub customers: Vec<DimCustomer>,
    pub products: Vec<DimProduct>,
    pub sources: Vec<DimSource>,
    pub sentiments: Vec<DimSentiment>,
    pub dates: Vec<DimDate>,
    pub processed_records: usize,
    pub processed_sources: Vec<String>,
    pub validation_errors: Vec<String>,
    pub mapped_at: DateTime<Utc>,
}

impl DimensionSet {
    pub fn row_count(&self) -> usize {
        self.customers.len()
            + self.products.len()
            + self.sources.len()
            + self.sentiments.len()
            + self.dates.len()
    }
}

/// Blank, or mentions one of the catch-all words.
pub fn is_generic_category(category: Option<&str>) -> bool {
    let Some(category) = category.map(str::trim).filter(|c| !c.is_empty()) else {
        return true;
    };
    let lower = category.to_lowercase();
    ["sin", "desconocido", "generales", "otros"]
        .iter()
        .any(|word| lower.contains(word))
}

/// Customer natural key for web and social records: explicit id first, then
/// the source-prefixed name.
pub fn customer_key_for(tag: SourceTag, id: Option<i64>, name: Option<&str>) -> Option<String> {
    match id {
        Some(id) => Some(id.to_string()),
        None => synthetic_customer_key(tag, name),
    }
}

/// Groups rows by case-insensitive key, keeping first-seen order of groups
/// and of rows inside each group.
pub(crate) fn group_by_key<T>(items: Vec<T>, key: impl Fn(&T) -> String) -> Vec<Vec<T>> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Vec<T>> = Vec::new();
    for item in items {
        let k = normalize_natural_key(&key(&item));
        match index.get(&k) {
            Some(&i) => groups[i].push(item),
            None => {
                index.insert(k, groups.len());
                groups.push(vec![item]);
            }
        }
    }
    groups
}

/// First row with an email wins; otherwise the first row. A blank name is
/// backfilled from the group.
pub fn merge_customer_group(group: Vec<DimCustomer>) -> Option<DimCustomer> {
    let backfill = group
        .iter()
        .find(|c| !c.name.trim().is_empty())
        .map(|c| c.name.clone());
    let winner = match group.iter().position(|c| !is_blank(c.email.as_deref())) {
        Some(i) => group.into_iter().nth(i),
        None => group.into_iter().next(),
    };
    winner.map(|mut customer| {
        if customer.name.trim().is_empty() {
            customer.name = backfill.unwrap_or_else(|| customer.customer_id.clone());
        }
        customer
    })
}

fn best_product_name(key: &str, entries: &[ProductObservation]) -> String {
    let informative = |e: &&ProductObservation| {
        !e.name.trim().is_empty() && e.name != NAMELESS_PRODUCT
    };
    entries
        .iter()
        .filter(|e| e.origin != Origin::Csv)
        .find(informative)
        .or_else(|| entries.iter().find(informative))
        .map(|e| e.name.clone())
        .unwrap_or_else(|| format!("Producto {key}"))
}

/// Picks the category for one product key. A specific category wins
/// outright in observation order; otherwise the best-priority source that
/// has any category; otherwise none.
pub fn select_product(entries: &[ProductObservation]) -> Option<DimProduct> {
    let first = entries.first()?;
    let categorized = |e: &&ProductObservation| !is_blank(e.category.as_deref());

    let chosen = entries
        .iter()
        .filter(categorized)
        .find(|e| !is_generic_category(e.category.as_deref()))
        .or_else(|| {
            entries
                .iter()
                .filter(categorized)
                .min_by_key(|e| e.origin.priority())
        });

    Some(DimProduct {
        product_id: first.key.clone(),
        name: best_product_name(&first.key, entries),
        category: chosen.and_then(|e| e.category.clone()),
        subcategory: None,
    })
}

/// Turns an [`ExtractionResult`] into one row list per dimension.
///
/// Mapping never fails as a whole: records that cannot contribute a row are
/// reported in `validation_errors` and the rest are still mapped.
#[derive(Debug, Clone, Default)]
pub struct DimensionMapper {
    classifier: SentimentClassifier,
}

impl DimensionMapper {
    pub fn new(classifier: SentimentClassifier) -> Self {
        Self { classifier }
    }

    pub fn map(&self, extraction: &ExtractionResult) -> DimensionSet {
        let mut errors = Vec::new();
        let customers = self.map_customers(extraction);
        let products = self.map_products(extraction, &mut errors);
        let sources = self.map_sources(extraction);
        let sentiments = self.map_sentiments(extraction);
        let dates = self.map_dates(extraction);

        info!(
            customers = customers.len(),
            products = products.len(),
            sources = sources.len(),
            sentiments = sentiments.len(),
            dates = dates.len(),
            validation_errors = errors.len(),
            "dimensions mapped"
        );

        DimensionSet {
            customers,
            products,
            sources,
            sentiments,
            dates,
            processed_records: extraction.metrics.total_records(),
            processed_sources: extraction.metrics.extracted_sources.clone(),
            validation_errors: errors,
            mapped_at: Utc::now(),
        }
    }

    fn map_customers(&self, extraction: &ExtractionResult) -> Vec<DimCustomer> {
        let mut rows = Vec::new();

        for survey in &extraction.surveys {
            rows.push(DimCustomer {
                customer_id: survey.customer_id.to_string(),
                name: format!("Cliente {}", survey.customer_id),
                email: None,
            });
        }

        let mut push_remote = |tag: SourceTag,
                               id: Option<i64>,
                               name: Option<&str>,
                               email: Option<&str>,
                               record: i64| {
            let key = customer_key_for(tag, id, name).unwrap_or_else(|| {
                let key = format!("{}_{}", tag.synthetic_prefix(), Uuid::new_v4());
                warn!(source = %tag, record, %key, "record has neither customer id nor name");
                key
            });
            let name = non_blank(name).unwrap_or_else(|| format!("Cliente_{key}"));
            rows.push(DimCustomer {
                customer_id: key,
                name,
                email: non_blank(email).map(|e| e.to_lowercase()),
            });
        };

        for review in &extraction.web_reviews {
            push_remote(
                SourceTag::SaocDb,
                review.customer_id,
                review.customer_name.as_deref(),
                review.customer_email.as_deref(),
                review.review_id,
            );
        }
        for comment in &extraction.social_comments {
            push_remote(
                SourceTag::SocialApi,
                comment.customer_id,
                comment.customer_name.as_deref(),
                comment.customer_email.as_deref(),
                comment.comment_id,
            );
        }

        let observed: HashSet<String> = rows
            .iter()
            .map(|c| normalize_natural_key(&c.customer_id))
            .collect();
        for master in &extraction.customer_masters {
            let key = master.customer_id.to_string();
            if !observed.contains(&normalize_natural_key(&key)) {
                continue;
            }
            rows.push(DimCustomer {
                customer_id: key,
                name: master.name.trim().to_string(),
                email: non_blank(master.email.as_deref()).map(|e| e.to_lowercase()),
            });
        }

        group_by_key(rows, |c| c.customer_id.clone())
            .into_iter()
            .filter_map(merge_customer_group)
            .collect()
    }

    fn product_observations(
        &self,
        extraction: &ExtractionResult,
        errors: &mut Vec<String>,
    ) -> Vec<ProductObservation> {
        let mut raw = Vec::new();
        let mut observe = |raw_id: &str,
                           name: String,
                           category: Option<&str>,
                           origin: Origin,
                           context: String| {
            let key = normalize_product_id(raw_id);
            if key.is_empty() {
                errors.push(format!("{context}: product id is blank"));
                return;
            }
            raw.push(ProductObservation {
                key,
                name,
                category: non_blank(category),
                origin,
            });
        };

        for survey in &extraction.surveys {
            let key = normalize_product_id(&survey.product_id);
            observe(
                &survey.product_id,
                format!("Producto {key}"),
                None,
                Origin::Csv,
                format!("survey {}", survey.opinion_id),
            );
        }
        for review in &extraction.web_reviews {
            observe(
                &review.product_id,
                non_blank(review.product_name.as_deref())
                    .unwrap_or_else(|| NAMELESS_PRODUCT.to_string()),
                review.product_category.as_deref(),
                Origin::Web,
                format!("web review {}", review.review_id),
            );
        }
        for comment in &extraction.social_comments {
            observe(
                &comment.product_id,
                non_blank(comment.product_name.as_deref())
                    .unwrap_or_else(|| NAMELESS_PRODUCT.to_string()),
                comment.product_category.as_deref(),
                Origin::Api,
                format!("social comment {}", comment.comment_id),
            );
        }

        let observed: HashSet<String> = raw.iter().map(|o| normalize_natural_key(&o.key)).collect();
        for master in &extraction.product_masters {
            let key = normalize_product_id(&master.product_id);
            if key.is_empty() || !observed.contains(&normalize_natural_key(&key)) {
                continue;
            }
            raw.push(ProductObservation {
                key,
                name: non_blank(Some(&master.name)).unwrap_or_else(|| NAMELESS_PRODUCT.to_string()),
                category: non_blank(master.category.as_deref()),
                origin: Origin::Master,
            });
        }
        raw
    }

    fn map_products(&self, extraction: &ExtractionResult, errors: &mut Vec<String>) -> Vec<DimProduct> {
        let observations = self.product_observations(extraction, errors);
        let products: Vec<DimProduct> = group_by_key(observations, |o| o.key.clone())
            .iter()
            .filter_map(|group| select_product(group))
            .collect();

        let uncategorized = products.iter().filter(|p| p.category.is_none()).count();
        if uncategorized > 0 {
            let sample: Vec<&str> = products
                .iter()
                .filter(|p| p.category.is_none())
                .take(10)
                .map(|p| p.product_id.as_str())
                .collect();
            debug!(uncategorized, sample = %sample.join(", "), "products without any category");
        }
        products
    }

    fn map_sources(&self, extraction: &ExtractionResult) -> Vec<DimSource> {
        let present = [
            (SourceTag::Csv, !extraction.surveys.is_empty()),
            (SourceTag::SaocDb, !extraction.web_reviews.is_empty()),
            (SourceTag::SocialApi, !extraction.social_comments.is_empty()),
        ];
        present
            .into_iter()
            .filter(|(_, any)| *any)
            .map(|(tag, _)| DimSource::for_tag(tag))
            .collect()
    }

    fn map_sentiments(&self, extraction: &ExtractionResult) -> Vec<DimSentiment> {
        let mut labels: BTreeSet<SentimentLabel> = BTreeSet::new();
        labels.extend(
            extraction
                .surveys
                .iter()
                .map(|s| SentimentLabel::normalize(&s.classification)),
        );
        labels.extend(
            extraction
                .web_reviews
                .iter()
                .map(|r| SentimentLabel::from_rating(r.rating)),
        );

        let mut social_counts = [0usize; 3];
        for comment in &extraction.social_comments {
            let label = self.classifier.classify(&comment.comment);
            social_counts[match label {
                SentimentLabel::Positive => 0,
                SentimentLabel::Negative => 1,
                SentimentLabel::Neutral => 2,
            }] += 1;
            labels.insert(label);
        }
        debug!(
            positive = social_counts[0],
            negative = social_counts[1],
            neutral = social_counts[2],
            "social comments classified"
        );

        labels.extend(SentimentLabel::ALL);
        labels.into_iter().map(DimSentiment::from).collect()
    }

    fn map_dates(&self, extraction: &ExtractionResult) -> Vec<DimDate> {
        let mut dates: BTreeSet<NaiveDate> = BTreeSet::new();
        dates.extend(extraction.surveys.iter().map(|s| s.date));
        dates.extend(extraction.web_reviews.iter().map(|r| r.date.date()));
        dates.extend(extraction.social_comments.iter().map(|c| c.date.date()));
        dates.into_iter().map(DimDate::from_date).collect()
    }
}
