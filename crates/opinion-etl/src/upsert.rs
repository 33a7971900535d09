//! Transactional insert-or-update of the five dimensions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use opinion_core::{
    normalize_natural_key, normalize_text, DimCustomer, DimDate, DimProduct, DimSentiment,
    DimSource, Keyed,
};
use opinion_store::{WarehouseStore, WarehouseTx};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::mapper::{group_by_key, DimensionSet};
use crate::{cancellable, EtlError};

pub(crate) const NO_EMAIL: &str = "Sin Email";
pub(crate) const NO_CATEGORY: &str = "Sin Categoría";
pub(crate) const NO_SUBCATEGORY: &str = "Sin Subcategoría";
const NO_NAME: &str = "Sin Nombre";
const NO_SOURCE_KIND: &str = "Sin Fuente";
const NO_SENTIMENT_DESCRIPTION: &str = "Clasificación no determinada";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DimensionCounts {
    pub inserted: usize,
    pub updated: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadResult {
    pub customers: DimensionCounts,
    pub products: DimensionCounts,
    pub sources: DimensionCounts,
    pub sentiments: DimensionCounts,
    pub dates: DimensionCounts,
    pub errors: Vec<String>,
}

impl LoadResult {
    fn rolled_back(err: &EtlError) -> Self {
        Self {
            errors: vec![format!("dimension load rolled back: {err}")],
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn total_inserted(&self) -> usize {
        [self.customers, self.products, self.sources, self.sentiments, self.dates]
            .iter()
            .map(|c| c.inserted)
            .sum()
    }

    pub fn total_updated(&self) -> usize {
        [self.customers, self.products, self.sources, self.sentiments, self.dates]
            .iter()
            .map(|c| c.updated)
            .sum()
    }
}

fn text_or(value: Option<&str>, default: &str) -> String {
    let value = value.map(normalize_text).unwrap_or_default();
    if value.is_empty() {
        default.to_string()
    } else {
        value
    }
}

fn normalize_customer(row: &DimCustomer) -> DimCustomer {
    let email = row
        .email
        .as_deref()
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty())
        .unwrap_or_else(|| NO_EMAIL.to_string());
    DimCustomer {
        customer_id: normalize_natural_key(&row.customer_id),
        name: text_or(Some(row.name.as_str()), NO_NAME),
        email: Some(email),
    }
}

fn normalize_product(row: &DimProduct) -> DimProduct {
    DimProduct {
        product_id: normalize_natural_key(&row.product_id),
        name: text_or(Some(row.name.as_str()), NO_NAME),
        category: Some(text_or(row.category.as_deref(), NO_CATEGORY)),
        subcategory: Some(text_or(row.subcategory.as_deref(), NO_SUBCATEGORY)),
    }
}

fn normalize_source(row: &DimSource) -> DimSource {
    DimSource {
        source_id: normalize_natural_key(&row.source_id),
        name: text_or(Some(row.name.as_str()), NO_NAME),
        kind: text_or(Some(row.kind.as_str()), NO_SOURCE_KIND),
        loaded_at: row.loaded_at,
    }
}

fn normalize_sentiment(row: &DimSentiment) -> DimSentiment {
    DimSentiment {
        label: normalize_text(&row.label),
        description: Some(text_or(row.description.as_deref(), NO_SENTIMENT_DESCRIPTION)),
        weight: row.weight,
    }
}

fn has_real_email(row: &DimCustomer) -> bool {
    row.email.as_deref().is_some_and(|e| e != NO_EMAIL)
}

fn has_real_category(row: &DimProduct) -> bool {
    row.category.as_deref().is_some_and(|c| {
        !c.trim().is_empty() && c != NO_CATEGORY && !c.to_lowercase().contains("sin")
    })
}

fn has_any_category(row: &DimProduct) -> bool {
    row.category.as_deref().is_some_and(|c| c != NO_CATEGORY)
}

/// One representative per case-insensitive key: the first row passing the
/// first matching preference, else the first row of the group.
fn dedup<T>(rows: Vec<T>, key: impl Fn(&T) -> String, prefer: &[fn(&T) -> bool]) -> Vec<T> {
    group_by_key(rows, key)
        .into_iter()
        .filter_map(|group| {
            let pick = prefer
                .iter()
                .find_map(|wanted| group.iter().position(|row| wanted(row)))
                .unwrap_or(0);
            group.into_iter().nth(pick)
        })
        .collect()
}

struct Plan<T> {
    inserts: Vec<T>,
    updates: Vec<Keyed<T>>,
}

impl<T> Plan<T> {
    fn counts(&self) -> DimensionCounts {
        DimensionCounts {
            inserted: self.inserts.len(),
            updated: self.updates.len(),
        }
    }
}

/// Splits incoming rows into new keys and existing keys whose tracked
/// fields differ from the stored row. Unchanged rows are dropped.
fn plan<T>(
    incoming: Vec<T>,
    existing: Vec<Keyed<T>>,
    key: impl Fn(&T) -> String,
    changed: impl Fn(&T, &T) -> bool,
) -> Plan<T> {
    let stored: HashMap<String, Keyed<T>> = existing
        .into_iter()
        .map(|k| (normalize_natural_key(&key(&k.row)), k))
        .collect();

    let mut plan = Plan {
        inserts: Vec::new(),
        updates: Vec::new(),
    };
    for row in incoming {
        match stored.get(&normalize_natural_key(&key(&row))) {
            None => plan.inserts.push(row),
            Some(current) if changed(&current.row, &row) => plan.updates.push(Keyed {
                key: current.key,
                row,
            }),
            Some(_) => {}
        }
    }
    plan
}

/// Reconciles a [`DimensionSet`] against the warehouse inside one
/// transaction. Either every dimension lands or none does.
#[derive(Clone)]
pub struct DimensionUpsertEngine {
    store: Arc<dyn WarehouseStore>,
}

impl DimensionUpsertEngine {
    pub fn new(store: Arc<dyn WarehouseStore>) -> Self {
        Self { store }
    }

    /// Store failures are reported inside the returned [`LoadResult`]; only
    /// cancellation surfaces as `Err`.
    pub async fn load_dimensions(
        &self,
        set: &DimensionSet,
        cancel: &CancellationToken,
    ) -> Result<LoadResult, EtlError> {
        let mut tx = match cancellable(cancel, self.store.begin()).await {
            Ok(tx) => tx,
            Err(EtlError::Cancelled) => return Err(EtlError::Cancelled),
            Err(err) => {
                warn!(error = %err, "could not open dimension transaction");
                return Ok(LoadResult::rolled_back(&err));
            }
        };

        match self.apply(set, &mut tx, cancel).await {
            Ok(result) => match cancellable(cancel, tx.commit()).await {
                Ok(()) => {
                    info!(
                        inserted = result.total_inserted(),
                        updated = result.total_updated(),
                        "dimension load committed"
                    );
                    Ok(result)
                }
                Err(EtlError::Cancelled) => Err(EtlError::Cancelled),
                Err(err) => {
                    warn!(error = %err, "dimension commit failed");
                    Ok(LoadResult::rolled_back(&err))
                }
            },
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "rollback failed");
                }
                match err {
                    EtlError::Cancelled => Err(EtlError::Cancelled),
                    err => {
                        warn!(error = %err, "dimension load rolled back");
                        Ok(LoadResult::rolled_back(&err))
                    }
                }
            }
        }
    }

    async fn apply(
        &self,
        set: &DimensionSet,
        tx: &mut Box<dyn WarehouseTx>,
        cancel: &CancellationToken,
    ) -> Result<LoadResult, EtlError> {
        let mut result = LoadResult::default();

        let customers = dedup(
            set.customers.iter().map(normalize_customer).collect::<Vec<DimCustomer>>(),
            |c| c.customer_id.clone(),
            &[has_real_email],
        );
        let existing = cancellable(cancel, tx.load_customers()).await?;
        let customers = plan(customers, existing, |c| c.customer_id.clone(), |old, new| {
            old.name != new.name || old.email != new.email
        });
        result.customers = customers.counts();
        cancellable(cancel, tx.insert_customers(&customers.inserts)).await?;
        cancellable(cancel, tx.update_customers(&customers.updates)).await?;

        let products = dedup(
            set.products.iter().map(normalize_product).collect::<Vec<DimProduct>>(),
            |p| p.product_id.clone(),
            &[has_real_category, has_any_category],
        );
        let existing = cancellable(cancel, tx.load_products()).await?;
        let products = plan(products, existing, |p| p.product_id.clone(), |old, new| {
            old.name != new.name || old.category != new.category || old.subcategory != new.subcategory
        });
        result.products = products.counts();
        cancellable(cancel, tx.insert_products(&products.inserts)).await?;
        cancellable(cancel, tx.update_products(&products.updates)).await?;

        let sources = dedup(
            set.sources.iter().map(normalize_source).collect::<Vec<DimSource>>(),
            |s| s.source_id.clone(),
            &[],
        );
        let existing = cancellable(cancel, tx.load_sources()).await?;
        let mut sources = plan(sources, existing, |s| s.source_id.clone(), |old, new| {
            old.name != new.name || old.kind != new.kind
        });
        let now = Utc::now();
        sources.inserts.iter_mut().for_each(|s| s.loaded_at = Some(now));
        sources.updates.iter_mut().for_each(|s| s.row.loaded_at = Some(now));
        result.sources = sources.counts();
        cancellable(cancel, tx.insert_sources(&sources.inserts)).await?;
        cancellable(cancel, tx.update_sources(&sources.updates)).await?;

        let sentiments = dedup(
            set.sentiments.iter().map(normalize_sentiment).collect::<Vec<DimSentiment>>(),
            |s| s.label.clone(),
            &[],
        );
        let existing = cancellable(cancel, tx.load_sentiments()).await?;
        let sentiments = plan(sentiments, existing, |s| s.label.clone(), |old, new| {
            old.description != new.description || old.weight != new.weight
        });
        result.sentiments = sentiments.counts();
        cancellable(cancel, tx.insert_sentiments(&sentiments.inserts)).await?;
        cancellable(cancel, tx.update_sentiments(&sentiments.updates)).await?;

        let dates = dedup(
            set.dates.iter().map(|d| DimDate::from_date(d.date)).collect::<Vec<DimDate>>(),
            |d| d.date_key.to_string(),
            &[],
        );
        let existing: Vec<Keyed<DimDate>> = cancellable(cancel, tx.load_dates())
            .await?
            .into_iter()
            .map(|d| Keyed {
                key: d.date_key,
                row: d,
            })
            .collect();
        let dates = plan(dates, existing, |d| d.date_key.to_string(), |old, new| old != new);
        result.dates = dates.counts();
        let date_updates: Vec<DimDate> = dates.updates.into_iter().map(|k| k.row).collect();
        cancellable(cancel, tx.insert_dates(&dates.inserts)).await?;
        cancellable(cancel, tx.update_dates(&date_updates)).await?;

        for (dimension, counts) in [
            ("customer", result.customers),
            ("product", result.products),
            ("source", result.sources),
            ("sentiment", result.sentiments),
            ("date", result.dates),
        ] {
            info!(dimension, inserted = counts.inserted, updated = counts.updated, "dimension reconciled");
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use opinion_core::{SentimentLabel, SourceTag};
    use opinion_store::{FailPoint, MemoryWarehouse};

    fn customer(id: &str, name: &str, email: Option<&str>) -> DimCustomer {
        DimCustomer {
            customer_id: id.to_string(),
            name: name.to_string(),
            email: email.map(str::to_string),
        }
    }

    fn product(id: &str, category: Option<&str>) -> DimProduct {
        DimProduct {
            product_id: id.to_string(),
            name: format!("Producto {id}"),
            category: category.map(str::to_string),
            subcategory: None,
        }
    }

    fn set() -> DimensionSet {
        DimensionSet {
            customers: vec![customer("1", "Ana", Some("ana@x.io")), customer("2", "Luis", None)],
            products: vec![product("42", Some("Electronics")), product("7", None)],
            sources: vec![DimSource::for_tag(SourceTag::Csv)],
            sentiments: SentimentLabel::ALL.into_iter().map(DimSentiment::from).collect(),
            dates: vec![DimDate::from_date(NaiveDate::from_ymd_opt(2024, 3, 7).unwrap())],
            processed_records: 2,
            processed_sources: vec!["CSV".to_string()],
            validation_errors: Vec::new(),
            mapped_at: Utc::now(),
        }
    }

    fn engine(store: &MemoryWarehouse) -> DimensionUpsertEngine {
        DimensionUpsertEngine::new(Arc::new(store.clone()))
    }

    #[tokio::test]
    async fn second_load_of_the_same_set_changes_nothing() {
        let store = MemoryWarehouse::new();
        let cancel = CancellationToken::new();

        let first = engine(&store).load_dimensions(&set(), &cancel).await.unwrap();
        assert!(first.is_success());
        assert_eq!(first.customers.inserted, 2);
        assert_eq!(first.products.inserted, 2);
        assert_eq!(first.sentiments.inserted, 3);
        assert_eq!(first.total_inserted(), 9);

        let second = engine(&store).load_dimensions(&set(), &cancel).await.unwrap();
        assert!(second.is_success());
        assert_eq!(second.total_inserted(), 0);
        assert_eq!(second.total_updated(), 0);
    }

    #[tokio::test]
    async fn defaults_fill_blank_optional_text() {
        let store = MemoryWarehouse::new();
        engine(&store)
            .load_dimensions(&set(), &CancellationToken::new())
            .await
            .unwrap();

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.customer("2").unwrap().row.email.as_deref(), Some(NO_EMAIL));
        let seven = &snapshot.product("7").unwrap().row;
        assert_eq!(seven.category.as_deref(), Some(NO_CATEGORY));
        assert_eq!(seven.subcategory.as_deref(), Some(NO_SUBCATEGORY));
        assert!(snapshot.sources[0].row.loaded_at.is_some());
        assert_eq!(snapshot.dates[0].date_key, 20240307);
    }

    #[tokio::test]
    async fn only_changed_tracked_fields_count_as_updates() {
        let store = MemoryWarehouse::new();
        let cancel = CancellationToken::new();
        engine(&store).load_dimensions(&set(), &cancel).await.unwrap();

        let mut changed = set();
        changed.products[1].category = Some("Hogar".to_string());
        changed.customers[1].email = Some("luis@x.io".to_string());
        let result = engine(&store).load_dimensions(&changed, &cancel).await.unwrap();

        assert_eq!(result.products, DimensionCounts { inserted: 0, updated: 1 });
        assert_eq!(result.customers, DimensionCounts { inserted: 0, updated: 1 });
        assert_eq!(result.sources, DimensionCounts::default());

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.product("7").unwrap().row.category.as_deref(), Some("Hogar"));
        assert_eq!(snapshot.customer("2").unwrap().row.email.as_deref(), Some("luis@x.io"));
    }

    #[tokio::test]
    async fn duplicates_keep_the_most_informative_row() {
        let store = MemoryWarehouse::new();
        let mut input = set();
        input.products = vec![product("p9", Some("Sin Categoría")), product("P9", Some("Hogar"))];
        input.customers = vec![customer("web_ana", "Ana", None), customer("WEB_ANA", "Ana", Some("a@x.io"))];

        let result = engine(&store)
            .load_dimensions(&input, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.products.inserted, 1);
        assert_eq!(result.customers.inserted, 1);

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.product("P9").unwrap().row.category.as_deref(), Some("Hogar"));
        assert_eq!(snapshot.customer("web_ana").unwrap().row.email.as_deref(), Some("a@x.io"));
    }

    #[tokio::test]
    async fn natural_keys_are_stored_upper_case() {
        let store = MemoryWarehouse::new();
        let mut input = set();
        input.customers.push(customer(" api_Ana_López ", "Ana", None));
        input.products.push(product("x9b", None));

        engine(&store)
            .load_dimensions(&input, &CancellationToken::new())
            .await
            .unwrap();

        let snapshot = store.snapshot().await;
        let customers: Vec<&str> = snapshot.customers.iter().map(|c| c.row.customer_id.as_str()).collect();
        assert_eq!(customers, vec!["1", "2", "API_ANA_LOPEZ"]);
        assert!(snapshot.products.iter().all(|p| p.row.product_id == p.row.product_id.to_uppercase()));
        assert!(snapshot.product("X9B").is_some_and(|p| p.row.product_id == "X9B"));
        assert_eq!(snapshot.sources[0].row.source_id, "CSV");
        assert!(snapshot.sentiment("Positivo").is_some_and(|s| s.row.label == "Positivo"));
    }

    #[tokio::test]
    async fn any_failure_rolls_back_every_dimension() {
        let store = MemoryWarehouse::new();
        store.fail_on(FailPoint::InsertDates).await;

        let result = engine(&store)
            .load_dimensions(&set(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.is_success());
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.total_inserted(), 0);

        let snapshot = store.snapshot().await;
        assert!(snapshot.customers.is_empty());
        assert!(snapshot.products.is_empty());
        assert!(snapshot.sentiments.is_empty());
    }

    #[tokio::test]
    async fn cancelled_load_writes_nothing() {
        let store = MemoryWarehouse::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = engine(&store).load_dimensions(&set(), &cancel).await.unwrap_err();
        assert!(matches!(err, EtlError::Cancelled));
        assert!(store.snapshot().await.customers.is_empty());
    }
}
