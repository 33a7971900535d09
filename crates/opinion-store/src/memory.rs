//! In-process warehouse used by tests and dry runs.
//!
//! A transaction works on a private copy of the tables and swaps it in on
//! commit, which gives the same all-or-nothing visibility as the database.
//! Natural-key uniqueness and fact foreign keys are enforced like the
//! Postgres schema does.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use opinion_core::{
    normalize_natural_key, DimCustomer, DimDate, DimProduct, DimSentiment, DimSource,
    FactOpinion, Keyed,
};
use tokio::sync::Mutex;

use crate::{Result, StoreError, WarehouseStore, WarehouseTx};

/// Operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Begin,
    InsertCustomers,
    InsertProducts,
    InsertSources,
    InsertSentiments,
    InsertDates,
    UpdateProducts,
    InsertFacts,
    Commit,
    Truncate,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WarehouseSnapshot {
    pub customers: Vec<Keyed<DimCustomer>>,
    pub products: Vec<Keyed<DimProduct>>,
    pub sources: Vec<Keyed<DimSource>>,
    pub sentiments: Vec<Keyed<DimSentiment>>,
    pub dates: Vec<DimDate>,
    pub facts: Vec<FactOpinion>,
}

impl WarehouseSnapshot {
    pub fn customer(&self, natural_key: &str) -> Option<&Keyed<DimCustomer>> {
        let wanted = normalize_natural_key(natural_key);
        self.customers
            .iter()
            .find(|c| normalize_natural_key(&c.row.customer_id) == wanted)
    }

    pub fn product(&self, natural_key: &str) -> Option<&Keyed<DimProduct>> {
        let wanted = normalize_natural_key(natural_key);
        self.products
            .iter()
            .find(|p| normalize_natural_key(&p.row.product_id) == wanted)
    }

    pub fn sentiment(&self, label: &str) -> Option<&Keyed<DimSentiment>> {
        let wanted = normalize_natural_key(label);
        self.sentiments
            .iter()
            .find(|s| normalize_natural_key(&s.row.label) == wanted)
    }
}

#[derive(Debug, Default)]
struct Shared {
    tables: WarehouseSnapshot,
    fail_points: HashSet<FailPoint>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_on(&self, point: FailPoint) {
        self.shared.lock().await.fail_points.insert(point);
    }

    pub async fn clear_failures(&self) {
        self.shared.lock().await.fail_points.clear();
    }

    /// Committed state only.
    pub async fn snapshot(&self) -> WarehouseSnapshot {
        self.shared.lock().await.tables.clone()
    }

    /// Seeds committed rows directly, bypassing transactions.
    pub async fn seed(&self, tables: WarehouseSnapshot) {
        self.shared.lock().await.tables = tables;
    }
}

#[async_trait]
impl WarehouseStore for MemoryWarehouse {
    async fn begin(&self) -> Result<Box<dyn WarehouseTx>> {
        let shared = self.shared.lock().await;
        if shared.fail_points.contains(&FailPoint::Begin) {
            return Err(StoreError::Injected(FailPoint::Begin));
        }
        Ok(Box::new(MemoryTx {
            shared: Arc::clone(&self.shared),
            working: shared.tables.clone(),
            fail_points: shared.fail_points.clone(),
        }))
    }
}

struct MemoryTx {
    shared: Arc<Mutex<Shared>>,
    working: WarehouseSnapshot,
    fail_points: HashSet<FailPoint>,
}

impl MemoryTx {
    fn check(&self, point: FailPoint) -> Result<()> {
        if self.fail_points.contains(&point) {
            Err(StoreError::Injected(point))
        } else {
            Ok(())
        }
    }
}

fn next_key<T>(rows: &[Keyed<T>]) -> i32 {
    rows.iter().map(|r| r.key).max().unwrap_or(0) + 1
}

fn insert_keyed<T: Clone>(
    table: &'static str,
    existing: &mut Vec<Keyed<T>>,
    rows: &[T],
    natural_key: impl Fn(&T) -> String,
) -> Result<()> {
    let mut seen: HashSet<String> = existing
        .iter()
        .map(|r| normalize_natural_key(&natural_key(&r.row)))
        .collect();
    for row in rows {
        let key = normalize_natural_key(&natural_key(row));
        if !seen.insert(key.clone()) {
            return Err(StoreError::Duplicate { table, key });
        }
        let surrogate = next_key(existing);
        existing.push(Keyed {
            key: surrogate,
            row: row.clone(),
        });
    }
    Ok(())
}

fn update_keyed<T: Clone>(
    table: &'static str,
    existing: &mut [Keyed<T>],
    rows: &[Keyed<T>],
) -> Result<()> {
    for row in rows {
        let slot = existing
            .iter_mut()
            .find(|r| r.key == row.key)
            .ok_or(StoreError::NotFound {
                table,
                key: row.key,
            })?;
        slot.row = row.row.clone();
    }
    Ok(())
}

#[async_trait]
impl WarehouseTx for MemoryTx {
    async fn load_customers(&mut self) -> Result<Vec<Keyed<DimCustomer>>> {
        Ok(self.working.customers.clone())
    }

    async fn insert_customers(&mut self, rows: &[DimCustomer]) -> Result<()> {
        self.check(FailPoint::InsertCustomers)?;
        insert_keyed("dim_customer", &mut self.working.customers, rows, |r| {
            r.customer_id.clone()
        })
    }

    async fn update_customers(&mut self, rows: &[Keyed<DimCustomer>]) -> Result<()> {
        update_keyed("dim_customer", &mut self.working.customers, rows)
    }

    async fn load_products(&mut self) -> Result<Vec<Keyed<DimProduct>>> {
        Ok(self.working.products.clone())
    }

    async fn insert_products(&mut self, rows: &[DimProduct]) -> Result<()> {
        self.check(FailPoint::InsertProducts)?;
        insert_keyed("dim_product", &mut self.working.products, rows, |r| {
            r.product_id.clone()
        })
    }

    async fn update_products(&mut self, rows: &[Keyed<DimProduct>]) -> Result<()> {
        self.check(FailPoint::UpdateProducts)?;
        update_keyed("dim_product", &mut self.working.products, rows)
    }

    async fn load_sources(&mut self) -> Result<Vec<Keyed<DimSource>>> {
        Ok(self.working.sources.clone())
    }

    async fn insert_sources(&mut self, rows: &[DimSource]) -> Result<()> {
        self.check(FailPoint::InsertSources)?;
        insert_keyed("dim_source", &mut self.working.sources, rows, |r| {
            r.source_id.clone()
        })
    }

    async fn update_sources(&mut self, rows: &[Keyed<DimSource>]) -> Result<()> {
        update_keyed("dim_source", &mut self.working.sources, rows)
    }

    async fn load_sentiments(&mut self) -> Result<Vec<Keyed<DimSentiment>>> {
        Ok(self.working.sentiments.clone())
    }

    async fn insert_sentiments(&mut self, rows: &[DimSentiment]) -> Result<()> {
        self.check(FailPoint::InsertSentiments)?;
        insert_keyed("dim_sentiment", &mut self.working.sentiments, rows, |r| {
            r.label.clone()
        })
    }

    async fn update_sentiments(&mut self, rows: &[Keyed<DimSentiment>]) -> Result<()> {
        update_keyed("dim_sentiment", &mut self.working.sentiments, rows)
    }

    async fn load_dates(&mut self) -> Result<Vec<DimDate>> {
        Ok(self.working.dates.clone())
    }

    async fn insert_dates(&mut self, rows: &[DimDate]) -> Result<()> {
        self.check(FailPoint::InsertDates)?;
        for row in rows {
            if self.working.dates.iter().any(|d| d.date_key == row.date_key) {
                return Err(StoreError::Duplicate {
                    table: "dim_date",
                    key: row.date_key.to_string(),
                });
            }
            self.working.dates.push(row.clone());
        }
        Ok(())
    }

    async fn update_dates(&mut self, rows: &[DimDate]) -> Result<()> {
        for row in rows {
            let slot = self
                .working
                .dates
                .iter_mut()
                .find(|d| d.date_key == row.date_key)
                .ok_or(StoreError::NotFound {
                    table: "dim_date",
                    key: row.date_key,
                })?;
            *slot = row.clone();
        }
        Ok(())
    }

    async fn truncate_facts(&mut self) -> Result<()> {
        self.check(FailPoint::Truncate)?;
        self.working.facts.clear();
        Ok(())
    }

    async fn delete_all_facts(&mut self) -> Result<u64> {
        let deleted = self.working.facts.len() as u64;
        self.working.facts.clear();
        Ok(deleted)
    }

    async fn insert_facts(&mut self, rows: &[FactOpinion]) -> Result<u64> {
        self.check(FailPoint::InsertFacts)?;
        let w = &self.working;
        for fact in rows {
            let refs = [
                ("customer", fact.customer_key, w.customers.iter().any(|r| r.key == fact.customer_key)),
                ("product", fact.product_key, w.products.iter().any(|r| r.key == fact.product_key)),
                ("source", fact.source_key, w.sources.iter().any(|r| r.key == fact.source_key)),
                ("sentiment", fact.sentiment_key, w.sentiments.iter().any(|r| r.key == fact.sentiment_key)),
                ("date", fact.date_key, w.dates.iter().any(|d| d.date_key == fact.date_key)),
            ];
            if let Some((dimension, key, _)) = refs.into_iter().find(|(_, _, ok)| !ok) {
                return Err(StoreError::MissingReference { dimension, key });
            }
        }
        self.working.facts.extend_from_slice(rows);
        Ok(rows.len() as u64)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.check(FailPoint::Commit)?;
        let mut shared = self.shared.lock().await;
        shared.tables = self.working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customer(id: &str) -> DimCustomer {
        DimCustomer {
            customer_id: id.to_string(),
            name: format!("Cliente {id}"),
            email: None,
        }
    }

    #[tokio::test]
    async fn inserts_assign_increasing_surrogate_keys() {
        let store = MemoryWarehouse::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_customers(&[customer("1"), customer("2")]).await.unwrap();
        tx.commit().await.unwrap();

        let snap = store.snapshot().await;
        let keys: Vec<i32> = snap.customers.iter().map(|c| c.key).collect();
        assert_eq!(keys, vec![1, 2]);
        assert_eq!(snap.customer("2").unwrap().key, 2);
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible() {
        let store = MemoryWarehouse::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_customers(&[customer("1")]).await.unwrap();
        assert!(store.snapshot().await.customers.is_empty());
        tx.rollback().await.unwrap();
        assert!(store.snapshot().await.customers.is_empty());
    }

    #[tokio::test]
    async fn duplicate_natural_keys_are_rejected_case_insensitively() {
        let store = MemoryWarehouse::new();
        let mut tx = store.begin().await.unwrap();
        let err = tx
            .insert_customers(&[customer("web_ana"), customer("WEB_ANA")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { table: "dim_customer", .. }));
    }

    #[tokio::test]
    async fn facts_must_reference_existing_dimensions() {
        let store = MemoryWarehouse::new();
        let mut tx = store.begin().await.unwrap();
        let err = tx
            .insert_facts(&[FactOpinion {
                customer_key: 1,
                product_key: 1,
                source_key: 1,
                sentiment_key: 1,
                date_key: 20240101,
                rating: rust_decimal::Decimal::from(3),
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingReference { dimension: "customer", key: 1 }));
    }

    #[tokio::test]
    async fn injected_truncate_failure_leaves_delete_available() {
        let store = MemoryWarehouse::new();
        store.fail_on(FailPoint::Truncate).await;
        let mut tx = store.begin().await.unwrap();
        assert!(tx.truncate_facts().await.is_err());
        assert_eq!(tx.delete_all_facts().await.unwrap(), 0);
        tx.commit().await.unwrap();
    }
}
