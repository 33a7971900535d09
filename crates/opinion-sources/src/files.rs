//! CSV readers: survey export and the product/customer master files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use opinion_core::{non_blank, CustomerMaster, ProductMaster, SurveyRecord};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{SourceError, SourceReader};

#[derive(Debug, Deserialize)]
struct SurveyRow {
    #[serde(rename = "IdOpinion", alias = "id_opinion", alias = "idOpinion")]
    opinion_id: i64,
    #[serde(rename = "IdCliente", alias = "id_cliente", alias = "idCliente")]
    customer_id: i64,
    #[serde(rename = "IdProducto", alias = "id_producto", alias = "idProducto")]
    product_id: String,
    #[serde(rename = "Fecha", alias = "fecha")]
    date: String,
    #[serde(rename = "Comentario", alias = "comentario", default)]
    comment: String,
    #[serde(
        rename = "Clasificación",
        alias = "Clasificacion",
        alias = "clasificacion",
        default
    )]
    classification: String,
    #[serde(
        rename = "PuntajeSatisfacción",
        alias = "PuntajeSatisfaccion",
        alias = "puntaje_satisfaccion",
        default,
        deserialize_with = "csv::invalid_option"
    )]
    satisfaction: Option<i32>,
    #[serde(rename = "Fuente", alias = "fuente", default)]
    channel: String,
}

#[derive(Debug, Deserialize)]
struct ProductRow {
    #[serde(rename = "IdProducto")]
    product_id: String,
    #[serde(rename = "Nombre", default)]
    name: String,
    #[serde(rename = "Categoría", alias = "Categoria", default)]
    category: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CustomerRow {
    #[serde(rename = "IdCliente")]
    customer_id: i64,
    #[serde(rename = "Nombre", default)]
    name: String,
    #[serde(rename = "Email", default)]
    email: Option<String>,
    #[serde(rename = "Telefono", default)]
    phone: Option<String>,
    #[serde(rename = "Ciudad", default)]
    city: Option<String>,
    #[serde(rename = "FechaRegistro", default)]
    registered_on: Option<String>,
}

/// Accepts `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS` and `DD/MM/YYYY`.
pub(crate) fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|dt| dt.date()))
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S").map(|dt| dt.date()))
        .or_else(|_| NaiveDate::parse_from_str(raw, "%d/%m/%Y"))
        .ok()
}

async fn read_text(path: &Path) -> Result<String, SourceError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Deserializes every row, skipping the ones that do not parse.
fn parse_rows<R: DeserializeOwned>(content: &str, label: &str) -> Vec<R> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.trim_start_matches('\u{feff}').as_bytes());

    let mut rows = Vec::new();
    for (index, result) in reader.deserialize::<R>().enumerate() {
        match result {
            Ok(row) => rows.push(row),
            Err(err) => warn!(file = label, line = index + 2, error = %err, "skipping csv row"),
        }
    }
    rows
}

/// Internal survey export (`IdOpinion,IdCliente,IdProducto,Fecha,...`).
#[derive(Debug, Clone)]
pub struct SurveyCsvReader {
    path: PathBuf,
}

impl SurveyCsvReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SourceReader<SurveyRecord> for SurveyCsvReader {
    fn name(&self) -> &'static str {
        "CSV"
    }

    async fn read_all(&self) -> Result<Vec<SurveyRecord>, SourceError> {
        let content = read_text(&self.path).await?;
        let label = self.path.display().to_string();
        let mut out = Vec::new();
        for row in parse_rows::<SurveyRow>(&content, &label) {
            let Some(date) = parse_date(&row.date) else {
                warn!(opinion_id = row.opinion_id, date = %row.date, "survey row has an unreadable date");
                continue;
            };
            out.push(SurveyRecord {
                opinion_id: row.opinion_id,
                customer_id: row.customer_id,
                product_id: row.product_id,
                date,
                comment: row.comment,
                classification: row.classification,
                satisfaction: row.satisfaction,
                channel: row.channel,
            });
        }
        debug!(file = %label, records = out.len(), "survey csv read");
        Ok(out)
    }
}

/// `productos.csv`. A missing file is an empty master, not an error.
#[derive(Debug, Clone)]
pub struct ProductMasterReader {
    path: PathBuf,
}

impl ProductMasterReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SourceReader<ProductMaster> for ProductMasterReader {
    fn name(&self) -> &'static str {
        "ProductosMaestros"
    }

    async fn read_all(&self) -> Result<Vec<ProductMaster>, SourceError> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            debug!(file = %self.path.display(), "product master not present");
            return Ok(Vec::new());
        }
        let content = read_text(&self.path).await?;
        let rows = parse_rows::<ProductRow>(&content, &self.path.display().to_string());
        Ok(rows
            .into_iter()
            .map(|row| ProductMaster {
                product_id: row.product_id,
                name: row.name,
                category: non_blank(row.category.as_deref()),
            })
            .collect())
    }
}

/// `clientes.csv`. A missing file is an empty master, not an error.
#[derive(Debug, Clone)]
pub struct CustomerMasterReader {
    path: PathBuf,
}

impl CustomerMasterReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SourceReader<CustomerMaster> for CustomerMasterReader {
    fn name(&self) -> &'static str {
        "ClientesMaestros"
    }

    async fn read_all(&self) -> Result<Vec<CustomerMaster>, SourceError> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            debug!(file = %self.path.display(), "customer master not present");
            return Ok(Vec::new());
        }
        let content = read_text(&self.path).await?;
        let rows = parse_rows::<CustomerRow>(&content, &self.path.display().to_string());
        Ok(rows
            .into_iter()
            .map(|row| CustomerMaster {
                customer_id: row.customer_id,
                name: row.name,
                email: non_blank(row.email.as_deref()),
                phone: non_blank(row.phone.as_deref()),
                city: non_blank(row.city.as_deref()),
                registered_on: row.registered_on.as_deref().and_then(parse_date),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn survey_rows_parse_with_accented_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "encuestas.csv",
            "IdOpinion,IdCliente,IdProducto,Fecha,Comentario,Clasificación,PuntajeSatisfacción,Fuente\n\
             1,10,P42,2024-03-07,Muy bueno,Positiva,5,Web\n\
             2,11,7,2024-03-08,Regular,Neutral,,Tienda\n",
        );

        let records = SurveyCsvReader::new(&path).read_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].product_id, "P42");
        assert_eq!(records[0].satisfaction, Some(5));
        assert_eq!(records[0].classification, "Positiva");
        assert_eq!(records[1].satisfaction, None);
        assert_eq!(records[1].date, NaiveDate::from_ymd_opt(2024, 3, 8).unwrap());
    }

    #[tokio::test]
    async fn unreadable_survey_rows_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "encuestas.csv",
            "IdOpinion,IdCliente,IdProducto,Fecha,Comentario,Clasificacion,PuntajeSatisfaccion,Fuente\n\
             x,10,1,2024-03-07,a,Positivo,5,Web\n\
             2,10,1,not-a-date,b,Positivo,5,Web\n\
             3,10,1,07/03/2024,c,Negativo,abc,Web\n",
        );

        let records = SurveyCsvReader::new(&path).read_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].opinion_id, 3);
        assert_eq!(records[0].satisfaction, None);
    }

    #[tokio::test]
    async fn missing_survey_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = SurveyCsvReader::new(dir.path().join("nope.csv"))
            .read_all()
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Io { .. }));
    }

    #[tokio::test]
    async fn missing_master_files_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        let products = ProductMasterReader::new(dir.path().join("productos.csv"))
            .read_all()
            .await
            .unwrap();
        let customers = CustomerMasterReader::new(dir.path().join("clientes.csv"))
            .read_all()
            .await
            .unwrap();
        assert!(products.is_empty());
        assert!(customers.is_empty());
    }

    #[tokio::test]
    async fn master_files_blank_optional_fields_become_none() {
        let dir = tempfile::tempdir().unwrap();
        let products = write_file(
            &dir,
            "productos.csv",
            "IdProducto,Nombre,Categoría\n42,Auriculares,Electronics\n43,Cable,\n",
        );
        let customers = write_file(
            &dir,
            "clientes.csv",
            "IdCliente,Nombre,Email,Telefono,Ciudad,FechaRegistro\n10,Ana,,555,Lima,2023-01-02\n",
        );

        let products = ProductMasterReader::new(products).read_all().await.unwrap();
        assert_eq!(products[0].category.as_deref(), Some("Electronics"));
        assert_eq!(products[1].category, None);

        let customers = CustomerMasterReader::new(customers).read_all().await.unwrap();
        assert_eq!(customers[0].email, None);
        assert_eq!(customers[0].city.as_deref(), Some("Lima"));
        assert_eq!(
            customers[0].registered_on,
            Some(NaiveDate::from_ymd_opt(2023, 1, 2).unwrap())
        );
    }
}
