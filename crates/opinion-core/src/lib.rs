//! Core domain model for the opinion warehouse: raw source records, conformed
//! dimension rows, fact rows and the key normalization shared by every stage.

use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

pub const CRATE_NAME: &str = "opinion-core";

/// Origin system of a raw record. The string form is the natural key of `DimSource`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceTag {
    Csv,
    SaocDb,
    SocialApi,
}

impl SourceTag {
    pub const ALL: [SourceTag; 3] = [SourceTag::Csv, SourceTag::SaocDb, SourceTag::SocialApi];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceTag::Csv => "CSV",
            SourceTag::SaocDb => "SAOC_DB",
            SourceTag::SocialApi => "SOCIAL_API",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            SourceTag::Csv => "Encuestas Internas CSV",
            SourceTag::SaocDb => "Base de Datos SAOC",
            SourceTag::SocialApi => "API de Comentarios Sociales",
        }
    }

    pub fn kind_label(self) -> &'static str {
        match self {
            SourceTag::Csv => "Archivo CSV",
            SourceTag::SaocDb => "Base de Datos Relacional",
            SourceTag::SocialApi => "API REST",
        }
    }

    /// Prefix for customer keys synthesized when a record carries no customer id.
    pub fn synthetic_prefix(self) -> &'static str {
        match self {
            SourceTag::Csv => "CSV",
            SourceTag::SaocDb => "WEB",
            SourceTag::SocialApi => "API",
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical sentiment labels. The string form is the natural key of `DimSentiment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SentimentLabel {
    Positive,
    Negative,
    Neutral,
}

impl SentimentLabel {
    pub const ALL: [SentimentLabel; 3] = [
        SentimentLabel::Positive,
        SentimentLabel::Neutral,
        SentimentLabel::Negative,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SentimentLabel::Positive => "Positivo",
            SentimentLabel::Negative => "Negativo",
            SentimentLabel::Neutral => "Neutral",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            SentimentLabel::Positive => "Comentario con connotación positiva",
            SentimentLabel::Negative => "Comentario con connotación negativa",
            SentimentLabel::Neutral => "Comentario sin connotación específica",
        }
    }

    pub fn weight(self) -> i32 {
        match self {
            SentimentLabel::Positive => 1,
            SentimentLabel::Negative => -1,
            SentimentLabel::Neutral => 0,
        }
    }

    /// Rating used for facts that carry no explicit score.
    pub fn derived_rating(self) -> Decimal {
        match self {
            SentimentLabel::Positive => Decimal::from(4),
            SentimentLabel::Negative => Decimal::from(1),
            SentimentLabel::Neutral => Decimal::from(3),
        }
    }

    /// Web reviews: 4-5 positive, 1-2 negative, anything else neutral.
    pub fn from_rating(rating: i32) -> Self {
        if rating >= 4 {
            SentimentLabel::Positive
        } else if rating <= 2 {
            SentimentLabel::Negative
        } else {
            SentimentLabel::Neutral
        }
    }

    /// Maps the free-form survey classification onto a canonical label.
    /// Unrecognized or blank input is neutral.
    pub fn normalize(raw: &str) -> Self {
        let lower = strip_diacritics(raw).trim().to_lowercase();
        match lower.as_str() {
            "positivo" | "positiva" | "pos" | "good" => SentimentLabel::Positive,
            "negativo" | "negativa" | "neg" | "bad" => SentimentLabel::Negative,
            _ => SentimentLabel::Neutral,
        }
    }
}

impl fmt::Display for SentimentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal survey row (`CSV`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyRecord {
    pub opinion_id: i64,
    pub customer_id: i64,
    pub product_id: String,
    pub date: NaiveDate,
    pub comment: String,
    pub classification: String,
    pub satisfaction: Option<i32>,
    pub channel: String,
}

/// Review row read from the operational database (`SAOC_DB`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebReview {
    pub review_id: i64,
    pub customer_id: Option<i64>,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub product_id: String,
    pub product_name: Option<String>,
    pub product_category: Option<String>,
    pub date: NaiveDateTime,
    pub comment: String,
    pub rating: i32,
}

/// Comment pulled from the social comments API (`SOCIAL_API`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocialComment {
    pub comment_id: i64,
    pub customer_id: Option<i64>,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub product_id: String,
    pub product_name: Option<String>,
    pub product_category: Option<String>,
    pub channel: String,
    pub date: NaiveDateTime,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductMaster {
    pub product_id: String,
    pub name: String,
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerMaster {
    pub customer_id: i64,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub city: Option<String>,
    pub registered_on: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimCustomer {
    pub customer_id: String,
    pub name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimProduct {
    pub product_id: String,
    pub name: String,
    pub category: Option<String>,
    pub subcategory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimSource {
    pub source_id: String,
    pub name: String,
    pub kind: String,
    pub loaded_at: Option<DateTime<Utc>>,
}

impl DimSource {
    pub fn for_tag(tag: SourceTag) -> Self {
        Self {
            source_id: tag.as_str().to_string(),
            name: tag.display_name().to_string(),
            kind: tag.kind_label().to_string(),
            loaded_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimSentiment {
    pub label: String,
    pub description: Option<String>,
    pub weight: i32,
}

impl From<SentimentLabel> for DimSentiment {
    fn from(label: SentimentLabel) -> Self {
        Self {
            label: label.as_str().to_string(),
            description: Some(label.description().to_string()),
            weight: label.weight(),
        }
    }
}

/// Calendar row. `date_key` is both natural and surrogate key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimDate {
    pub date_key: i32,
    pub date: NaiveDate,
    pub year: i32,
    pub quarter: u32,
    pub month: u32,
    pub month_name: String,
    pub iso_week: u32,
    pub day: u32,
}

impl DimDate {
    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            date_key: date_key(date),
            date,
            year: date.year(),
            quarter: (date.month() - 1) / 3 + 1,
            month: date.month(),
            month_name: month_name(date.month()).to_string(),
            iso_week: date.iso_week().week(),
            day: date.day(),
        }
    }
}

/// A persisted dimension row together with its warehouse-assigned surrogate key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyed<T> {
    pub key: i32,
    pub row: T,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactOpinion {
    pub customer_key: i32,
    pub product_key: i32,
    pub source_key: i32,
    pub sentiment_key: i32,
    pub date_key: i32,
    pub rating: Decimal,
}

/// `YYYYMMDD` as an integer.
pub fn date_key(date: NaiveDate) -> i32 {
    date.year() * 10000 + date.month() as i32 * 100 + date.day() as i32
}

pub fn month_name(month: u32) -> &'static str {
    match month {
        1 => "January",
        2 => "February",
        3 => "March",
        4 => "April",
        5 => "May",
        6 => "June",
        7 => "July",
        8 => "August",
        9 => "September",
        10 => "October",
        11 => "November",
        12 => "December",
        _ => "",
    }
}

/// Decomposes and drops combining marks: "Categoría" -> "Categoria".
pub fn strip_diacritics(input: &str) -> String {
    input.nfd().filter(|c| !is_combining_mark(*c)).nfc().collect()
}

/// Trim + diacritics removal. Blank input collapses to the empty string.
pub fn normalize_text(input: &str) -> String {
    strip_diacritics(input.trim())
}

/// Case-insensitive natural keys are stored upper-cased.
pub fn normalize_natural_key(input: &str) -> String {
    normalize_text(input).to_uppercase()
}

/// Product ids arrive as `42`, `P42` or `p42`; all three are product `42`.
pub fn normalize_product_id(input: &str) -> String {
    let trimmed = input.trim();
    let stripped = trimmed
        .strip_prefix('P')
        .or_else(|| trimmed.strip_prefix('p'))
        .unwrap_or(trimmed);
    stripped.to_uppercase()
}

/// `WEB_ANA_LOPEZ` style key for records without a customer id. `None` when the
/// record has no usable name either.
pub fn synthetic_customer_key(tag: SourceTag, name: Option<&str>) -> Option<String> {
    let sanitized = name?.split_whitespace().collect::<Vec<_>>().join("_");
    if sanitized.is_empty() {
        return None;
    }
    Some(normalize_natural_key(&format!(
        "{}_{}",
        tag.synthetic_prefix(),
        sanitized
    )))
}

pub fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}

/// Trimmed value, or `None` for missing/blank input.
pub fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}
