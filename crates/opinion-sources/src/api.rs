//! Social comments over HTTP, with retry/backoff and a time-limited cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use opinion_core::SocialComment;
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};

use crate::{SourceError, SourceReader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn with_retries(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Last successful API snapshot plus its expiry.
#[derive(Debug)]
pub struct CommentCache {
    comments: Option<Vec<SocialComment>>,
    refreshed: Option<Instant>,
    refreshed_at: Option<DateTime<Utc>>,
    ttl: Duration,
}

impl CommentCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            comments: None,
            refreshed: None,
            refreshed_at: None,
            ttl,
        }
    }

    pub fn is_fresh(&self) -> bool {
        match (&self.comments, self.refreshed) {
            (Some(_), Some(at)) => at.elapsed() < self.ttl,
            _ => false,
        }
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.refreshed_at
    }

    pub fn snapshot(&self) -> Option<&[SocialComment]> {
        self.comments.as_deref()
    }

    pub fn store(&mut self, comments: Vec<SocialComment>) {
        self.comments = Some(comments);
        self.refreshed = Some(Instant::now());
        self.refreshed_at = Some(Utc::now());
    }

    /// Forces the next read to hit the API; the snapshot stays available as a fallback.
    pub fn invalidate(&mut self) {
        self.refreshed = None;
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SocialCommentDto {
    #[serde(alias = "IdComment")]
    id_comment: i64,
    #[serde(default, alias = "IdCliente")]
    id_cliente: Option<i64>,
    #[serde(alias = "IdProducto", deserialize_with = "id_as_text")]
    id_producto: String,
    #[serde(default, alias = "Fuente")]
    fuente: Option<String>,
    #[serde(alias = "Fecha")]
    fecha: String,
    #[serde(default, alias = "Comentario")]
    comentario: Option<String>,
    #[serde(default, alias = "ClienteNombre")]
    cliente_nombre: Option<String>,
    #[serde(default, alias = "ClienteEmail")]
    cliente_email: Option<String>,
    #[serde(default, alias = "ProductoNombre")]
    producto_nombre: Option<String>,
    #[serde(default, alias = "ProductoCategoria")]
    producto_categoria: Option<String>,
}

fn id_as_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) => Ok(s),
        JsonValue::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected product id, got {other}"
        ))),
    }
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn into_comments(dtos: Vec<SocialCommentDto>) -> Vec<SocialComment> {
    let mut out = Vec::with_capacity(dtos.len());
    for dto in dtos {
        let Some(date) = parse_timestamp(&dto.fecha) else {
            warn!(comment_id = dto.id_comment, fecha = %dto.fecha, "social comment has an unreadable date");
            continue;
        };
        out.push(SocialComment {
            comment_id: dto.id_comment,
            customer_id: dto.id_cliente,
            customer_name: dto.cliente_nombre,
            customer_email: dto.cliente_email,
            product_id: dto.id_producto,
            product_name: dto.producto_nombre,
            product_category: dto.producto_categoria,
            channel: dto.fuente.unwrap_or_default(),
            date,
            comment: dto.comentario.unwrap_or_default(),
        });
    }
    out
}

/// Social comments endpoint behind a TTL cache.
///
/// A read inside the TTL is served from memory. An expired or empty cache
/// triggers a fetch; if that fetch fails and an older snapshot exists, the
/// old snapshot is returned instead of the error.
#[derive(Debug)]
pub struct SocialCommentApiReader {
    client: reqwest::Client,
    url: String,
    backoff: BackoffPolicy,
    cache: Mutex<CommentCache>,
    calls: AtomicU64,
}

impl SocialCommentApiReader {
    pub fn new(
        url: impl Into<String>,
        timeout: Duration,
        backoff: BackoffPolicy,
        cache_ttl: Duration,
    ) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            backoff,
            cache: Mutex::new(CommentCache::new(cache_ttl)),
            calls: AtomicU64::new(0),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.cache.lock().await.refreshed_at()
    }

    pub async fn invalidate(&self) {
        self.cache.lock().await.invalidate();
    }

    /// Fetches now regardless of cache age. Returns the number of comments cached.
    pub async fn refresh(&self) -> Result<usize, SourceError> {
        let comments = self.fetch().await?;
        let count = comments.len();
        self.cache.lock().await.store(comments);
        info!(url = %self.url, records = count, "social comment cache refreshed");
        Ok(count)
    }

    async fn fetch(&self) -> Result<Vec<SocialComment>, SourceError> {
        let span = info_span!("social_api_fetch", url = %self.url);
        async {
            let body = self.fetch_bytes().await?;
            let dtos: Vec<SocialCommentDto> = serde_json::from_slice(&body)?;
            Ok::<_, SourceError>(into_comments(dtos))
        }
        .instrument(span)
        .await
    }

    async fn fetch_bytes(&self) -> Result<Vec<u8>, SourceError> {
        let mut attempt = 0;
        loop {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let can_retry = attempt < self.backoff.max_retries;
            match self.client.get(&self.url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }
                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        warn!(status = status.as_u16(), attempt, "retrying social api");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(SourceError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        warn!(error = %err, attempt, "retrying social api");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(SourceError::Request(err));
                }
            }
        }
    }
}

#[async_trait]
impl SourceReader<SocialComment> for SocialCommentApiReader {
    fn name(&self) -> &'static str {
        "API"
    }

    async fn read_all(&self) -> Result<Vec<SocialComment>, SourceError> {
        {
            let cache = self.cache.lock().await;
            if cache.is_fresh() {
                if let Some(comments) = cache.snapshot() {
                    return Ok(comments.to_vec());
                }
            }
        }

        match self.fetch().await {
            Ok(comments) => {
                info!(url = %self.url, records = comments.len(), "social comments loaded");
                self.cache.lock().await.store(comments.clone());
                Ok(comments)
            }
            Err(err) => {
                let cache = self.cache.lock().await;
                match cache.snapshot() {
                    Some(stale) => {
                        warn!(error = %err, records = stale.len(), "social api unavailable, serving stale cache");
                        Ok(stale.to_vec())
                    }
                    None => Err(err),
                }
            }
        }
    }

    fn remote_calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}
