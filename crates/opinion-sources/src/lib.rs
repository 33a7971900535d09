//! Readers that turn the three opinion sources (plus the master-data files)
//! into typed records.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

mod api;
mod db;
mod files;

pub use api::{
    classify_reqwest_error, classify_status, BackoffPolicy, CommentCache, RetryDisposition,
    SocialCommentApiReader,
};
pub use db::{WebReviewDbReader, WEB_REVIEW_VIEW};
pub use files::{CustomerMasterReader, ProductMasterReader, SurveyCsvReader};

pub const CRATE_NAME: &str = "opinion-sources";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

/// One source of raw records. A reader is called once per pipeline run.
#[async_trait]
pub trait SourceReader<T: Send + 'static>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn read_all(&self) -> Result<Vec<T>, SourceError>;

    /// Remote requests issued so far. Only network-backed readers count.
    fn remote_calls(&self) -> u64 {
        0
    }
}
