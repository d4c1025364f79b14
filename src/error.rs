//! Typed errors for the crawl pipeline.
//!
//! Library code returns these enums; the binary wraps them in `anyhow` at the edges.

use std::time::Duration;

use thiserror::Error;

use crate::models::Region;

/// Errors raised by a listing source while crawling.
#[derive(Debug, Error)]
pub enum ScrapeError {
    /// Request could not be sent or the body could not be read
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Site answered with a non-success status
    #[error("{source_name} returned status {status}")]
    Status { source_name: &'static str, status: u16 },

    /// Site is throttling us (HTTP 429 or a challenge page)
    #[error("{source_name} rate limited the crawler")]
    RateLimited {
        source_name: &'static str,
        retry_after: Option<Duration>,
    },

    /// A single listing could not be mapped; the rest of the page is still usable
    #[error("unparseable listing from {source_name}: {reason}")]
    Parse {
        source_name: &'static str,
        reason: String,
    },

    /// The search filter cannot be expressed on this site
    #[error("{source_name} cannot search for {reason}")]
    UnsupportedFilter {
        source_name: &'static str,
        reason: String,
    },

    /// Headless browser failure
    #[error("browser error: {0}")]
    Browser(String),

    /// Local I/O failure (replay files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON payload could not be decoded as a whole
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Shutdown was requested while crawling
    #[error("crawl cancelled")]
    Cancelled,
}

impl ScrapeError {
    /// Listing-level errors are skipped; everything else ends the run.
    pub fn is_item_level(&self) -> bool {
        matches!(self, Self::Parse { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// Errors raised by the SQLite stores.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A natural-key row vanished between insert and re-query
    #[error("reference data conflict on {entity} '{key}'")]
    Conflict { entity: &'static str, key: String },

    /// A stored value could not be decoded
    #[error("corrupt {column} value: {value}")]
    Corrupt { column: &'static str, value: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StorageError {
    /// True when the database rejected a row because of a unique constraint.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(e)) => e.is_unique_violation(),
            _ => false,
        }
    }

    /// True for SQLITE_BUSY and SQLITE_LOCKED, including their extended codes.
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(e)) => e
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .is_some_and(|code| matches!(code & 0xff, 5 | 6)),
            _ => false,
        }
    }
}

/// Errors raised by the search queue registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid search criteria: {0}")]
    InvalidCriteria(String),

    #[error("crawl task {0} not found")]
    TaskNotFound(i64),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<sqlx::Error> for RegistryError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(StorageError::Database(e))
    }
}

/// Task-level failure caught at the scheduler boundary.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("region {region}: {source}")]
    Scrape {
        region: Region,
        #[source]
        source: ScrapeError,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("no adapter registered for regions {0:?}")]
    NoAdapter(Vec<Region>),

    /// The task filter points at a brand or model that does not exist
    #[error("unknown {entity} id {id}")]
    UnknownReference { entity: &'static str, id: i64 },

    #[error("crawl cancelled")]
    Cancelled,
}

impl CrawlError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Scrape { source, .. } if source.is_rate_limited())
    }
}
