//! SQLite persistence.
//!
//! [`Database`] owns the pool and the schema. [`TaskStore`] persists crawl tasks
//! and demand links, [`StorageWriter`] persists reference entities and listings.

pub mod listings;
pub mod tasks;

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::StorageError;

pub use listings::{ConvertedPrice, PriceHistoryEntry, StorageWriter, UpsertOutcome};
pub use tasks::TaskStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS brands (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE COLLATE NOCASE,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS models (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    brand_id INTEGER NOT NULL REFERENCES brands(id),
    name TEXT NOT NULL COLLATE NOCASE,
    created_at INTEGER NOT NULL,
    UNIQUE (brand_id, name)
);

CREATE TABLE IF NOT EXISTS markets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    region TEXT NOT NULL UNIQUE COLLATE NOCASE,
    name TEXT NOT NULL,
    currency TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS dealers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    market_id INTEGER NOT NULL REFERENCES markets(id),
    name TEXT NOT NULL COLLATE NOCASE,
    created_at INTEGER NOT NULL,
    UNIQUE (market_id, name)
);

CREATE TABLE IF NOT EXISTS data_sources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL COLLATE NOCASE,
    country TEXT NOT NULL COLLATE NOCASE,
    base_url TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE (name, country)
);

CREATE TABLE IF NOT EXISTS listings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_url TEXT NOT NULL UNIQUE,
    brand_id INTEGER NOT NULL REFERENCES brands(id),
    model_id INTEGER NOT NULL REFERENCES models(id),
    market_id INTEGER NOT NULL REFERENCES markets(id),
    dealer_id INTEGER REFERENCES dealers(id),
    data_source_id INTEGER NOT NULL REFERENCES data_sources(id),
    year INTEGER NOT NULL,
    price TEXT NOT NULL,
    currency TEXT NOT NULL,
    converted_price TEXT NOT NULL,
    converted_currency TEXT NOT NULL,
    mileage INTEGER,
    city TEXT,
    country TEXT,
    image_url TEXT,
    available INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    updated_at INTEGER,
    sold_at INTEGER
);

CREATE TABLE IF NOT EXISTS price_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    listing_id INTEGER NOT NULL REFERENCES listings(id),
    old_price TEXT NOT NULL,
    old_currency TEXT NOT NULL,
    new_price TEXT NOT NULL,
    new_currency TEXT NOT NULL,
    recorded_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_price_history_listing ON price_history(listing_id);

CREATE TABLE IF NOT EXISTS crawl_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filter_key TEXT NOT NULL UNIQUE,
    brand_id INTEGER,
    model_id INTEGER,
    generation TEXT,
    year_from INTEGER NOT NULL,
    year_to INTEGER NOT NULL,
    regions TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    priority INTEGER NOT NULL DEFAULT 0 CHECK (priority >= 0),
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER,
    last_parsed_at INTEGER,
    next_parse_at INTEGER,
    last_error TEXT,
    lease_owner TEXT,
    lease_expires_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_crawl_tasks_due ON crawl_tasks(status, next_parse_at);

CREATE TABLE IF NOT EXISTS demand_links (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    search_id INTEGER NOT NULL,
    task_id INTEGER NOT NULL REFERENCES crawl_tasks(id),
    new_listings_pending INTEGER NOT NULL DEFAULT 0,
    price_drop_pending INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER,
    UNIQUE (search_id, task_id)
);

CREATE INDEX IF NOT EXISTS idx_demand_links_task ON demand_links(task_id);
"#;

/// Shared connection pool with the schema applied
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `config.url`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout());

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        info!(url = %config.url, "Database ready");
        Ok(db)
    }

    /// Ephemeral database on a single pinned connection (for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn tasks(&self) -> TaskStore {
        TaskStore::new(self.pool.clone())
    }

    pub fn writer(&self) -> StorageWriter {
        StorageWriter::new(self.pool.clone())
    }
}

/// Open a transaction that takes the write lock up front.
///
/// A deferred transaction that reads before writing cannot upgrade its lock while
/// another connection writes, and SQLite fails it without waiting. `IMMEDIATE`
/// queues writers on the busy timeout instead.
pub(crate) async fn begin_write(pool: &SqlitePool) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
    pool.begin_with("BEGIN IMMEDIATE").await
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(column: &'static str, millis: i64) -> Result<DateTime<Utc>, StorageError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StorageError::Corrupt {
            column,
            value: millis.to_string(),
        })
}

pub(crate) fn opt_from_millis(
    column: &'static str,
    millis: Option<i64>,
) -> Result<Option<DateTime<Utc>>, StorageError> {
    millis.map(|m| from_millis(column, m)).transpose()
}

pub(crate) fn decimal_from_text(column: &'static str, text: &str) -> Result<Decimal, StorageError> {
    Decimal::from_str(text).map_err(|_| StorageError::Corrupt {
        column,
        value: text.to_string(),
    })
}

pub(crate) fn int_to<T: TryFrom<i64>>(column: &'static str, value: i64) -> Result<T, StorageError> {
    T::try_from(value).map_err(|_| StorageError::Corrupt {
        column,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let db = Database::in_memory().await.unwrap();
        db.run_migrations().await.unwrap();

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
                .fetch_all(db.pool())
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "brands",
                "crawl_tasks",
                "data_sources",
                "dealers",
                "demand_links",
                "listings",
                "markets",
                "models",
                "price_history"
            ]
        );
    }

    #[test]
    fn millis_round_trip_keeps_precision() {
        let at = Utc.timestamp_millis_opt(1_760_000_000_123).single().unwrap();
        assert_eq!(from_millis("t", to_millis(at)).unwrap(), at);
    }
}
