//! Reference entities and canonical listings.

use chrono::{DateTime, Utc};
use reqwest::Url;
use rust_decimal::Decimal;
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::{debug, warn};

use super::{begin_write, decimal_from_text, from_millis, int_to, opt_from_millis, to_millis};
use crate::error::StorageError;
use crate::models::{CanonicalListing, NormalizedListing, PriceChange, Region};

const MAX_UPSERT_ATTEMPTS: u32 = 3;

const LISTING_COLUMNS: &str = "id, source_url, brand_id, model_id, market_id, dealer_id, data_source_id, \
     year, price, currency, converted_price, converted_currency, mileage, city, country, image_url, \
     available, created_at, updated_at, sold_at";

/// Price in the canonical currency, computed before the write transaction opens
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedPrice {
    pub amount: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Inserted { id: i64 },
    Repriced { id: i64, change: PriceChange },
    Unchanged { id: i64 },
}

impl UpsertOutcome {
    pub fn listing_id(&self) -> i64 {
        match self {
            Self::Inserted { id } | Self::Repriced { id, .. } | Self::Unchanged { id } => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceHistoryEntry {
    pub listing_id: i64,
    pub change: PriceChange,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct ListingRow {
    id: i64,
    source_url: String,
    brand_id: i64,
    model_id: i64,
    market_id: i64,
    dealer_id: Option<i64>,
    data_source_id: i64,
    year: i64,
    price: String,
    currency: String,
    converted_price: String,
    converted_currency: String,
    mileage: Option<i64>,
    city: Option<String>,
    country: Option<String>,
    image_url: Option<String>,
    available: bool,
    created_at: i64,
    updated_at: Option<i64>,
    sold_at: Option<i64>,
}

impl ListingRow {
    fn into_listing(self) -> Result<CanonicalListing, StorageError> {
        Ok(CanonicalListing {
            id: self.id,
            source_url: self.source_url,
            brand_id: self.brand_id,
            model_id: self.model_id,
            market_id: self.market_id,
            dealer_id: self.dealer_id,
            data_source_id: self.data_source_id,
            year: int_to("year", self.year)?,
            price: decimal_from_text("price", &self.price)?,
            currency: self.currency,
            converted_price: decimal_from_text("converted_price", &self.converted_price)?,
            converted_currency: self.converted_currency,
            mileage: self.mileage,
            city: self.city,
            country: self.country,
            image_url: self.image_url,
            available: self.available,
            created_at: from_millis("created_at", self.created_at)?,
            updated_at: opt_from_millis("updated_at", self.updated_at)?,
            sold_at: opt_from_millis("sold_at", self.sold_at)?,
        })
    }
}

/// Trim and collapse internal whitespace. Case is left to the column collation.
pub fn normalize_name(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn required_name(column: &'static str, raw: &str) -> Result<String, StorageError> {
    let name = normalize_name(raw);
    if name.is_empty() {
        return Err(StorageError::Corrupt {
            column,
            value: raw.to_string(),
        });
    }
    Ok(name)
}

/// Origin (`scheme://host[:port]`) of a listing URL, or the URL itself if unparseable
fn origin_of(url: &str) -> String {
    Url::parse(url)
        .map(|u| u.origin().ascii_serialization())
        .unwrap_or_else(|_| url.to_string())
}

/// Writes listings and the reference rows they point at
#[derive(Clone)]
pub struct StorageWriter {
    pool: SqlitePool,
}

impl StorageWriter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or update the listing identified by `listing.source_url`.
    ///
    /// Each call runs in its own write transaction. A concurrent insert of the
    /// same URL surfaces as a unique violation and is retried, at which point the
    /// row exists and the update path is taken. A write lock that stays busy past
    /// the busy timeout is retried the same way.
    pub async fn upsert_listing(
        &self,
        listing: &NormalizedListing,
        region: Region,
        converted: &ConvertedPrice,
    ) -> Result<UpsertOutcome, StorageError> {
        let mut attempt = 1;
        loop {
            match self.upsert_once(listing, region, converted).await {
                Err(e) if e.is_unique_violation() && attempt < MAX_UPSERT_ATTEMPTS => {
                    debug!(url = %listing.source_url, attempt, "Concurrent insert, retrying as update");
                    attempt += 1;
                }
                Err(e) if e.is_busy() && attempt < MAX_UPSERT_ATTEMPTS => {
                    warn!(url = %listing.source_url, attempt, "Database busy, retrying listing");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn upsert_once(
        &self,
        listing: &NormalizedListing,
        region: Region,
        converted: &ConvertedPrice,
    ) -> Result<UpsertOutcome, StorageError> {
        let now = Utc::now();
        let mut tx = begin_write(&self.pool).await?;

        let outcome = match listing_by_url(&mut tx, &listing.source_url).await? {
            None => {
                let id = insert_listing(&mut tx, listing, region, converted, now).await?;
                UpsertOutcome::Inserted { id }
            }
            Some(current) if current.price_differs(listing.price, &listing.currency) => {
                let (updated, change) =
                    current.repriced(listing.price, &listing.currency, converted.amount, now);
                let updated = if updated.available {
                    updated
                } else {
                    updated.marked_available(now)
                };
                write_state(&mut tx, &updated).await?;
                insert_price_history(&mut tx, updated.id, &change, now).await?;
                UpsertOutcome::Repriced {
                    id: updated.id,
                    change,
                }
            }
            Some(current) => {
                if !current.available {
                    write_state(&mut tx, &current.marked_available(now)).await?;
                }
                UpsertOutcome::Unchanged { id: current.id }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// Flag a listing as gone from its site. Returns `false` for unknown URLs.
    pub async fn mark_unavailable(&self, source_url: &str) -> Result<bool, StorageError> {
        let mut tx = begin_write(&self.pool).await?;
        let Some(current) = listing_by_url(&mut tx, source_url).await? else {
            return Ok(false);
        };
        if current.available {
            write_state(&mut tx, &current.marked_unavailable(Utc::now())).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    pub async fn find_by_url(&self, source_url: &str) -> Result<Option<CanonicalListing>, StorageError> {
        let mut conn = self.pool.acquire().await?;
        listing_by_url(&mut conn, source_url).await
    }

    pub async fn count_listings(&self) -> Result<i64, StorageError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM listings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn price_history(&self, listing_id: i64) -> Result<Vec<PriceHistoryEntry>, StorageError> {
        let rows: Vec<(String, String, String, String, i64)> = sqlx::query_as(
            "SELECT old_price, old_currency, new_price, new_currency, recorded_at \
             FROM price_history WHERE listing_id = ? ORDER BY id",
        )
        .bind(listing_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(old_price, old_currency, new_price, new_currency, recorded_at)| {
                Ok(PriceHistoryEntry {
                    listing_id,
                    change: PriceChange {
                        old_price: decimal_from_text("old_price", &old_price)?,
                        old_currency,
                        new_price: decimal_from_text("new_price", &new_price)?,
                        new_currency,
                    },
                    recorded_at: from_millis("recorded_at", recorded_at)?,
                })
            })
            .collect()
    }

    pub async fn ensure_brand(&self, name: &str) -> Result<i64, StorageError> {
        let mut conn = self.pool.acquire().await?;
        brand_id(&mut conn, name, Utc::now()).await
    }

    pub async fn ensure_model(&self, brand_id: i64, name: &str) -> Result<i64, StorageError> {
        let mut conn = self.pool.acquire().await?;
        model_id(&mut conn, brand_id, name, Utc::now()).await
    }

    pub async fn brand_name(&self, brand_id: i64) -> Result<Option<String>, StorageError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT name FROM brands WHERE id = ?")
            .bind(brand_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(name,)| name))
    }

    pub async fn model_name(&self, model_id: i64) -> Result<Option<String>, StorageError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT name FROM models WHERE id = ?")
            .bind(model_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(name,)| name))
    }
}

async fn listing_by_url(
    conn: &mut SqliteConnection,
    source_url: &str,
) -> Result<Option<CanonicalListing>, StorageError> {
    let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE source_url = ?");
    let row: Option<ListingRow> = sqlx::query_as(&sql)
        .bind(source_url)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(ListingRow::into_listing).transpose()
}

async fn insert_listing(
    conn: &mut SqliteConnection,
    listing: &NormalizedListing,
    region: Region,
    converted: &ConvertedPrice,
    now: DateTime<Utc>,
) -> Result<i64, StorageError> {
    let brand = brand_id(conn, &listing.brand, now).await?;
    let model = model_id(conn, brand, &listing.model, now).await?;
    let market = market_id(conn, region, now).await?;
    let dealer = match listing.dealer.as_deref().map(normalize_name) {
        Some(name) if !name.is_empty() => Some(dealer_id(conn, market, &name, now).await?),
        _ => None,
    };
    let country = listing
        .country
        .clone()
        .unwrap_or_else(|| region.market().name.to_string());
    let source = data_source_id(conn, &listing.source, &country, &origin_of(&listing.source_url), now).await?;

    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO listings \
         (source_url, brand_id, model_id, market_id, dealer_id, data_source_id, year, price, \
          currency, converted_price, converted_currency, mileage, city, country, image_url, \
          available, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?) \
         RETURNING id",
    )
    .bind(&listing.source_url)
    .bind(brand)
    .bind(model)
    .bind(market)
    .bind(dealer)
    .bind(source)
    .bind(listing.year)
    .bind(listing.price.to_string())
    .bind(listing.currency.to_uppercase())
    .bind(converted.amount.to_string())
    .bind(&converted.currency)
    .bind(listing.mileage)
    .bind(listing.city.as_deref())
    .bind(listing.country.as_deref())
    .bind(listing.image_url.as_deref())
    .bind(to_millis(now))
    .bind(to_millis(now))
    .fetch_one(&mut *conn)
    .await?;

    Ok(id)
}

/// Persist the mutable part of a listing: price and availability.
async fn write_state(conn: &mut SqliteConnection, listing: &CanonicalListing) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE listings \
         SET price = ?, currency = ?, converted_price = ?, available = ?, updated_at = ?, sold_at = ? \
         WHERE id = ?",
    )
    .bind(listing.price.to_string())
    .bind(&listing.currency)
    .bind(listing.converted_price.to_string())
    .bind(listing.available)
    .bind(listing.updated_at.map(to_millis))
    .bind(listing.sold_at.map(to_millis))
    .bind(listing.id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_price_history(
    conn: &mut SqliteConnection,
    listing_id: i64,
    change: &PriceChange,
    now: DateTime<Utc>,
) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO price_history \
         (listing_id, old_price, old_currency, new_price, new_currency, recorded_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(listing_id)
    .bind(change.old_price.to_string())
    .bind(&change.old_currency)
    .bind(change.new_price.to_string())
    .bind(&change.new_currency)
    .bind(to_millis(now))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// Get-or-create by natural key. `ON CONFLICT DO NOTHING` makes a racing insert a
// no-op, and the re-query then sees whichever row won.

async fn brand_id(conn: &mut SqliteConnection, raw: &str, now: DateTime<Utc>) -> Result<i64, StorageError> {
    let name = required_name("brand", raw)?;
    sqlx::query("INSERT INTO brands (name, created_at) VALUES (?, ?) ON CONFLICT DO NOTHING")
        .bind(&name)
        .bind(to_millis(now))
        .execute(&mut *conn)
        .await?;

    let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM brands WHERE name = ?")
        .bind(&name)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|(id,)| id)
        .ok_or(StorageError::Conflict { entity: "brand", key: name })
}

async fn model_id(
    conn: &mut SqliteConnection,
    brand_id: i64,
    raw: &str,
    now: DateTime<Utc>,
) -> Result<i64, StorageError> {
    let name = required_name("model", raw)?;
    sqlx::query("INSERT INTO models (brand_id, name, created_at) VALUES (?, ?, ?) ON CONFLICT DO NOTHING")
        .bind(brand_id)
        .bind(&name)
        .bind(to_millis(now))
        .execute(&mut *conn)
        .await?;

    let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM models WHERE brand_id = ? AND name = ?")
        .bind(brand_id)
        .bind(&name)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|(id,)| id).ok_or_else(|| StorageError::Conflict {
        entity: "model",
        key: format!("{brand_id}/{name}"),
    })
}

async fn market_id(conn: &mut SqliteConnection, region: Region, now: DateTime<Utc>) -> Result<i64, StorageError> {
    let market = region.market();
    sqlx::query(
        "INSERT INTO markets (region, name, currency, created_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT DO NOTHING",
    )
    .bind(market.region)
    .bind(market.name)
    .bind(market.currency)
    .bind(to_millis(now))
    .execute(&mut *conn)
    .await?;

    let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM markets WHERE region = ?")
        .bind(market.region)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|(id,)| id).ok_or_else(|| StorageError::Conflict {
        entity: "market",
        key: market.region.to_string(),
    })
}

async fn dealer_id(
    conn: &mut SqliteConnection,
    market_id: i64,
    name: &str,
    now: DateTime<Utc>,
) -> Result<i64, StorageError> {
    sqlx::query("INSERT INTO dealers (market_id, name, created_at) VALUES (?, ?, ?) ON CONFLICT DO NOTHING")
        .bind(market_id)
        .bind(name)
        .bind(to_millis(now))
        .execute(&mut *conn)
        .await?;

    let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM dealers WHERE market_id = ? AND name = ?")
        .bind(market_id)
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|(id,)| id).ok_or_else(|| StorageError::Conflict {
        entity: "dealer",
        key: name.to_string(),
    })
}

async fn data_source_id(
    conn: &mut SqliteConnection,
    raw_name: &str,
    raw_country: &str,
    base_url: &str,
    now: DateTime<Utc>,
) -> Result<i64, StorageError> {
    let name = required_name("data_source", raw_name)?;
    let country = normalize_name(raw_country);
    sqlx::query(
        "INSERT INTO data_sources (name, country, base_url, created_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT DO NOTHING",
    )
    .bind(&name)
    .bind(&country)
    .bind(base_url)
    .bind(to_millis(now))
    .execute(&mut *conn)
    .await?;

    let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM data_sources WHERE name = ? AND country = ?")
        .bind(&name)
        .bind(&country)
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some((id,)) => Ok(id),
        None => {
            warn!(source = %name, country = %country, "Data source missing after insert");
            Err(StorageError::Conflict {
                entity: "data_source",
                key: format!("{name}/{country}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use std::str::FromStr;

    fn listing(url: &str, price: &str) -> NormalizedListing {
        NormalizedListing {
            source: "mobile.de".into(),
            brand: "BMW".into(),
            model: "X5".into(),
            year: 2019,
            price: Decimal::from_str(price).unwrap(),
            currency: "EUR".into(),
            mileage: Some(42_000),
            source_url: url.into(),
            image_url: None,
            city: Some("Berlin".into()),
            country: Some("Germany".into()),
            dealer: Some("Autohaus  Nord ".into()),
            parsed_at: Utc::now(),
        }
    }

    fn rub(amount: &str) -> ConvertedPrice {
        ConvertedPrice {
            amount: Decimal::from_str(amount).unwrap(),
            currency: "RUB".into(),
        }
    }

    #[test]
    fn names_are_trimmed_and_collapsed() {
        assert_eq!(normalize_name("  Mercedes   Benz \t"), "Mercedes Benz");
    }

    #[test]
    fn origin_strips_path() {
        assert_eq!(
            origin_of("https://suchen.mobile.de/fahrzeuge/details.html?id=1"),
            "https://suchen.mobile.de"
        );
    }

    #[tokio::test]
    async fn same_url_twice_is_one_row() {
        let db = Database::in_memory().await.unwrap();
        let writer = db.writer();
        let url = "https://suchen.mobile.de/details.html?id=1";

        let first = writer.upsert_listing(&listing(url, "20000"), Region::Europe, &rub("1980000")).await.unwrap();
        let second = writer.upsert_listing(&listing(url, "20000"), Region::Europe, &rub("1980000")).await.unwrap();

        assert!(matches!(first, UpsertOutcome::Inserted { .. }));
        assert_eq!(second, UpsertOutcome::Unchanged { id: first.listing_id() });
        assert_eq!(writer.count_listings().await.unwrap(), 1);
        assert!(writer.price_history(first.listing_id()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn price_change_appends_history() {
        let db = Database::in_memory().await.unwrap();
        let writer = db.writer();
        let url = "https://suchen.mobile.de/details.html?id=2";

        let first = writer.upsert_listing(&listing(url, "20000"), Region::Europe, &rub("1980000")).await.unwrap();
        let second = writer.upsert_listing(&listing(url, "18500"), Region::Europe, &rub("1831500")).await.unwrap();

        let UpsertOutcome::Repriced { id, change } = second else {
            panic!("expected reprice, got {second:?}");
        };
        assert_eq!(id, first.listing_id());
        assert!(change.is_drop());

        let stored = writer.find_by_url(url).await.unwrap().unwrap();
        assert_eq!(stored.price, Decimal::from(18_500));
        assert_eq!(stored.converted_price, Decimal::from(1_831_500));

        let history = writer.price_history(id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].change.old_price, Decimal::from(20_000));
    }

    #[tokio::test]
    async fn unavailable_listing_comes_back_when_seen() {
        let db = Database::in_memory().await.unwrap();
        let writer = db.writer();
        let url = "https://suchen.mobile.de/details.html?id=3";

        writer.upsert_listing(&listing(url, "20000"), Region::Europe, &rub("1")).await.unwrap();
        assert!(writer.mark_unavailable(url).await.unwrap());
        let gone = writer.find_by_url(url).await.unwrap().unwrap();
        assert!(!gone.available);
        assert!(gone.sold_at.is_some());

        writer.upsert_listing(&listing(url, "20000"), Region::Europe, &rub("1")).await.unwrap();
        let back = writer.find_by_url(url).await.unwrap().unwrap();
        assert!(back.available);
        assert!(back.sold_at.is_none());

        assert!(!writer.mark_unavailable("https://nowhere.example/1").await.unwrap());
    }

    #[tokio::test]
    async fn reference_names_are_case_insensitive() {
        let db = Database::in_memory().await.unwrap();
        let writer = db.writer();

        let a = writer.ensure_brand("Mercedes-Benz").await.unwrap();
        let b = writer.ensure_brand("  mercedes-benz ").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(writer.brand_name(a).await.unwrap().as_deref(), Some("Mercedes-Benz"));

        let m1 = writer.ensure_model(a, "E  Class").await.unwrap();
        let m2 = writer.ensure_model(a, "e class").await.unwrap();
        assert_eq!(m1, m2);
        assert!(writer.ensure_brand("   ").await.is_err());
    }
}
