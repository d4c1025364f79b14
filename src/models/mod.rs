use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::CrawlError;
use crate::queue::BackoffPolicy;

/// Marketplace region a crawl task can target
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    China,
    Europe,
    Usa,
}

impl Region {
    pub const ALL: [Region; 3] = [Region::China, Region::Europe, Region::Usa];

    pub fn code(&self) -> &'static str {
        match self {
            Region::China => "china",
            Region::Europe => "europe",
            Region::Usa => "usa",
        }
    }

    /// Market a listing found in this region belongs to
    pub fn market(&self) -> MarketInfo {
        match self {
            Region::China => MarketInfo {
                region: "China",
                name: "China",
                currency: "CNY",
            },
            Region::Europe => MarketInfo {
                region: "Europe",
                name: "Europe",
                currency: "EUR",
            },
            Region::Usa => MarketInfo {
                region: "USA",
                name: "USA",
                currency: "USD",
            },
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "china" | "cn" => Ok(Region::China),
            "europe" | "eu" => Ok(Region::Europe),
            "usa" | "us" => Ok(Region::Usa),
            other => Err(format!("unknown region '{}'", other)),
        }
    }
}

/// Static market description for a region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketInfo {
    pub region: &'static str,
    pub name: &'static str,
    pub currency: &'static str,
}

/// The identity of a crawl task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrawlFilter {
    pub brand_id: Option<i64>,
    pub model_id: Option<i64>,
    pub generation: Option<String>,
    pub year_from: i32,
    pub year_to: i32,
}

impl CrawlFilter {
    /// Canonical uniqueness key. Unset fields only match other unset fields.
    pub fn key(&self) -> String {
        fn opt<T: fmt::Display>(v: &Option<T>) -> String {
            v.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "*".to_string())
        }
        format!(
            "b={}|m={}|g={}|y={}-{}",
            opt(&self.brand_id),
            opt(&self.model_id),
            self.generation
                .as_deref()
                .map(str::to_lowercase)
                .unwrap_or_else(|| "*".to_string()),
            self.year_from,
            self.year_to
        )
    }

    /// Inclusive on both ends
    pub fn accepts_year(&self, year: i32) -> bool {
        year >= self.year_from && year <= self.year_to
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// A deduplicated, scheduled unit of crawl work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlTask {
    pub id: i64,
    pub filter: CrawlFilter,
    pub regions: BTreeSet<Region>,
    pub status: TaskStatus,
    /// Number of attached demand links
    pub priority: u32,
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_parsed_at: Option<DateTime<Utc>>,
    pub next_parse_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl CrawlTask {
    /// State after a successful run: rescheduled by demand tier.
    pub fn completed(&self, policy: &BackoffPolicy, now: DateTime<Utc>) -> CrawlTask {
        CrawlTask {
            status: TaskStatus::Completed,
            consecutive_failures: 0,
            last_parsed_at: Some(now),
            next_parse_at: Some(now + policy.success_interval(self.priority)),
            updated_at: Some(now),
            lease_owner: None,
            lease_expires_at: None,
            ..self.clone()
        }
    }

    /// State after a task-level failure: rescheduled by exponential backoff.
    pub fn failed(&self, error: &CrawlError, policy: &BackoffPolicy, now: DateTime<Utc>) -> CrawlTask {
        let failures = self.consecutive_failures.saturating_add(1);
        let delay = if error.is_rate_limited() {
            policy.rate_limited_interval(failures)
        } else {
            policy.backoff_interval(failures)
        };

        CrawlTask {
            status: TaskStatus::Failed,
            consecutive_failures: failures,
            last_error: Some(error.to_string()),
            next_parse_at: Some(now + delay),
            updated_at: Some(now),
            lease_owner: None,
            lease_expires_at: None,
            ..self.clone()
        }
    }

    /// State after an interrupted run: back in the queue, no failure counted.
    pub fn released(&self, now: DateTime<Utc>) -> CrawlTask {
        CrawlTask {
            status: TaskStatus::Pending,
            updated_at: Some(now),
            lease_owner: None,
            lease_expires_at: None,
            ..self.clone()
        }
    }
}

/// A user search attached to a crawl task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DemandLink {
    pub search_id: i64,
    pub task_id: i64,
    pub new_listings_pending: bool,
    pub price_drop_pending: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Listing as emitted by a source adapter, before currency conversion
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedListing {
    pub source: String,
    pub brand: String,
    pub model: String,
    pub year: i32,
    pub price: Decimal,
    pub currency: String,
    #[serde(default)]
    pub mileage: Option<i64>,
    pub source_url: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub dealer: Option<String>,
    pub parsed_at: DateTime<Utc>,
}

/// Persisted, currency-normalized listing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanonicalListing {
    pub id: i64,
    pub source_url: String,
    pub brand_id: i64,
    pub model_id: i64,
    pub market_id: i64,
    pub dealer_id: Option<i64>,
    pub data_source_id: i64,
    pub year: i32,
    pub price: Decimal,
    pub currency: String,
    pub converted_price: Decimal,
    pub converted_currency: String,
    pub mileage: Option<i64>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub image_url: Option<String>,
    pub available: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub sold_at: Option<DateTime<Utc>>,
}

impl CanonicalListing {
    pub fn price_differs(&self, price: Decimal, currency: &str) -> bool {
        self.price != price || !self.currency.eq_ignore_ascii_case(currency)
    }

    /// New price applied, plus the history entry describing the change.
    pub fn repriced(
        &self,
        price: Decimal,
        currency: &str,
        converted_price: Decimal,
        now: DateTime<Utc>,
    ) -> (CanonicalListing, PriceChange) {
        let change = PriceChange {
            old_price: self.price,
            old_currency: self.currency.clone(),
            new_price: price,
            new_currency: currency.to_uppercase(),
        };
        let listing = CanonicalListing {
            price,
            currency: currency.to_uppercase(),
            converted_price,
            updated_at: Some(now),
            ..self.clone()
        };
        (listing, change)
    }

    pub fn marked_unavailable(&self, now: DateTime<Utc>) -> CanonicalListing {
        CanonicalListing {
            available: false,
            sold_at: Some(now),
            updated_at: Some(now),
            ..self.clone()
        }
    }

    /// A listing seen again on the site is back on sale.
    pub fn marked_available(&self, now: DateTime<Utc>) -> CanonicalListing {
        CanonicalListing {
            available: true,
            sold_at: None,
            updated_at: Some(now),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceChange {
    pub old_price: Decimal,
    pub old_currency: String,
    pub new_price: Decimal,
    pub new_currency: String,
}

impl PriceChange {
    pub fn is_drop(&self) -> bool {
        self.old_currency == self.new_currency && self.new_price < self.old_price
    }
}
