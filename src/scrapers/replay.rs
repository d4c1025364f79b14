//! Recorded listings served from a JSON file or memory.
//!
//! Used for offline runs and tests. Entries are decoded one by one, so a
//! malformed record becomes a `Parse` item instead of failing the whole run.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use super::traits::ListingSource;
use super::types::{ListingPage, SearchParams};
use crate::error::ScrapeError;
use crate::models::NormalizedListing;

const SOURCE: &str = "replay";

#[derive(Debug, Clone)]
enum Records {
    File(PathBuf),
    Memory(Vec<Value>),
    /// Every fetch fails with this message
    Failing(String),
}

#[derive(Debug, Clone)]
pub struct ReplaySource {
    records: Records,
    page_size: usize,
    page_delay: Duration,
}

impl ReplaySource {
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self::with_records(Records::File(path.into()))
    }

    pub fn from_values(values: Vec<Value>) -> Self {
        Self::with_records(Records::Memory(values))
    }

    /// A source whose every page request fails, as an unreachable site would
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_records(Records::Failing(message.into()))
    }

    fn with_records(records: Records) -> Self {
        Self {
            records,
            page_size: 20,
            page_delay: Duration::ZERO,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    async fn load(&self) -> Result<Vec<Value>, ScrapeError> {
        match &self.records {
            Records::Memory(values) => Ok(values.clone()),
            Records::File(path) => {
                let raw = tokio::fs::read_to_string(path).await?;
                let values: Vec<Value> = serde_json::from_str(&raw)?;
                info!(path = %path.display(), records = values.len(), "Loaded replay file");
                Ok(values)
            }
            Records::Failing(message) => Err(ScrapeError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                message.clone(),
            ))),
        }
    }
}

fn matches_name(wanted: &Option<String>, actual: &str) -> bool {
    wanted
        .as_deref()
        .map_or(true, |w| w.trim().eq_ignore_ascii_case(actual.trim()))
}

#[async_trait]
impl ListingSource for ReplaySource {
    async fn fetch_page(&self, params: &SearchParams, page: u32) -> Result<ListingPage, ScrapeError> {
        let values = self.load().await?;

        // Years are left to the caller, like a site that ignores the year filter
        let decoded: Vec<Result<NormalizedListing, ScrapeError>> = values
            .into_iter()
            .map(|value| {
                serde_json::from_value::<NormalizedListing>(value).map_err(|e| ScrapeError::Parse {
                    source_name: SOURCE,
                    reason: e.to_string(),
                })
            })
            .filter(|item| match item {
                Ok(listing) => {
                    matches_name(&params.brand, &listing.brand) && matches_name(&params.model, &listing.model)
                }
                Err(_) => true,
            })
            .collect();

        let start = (page.saturating_sub(1) as usize).saturating_mul(self.page_size);
        let has_next = decoded.len() > start.saturating_add(self.page_size);
        let items: Vec<_> = decoded.into_iter().skip(start).take(self.page_size).collect();

        debug!(page, items = items.len(), has_next, "Replaying page");
        Ok(ListingPage::new(items, has_next))
    }

    fn source_name(&self) -> &'static str {
        SOURCE
    }

    fn page_delay(&self) -> Duration {
        self.page_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrapers::traits::listing_stream;
    use futures::StreamExt;
    use serde_json::json;
    use std::io::Write;
    use tokio_util::sync::CancellationToken;

    fn record(id: u32, brand: &str) -> Value {
        json!({
            "source": "replay",
            "brand": brand,
            "model": "A4",
            "year": 2019,
            "price": "15000",
            "currency": "EUR",
            "source_url": format!("https://replay.test/{id}"),
            "parsed_at": "2025-01-01T00:00:00Z"
        })
    }

    #[tokio::test]
    async fn filters_by_brand_and_pages() {
        let values = vec![
            record(1, "Audi"),
            record(2, "BMW"),
            record(3, "audi"),
            json!({"brand": "Audi"}),
            record(4, "Audi"),
        ];
        let source = ReplaySource::from_values(values).with_page_size(2);
        let params = SearchParams {
            brand: Some("Audi".into()),
            ..SearchParams::default()
        };

        let first = source.fetch_page(&params, 1).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(first.has_next);

        let second = source.fetch_page(&params, 2).await.unwrap();
        assert!(matches!(second.items[0], Err(ScrapeError::Parse { .. })));
        assert!(!second.has_next);
    }

    #[tokio::test]
    async fn reads_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", json!([record(1, "Audi"), record(2, "Audi")])).unwrap();

        let source = ReplaySource::from_file(file.path());
        let params = SearchParams::default();
        let urls: Vec<String> = listing_stream(&source, &params, CancellationToken::new())
            .filter_map(|item| async move { item.ok().map(|l| l.source_url) })
            .collect()
            .await;
        assert_eq!(urls, vec!["https://replay.test/1", "https://replay.test/2"]);
    }

    #[tokio::test]
    async fn missing_file_is_a_task_error() {
        let source = ReplaySource::from_file("/nonexistent/replay.json");
        let err = source.fetch_page(&SearchParams::default(), 1).await.unwrap_err();
        assert!(matches!(err, ScrapeError::Io(_)));
        assert!(!err.is_item_level());
    }
}
