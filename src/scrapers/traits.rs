use std::collections::HashSet;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::types::{ListingPage, SearchParams};
use crate::error::ScrapeError;
use crate::models::NormalizedListing;

pub type ListingStream<'a> = BoxStream<'a, Result<NormalizedListing, ScrapeError>>;

/// Common trait for all listing sources.
///
/// A source only knows how to fetch one page; [`listing_stream`] turns that into
/// a paced, deduplicated, budgeted stream.
#[async_trait]
pub trait ListingSource: Send + Sync {
    /// Fetch page `page` (1-based) of results for `params`
    async fn fetch_page(&self, params: &SearchParams, page: u32) -> Result<ListingPage, ScrapeError>;

    /// Get the name of the listing source
    fn source_name(&self) -> &'static str;

    /// Pause between page requests
    fn page_delay(&self) -> Duration;
}

/// Walk a source page by page.
///
/// Stops at the page or listing budget, at the last page, or when a page yields
/// nothing new. Only listings inside the searched year range count toward the
/// listing budget; the rest are still yielded for the caller to filter. `Parse`
/// errors are passed through as items; any other error is yielded once and ends
/// the stream. Cancellation yields [`ScrapeError::Cancelled`].
pub fn listing_stream<'a, S>(
    source: &'a S,
    params: &'a SearchParams,
    cancel: CancellationToken,
) -> ListingStream<'a>
where
    S: ListingSource + ?Sized,
{
    Box::pin(stream! {
        let name = source.source_name();
        let mut seen: HashSet<String> = HashSet::new();
        let mut emitted = 0usize;
        let mut in_range = 0usize;

        for page in 1..=params.max_pages {
            if page > 1 {
                let cancelled = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => true,
                    _ = tokio::time::sleep(source.page_delay()) => false,
                };
                if cancelled {
                    yield Err(ScrapeError::Cancelled);
                    return;
                }
            }

            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ScrapeError::Cancelled),
                result = source.fetch_page(params, page) => result,
            };
            let listing_page = match fetched {
                Ok(p) => p,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let mut fresh = 0usize;
            for item in listing_page.items {
                match item {
                    Ok(listing) => {
                        if !seen.insert(listing.source_url.clone()) {
                            continue;
                        }
                        fresh += 1;
                        emitted += 1;
                        let counted = params.accepts_year(listing.year);
                        yield Ok(listing);
                        if counted {
                            in_range += 1;
                            if in_range >= params.max_listings {
                                info!(source = name, emitted, in_range, "Listing budget reached");
                                return;
                            }
                        }
                    }
                    Err(e) => yield Err(e),
                }
            }

            let skipped = listing_page.skipped;
            debug!(source = name, page, fresh, skipped, total = emitted, "Page processed");

            if !listing_page.has_next || (fresh == 0 && skipped == 0) {
                info!(source = name, pages = page, total = emitted, "Reached end of results");
                return;
            }
        }
    })
}
