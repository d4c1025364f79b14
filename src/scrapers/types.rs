use serde::{Deserialize, Serialize};

use crate::models::NormalizedListing;
use crate::error::ScrapeError;

/// What a crawl task asks a site for
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchParams {
    /// Brand name, e.g. "BMW"; `None` searches every brand
    pub brand: Option<String>,
    pub model: Option<String>,
    pub generation: Option<String>,
    pub year_from: i32,
    pub year_to: i32,
    /// Page budget
    pub max_pages: u32,
    /// Listing budget across all pages
    pub max_listings: usize,
}

impl SearchParams {
    /// Inclusive on both ends
    pub fn accepts_year(&self, year: i32) -> bool {
        year >= self.year_from && year <= self.year_to
    }
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            brand: None,
            model: None,
            generation: None,
            year_from: 2015,
            year_to: 2025,
            max_pages: 10,
            max_listings: 100,
        }
    }
}

/// One page of search results
#[derive(Debug, Default)]
pub struct ListingPage {
    /// `Err` entries are listings that could not be mapped
    pub items: Vec<Result<NormalizedListing, ScrapeError>>,
    pub has_next: bool,
    /// Results the site returned that do not match the search and were dropped
    pub skipped: usize,
}

impl ListingPage {
    pub fn new(items: Vec<Result<NormalizedListing, ScrapeError>>, has_next: bool) -> Self {
        Self {
            items,
            has_next,
            skipped: 0,
        }
    }
}
