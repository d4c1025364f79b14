//! cars.com (USA), rendered in headless Chrome and parsed with `scraper`.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use regex::Regex;
use reqwest::Url;
use scraper::{Html, Selector};
use tracing::{debug, info};

use super::browser::{BrowserSession, PageSpec};
use super::html::{absolute_url, attr_of, digits, max_page_number, parse_amount, text_of};
use super::traits::ListingSource;
use super::types::{ListingPage, SearchParams};
use crate::config::RegionConfig;
use crate::error::ScrapeError;
use crate::models::NormalizedListing;

const SOURCE: &str = "cars.com";
const ORIGIN: &str = "https://www.cars.com";
const DEFAULT_SEARCH_URL: &str = "https://www.cars.com/shopping/results/";

const PAGE_SPEC: PageSpec = PageSpec {
    source_name: SOURCE,
    card_selector: "[data-cy='vehicleCard']",
    consent_selector: Some("[data-testid='cookie-consent-accept-button']"),
};

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

static CARD: LazyLock<Selector> = LazyLock::new(|| selector("[data-cy='vehicleCard']"));
static TITLE_LINK: LazyLock<Selector> = LazyLock::new(|| selector("[data-cy='vehicleTitle'] a"));
static IMAGE: LazyLock<Selector> = LazyLock::new(|| selector("img[src*='vehicle']"));
static PRICE: LazyLock<Selector> = LazyLock::new(|| selector("[data-cy='primaryPrice']"));
static DETAILS: LazyLock<Selector> = LazyLock::new(|| selector("[data-cy='vehicleDetails']"));
static LOCATION: LazyLock<Selector> = LazyLock::new(|| selector("[data-cy='dealerLocation']"));
static DEALER: LazyLock<Selector> = LazyLock::new(|| selector("[data-cy='dealerName']"));
static PAGINATION: LazyLock<Selector> = LazyLock::new(|| selector("[data-cy='pagination']"));
static PAGINATION_INFO: LazyLock<Selector> = LazyLock::new(|| selector("[data-cy='paginationInfo']"));
static PAGE_LINK: LazyLock<Selector> = LazyLock::new(|| selector("a"));

static MILEAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{1,3}(?:,\d{3})*\s*mi\.?").expect("static regex"));
static PAGE_COUNT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"of\s+(\d+)").expect("static regex"));

pub struct CarsComSource {
    session: BrowserSession,
    search_url: String,
    page_delay: Duration,
}

/// cars.com slugs are lowercase and hyphenated: "Mercedes-Benz" → "mercedes_benz"
fn slug(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

impl CarsComSource {
    pub fn new(config: &RegionConfig) -> Self {
        Self {
            session: BrowserSession::new(config),
            search_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_SEARCH_URL.to_string()),
            page_delay: config.page_delay(),
        }
    }

    fn page_url(&self, params: &SearchParams, page: u32) -> Result<Url, ScrapeError> {
        let mut url = Url::parse(&self.search_url).map_err(|e| ScrapeError::UnsupportedFilter {
            source_name: SOURCE,
            reason: format!("invalid search url: {e}"),
        })?;

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("stock_type", "used")
                .append_pair("year_min", &params.year_from.to_string())
                .append_pair("year_max", &params.year_to.to_string());
            if let Some(brand) = &params.brand {
                query.append_pair("makes[]", &slug(brand));
                if let Some(model) = &params.model {
                    query.append_pair("models[]", &format!("{}-{}", slug(brand), slug(model)));
                }
            }
            if page > 1 {
                query.append_pair("page", &page.to_string());
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl ListingSource for CarsComSource {
    async fn fetch_page(&self, params: &SearchParams, page: u32) -> Result<ListingPage, ScrapeError> {
        let url = self.page_url(params, page)?;
        info!(%url, page, "Opening cars.com search page");

        let html = self.session.fetch_html(url.as_str(), PAGE_SPEC).await?;
        let parsed = parse_search_page(&html, params, page, Utc::now());
        debug!(page, cards = parsed.items.len(), has_next = parsed.has_next, "Parsed cars.com page");
        Ok(parsed)
    }

    fn source_name(&self) -> &'static str {
        SOURCE
    }

    fn page_delay(&self) -> Duration {
        self.page_delay
    }
}

fn parse_error(reason: impl Into<String>) -> ScrapeError {
    ScrapeError::Parse {
        source_name: SOURCE,
        reason: reason.into(),
    }
}

/// "2019 Audi A3 2.0T Premium" → year, brand, model
fn parse_title(title: &str, current_year: i32) -> (Option<i32>, Option<String>, Option<String>) {
    let parts: Vec<&str> = title.split_whitespace().collect();
    let year = parts
        .first()
        .and_then(|p| p.parse::<i32>().ok())
        .filter(|y| *y >= 1900 && *y <= current_year + 1);
    let brand = parts.get(1).map(|b| b.to_string());
    let model = (parts.len() > 2).then(|| parts[2..].join(" "));
    (year, brand, model)
}

/// Extract vehicle cards from a rendered results page.
pub fn parse_search_page(html: &str, params: &SearchParams, page: u32, now: DateTime<Utc>) -> ListingPage {
    let document = Html::parse_document(html);

    let items = document
        .select(&CARD)
        .map(|card| -> Result<NormalizedListing, ScrapeError> {
            let title = text_of(card, &TITLE_LINK).ok_or_else(|| parse_error("card without title"))?;
            let href = attr_of(card, &TITLE_LINK, "href")
                .ok_or_else(|| parse_error(format!("'{title}' has no link")))?;
            let price = text_of(card, &PRICE)
                .and_then(|p| parse_amount(&p, '.'))
                .ok_or_else(|| parse_error(format!("'{title}' has no price")))?;

            let (year, title_brand, title_model) = parse_title(&title, now.year());
            let year = year.ok_or_else(|| parse_error(format!("'{title}' has no year")))?;
            let brand = params
                .brand
                .clone()
                .or(title_brand)
                .ok_or_else(|| parse_error(format!("'{title}' has no brand")))?;
            let model = params
                .model
                .clone()
                .or(title_model)
                .ok_or_else(|| parse_error(format!("'{title}' has no model")))?;

            let mileage = text_of(card, &DETAILS)
                .and_then(|d| MILEAGE.find(&d).and_then(|m| digits(m.as_str())));

            // "Chicago, IL 60601"
            let city = text_of(card, &LOCATION)
                .and_then(|l| l.split(',').next().map(|c| c.trim().to_string()))
                .filter(|c| !c.is_empty());

            Ok(NormalizedListing {
                source: SOURCE.to_string(),
                brand,
                model,
                year,
                price,
                currency: "USD".to_string(),
                mileage,
                source_url: absolute_url(&href, ORIGIN),
                image_url: attr_of(card, &IMAGE, "src"),
                city,
                country: Some("USA".to_string()),
                dealer: text_of(card, &DEALER),
                parsed_at: now,
            })
        })
        .collect();

    let total_pages = match document.select(&PAGINATION).next() {
        Some(pagination) => max_page_number(pagination, &PAGE_LINK),
        None => document
            .select(&PAGINATION_INFO)
            .next()
            .map(|info| info.text().collect::<String>())
            .and_then(|text| PAGE_COUNT.captures(&text).and_then(|c| c[1].parse().ok()))
            .unwrap_or(1),
    };

    ListingPage::new(items, page < total_pages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    const PAGE: &str = r#"
    <html><body>
      <div data-cy="vehicleCard">
        <h2 data-cy="vehicleTitle"><a href="/vehicledetail/abc-1/">2019 Audi A3 2.0T Premium</a></h2>
        <img src="https://platform.cstatic-images.com/vehicle/1.jpg">
        <span data-cy="primaryPrice">$21,450</span>
        <div data-cy="vehicleDetails">32,118 mi. Gasoline Automatic FWD</div>
        <div data-cy="dealerLocation">Chicago, IL 60601</div>
        <div data-cy="dealerName">Loop Auto</div>
      </div>
      <div data-cy="vehicleCard">
        <h2 data-cy="vehicleTitle"><a href="/vehicledetail/abc-2/">Certified Audi Q5</a></h2>
        <span data-cy="primaryPrice">$30,000</span>
      </div>
      <div data-cy="paginationInfo">Page 1 of 4</div>
    </body></html>"#;

    #[test]
    fn parses_cards() {
        let page = parse_search_page(PAGE, &SearchParams::default(), 1, Utc::now());
        assert_eq!(page.items.len(), 2);
        assert!(page.has_next);

        let car = page.items[0].as_ref().unwrap();
        assert_eq!(car.year, 2019);
        assert_eq!(car.brand, "Audi");
        assert_eq!(car.model, "A3 2.0T Premium");
        assert_eq!(car.price, Decimal::from(21_450));
        assert_eq!(car.mileage, Some(32_118));
        assert_eq!(car.city.as_deref(), Some("Chicago"));
        assert_eq!(car.dealer.as_deref(), Some("Loop Auto"));
        assert_eq!(car.source_url, "https://www.cars.com/vehicledetail/abc-1/");

        // No leading year in the title
        assert!(matches!(page.items[1], Err(ScrapeError::Parse { .. })));
    }

    #[test]
    fn pagination_info_fallback() {
        assert!(!parse_search_page(PAGE, &SearchParams::default(), 4, Utc::now()).has_next);
    }

    #[test]
    fn make_and_model_slugs() {
        assert_eq!(slug("Mercedes-Benz"), "mercedes_benz");
        let source = CarsComSource::new(&RegionConfig::default());
        let params = SearchParams {
            brand: Some("Audi".into()),
            model: Some("A3".into()),
            ..SearchParams::default()
        };
        let url = source.page_url(&params, 1).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("makes[]".to_string(), "audi".to_string())));
        assert!(pairs.contains(&("models[]".to_string(), "audi-a3".to_string())));
        assert!(!pairs.iter().any(|(k, _)| k == "page"));
    }
}
