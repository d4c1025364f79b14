//! mobile.de (Europe), rendered in headless Chrome and parsed with `scraper`.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Url;
use scraper::{Html, Selector};
use tracing::{debug, info};

use super::browser::{BrowserSession, PageSpec};
use super::html::{absolute_url, attr_of, collapse, digits, max_page_number, parse_amount, text_of};
use super::traits::ListingSource;
use super::types::{ListingPage, SearchParams};
use crate::config::RegionConfig;
use crate::error::ScrapeError;
use crate::models::NormalizedListing;

const SOURCE: &str = "mobile.de";
const ORIGIN: &str = "https://www.mobile.de";
const DEFAULT_SEARCH_URL: &str = "https://suchen.mobile.de/fahrzeuge/search.html";

const PAGE_SPEC: PageSpec = PageSpec {
    source_name: SOURCE,
    card_selector: "[data-testid='vehicle-card']",
    consent_selector: Some("button.mde-consent-accept-btn"),
};

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

static CARD: LazyLock<Selector> = LazyLock::new(|| selector("[data-testid='vehicle-card']"));
static TITLE: LazyLock<Selector> = LazyLock::new(|| selector(".js-title-link"));
static LINK: LazyLock<Selector> = LazyLock::new(|| selector("a.js-title-link"));
static IMAGE: LazyLock<Selector> = LazyLock::new(|| selector("img"));
static PRICE: LazyLock<Selector> = LazyLock::new(|| selector("[data-testid='price-primary']"));
static DETAIL: LazyLock<Selector> = LazyLock::new(|| selector(".rk-preset"));
static LOCATION: LazyLock<Selector> = LazyLock::new(|| selector("[data-testid='seller-location']"));
static DEALER: LazyLock<Selector> = LazyLock::new(|| selector("[data-testid='seller-name']"));
static PAGINATION: LazyLock<Selector> = LazyLock::new(|| selector("[data-testid='pagination']"));
static PAGE_LINK: LazyLock<Selector> = LazyLock::new(|| selector("a"));

/// "2019" or first registration "EZ 05/2019"
static YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:EZ\s*)?(?:\d{2}/)?(\d{4})$").expect("static regex"));
static MILEAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{1,3}(?:\.\d{3})*\s*km").expect("static regex"));

pub struct MobileDeSource {
    session: BrowserSession,
    search_url: String,
    page_delay: Duration,
}

impl MobileDeSource {
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

        let keywords: Vec<&str> = [&params.brand, &params.model, &params.generation]
            .into_iter()
            .filter_map(|v| v.as_deref())
            .collect();

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("isSearchRequest", "true")
                .append_pair("s", "Car")
                .append_pair("vc", "Car")
                .append_pair("fr", &format!("{}:{}", params.year_from, params.year_to));
            if !keywords.is_empty() {
                query.append_pair("q", &keywords.join(" "));
            }
            if page > 1 {
                query.append_pair("pageNumber", &page.to_string());
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl ListingSource for MobileDeSource {
    async fn fetch_page(&self, params: &SearchParams, page: u32) -> Result<ListingPage, ScrapeError> {
        let url = self.page_url(params, page)?;
        info!(%url, page, "Opening mobile.de search page");

        let html = self.session.fetch_html(url.as_str(), PAGE_SPEC).await?;
        let parsed = parse_search_page(&html, params, page, Utc::now());
        debug!(page, cards = parsed.items.len(), has_next = parsed.has_next, "Parsed mobile.de page");
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

/// Extract vehicle cards from a rendered results page.
pub fn parse_search_page(html: &str, params: &SearchParams, page: u32, now: DateTime<Utc>) -> ListingPage {
    let document = Html::parse_document(html);

    let items = document
        .select(&CARD)
        .map(|card| -> Result<NormalizedListing, ScrapeError> {
            let title = text_of(card, &TITLE).ok_or_else(|| parse_error("card without title"))?;
            let href = attr_of(card, &LINK, "href")
                .ok_or_else(|| parse_error(format!("'{title}' has no link")))?;
            let price = text_of(card, &PRICE)
                .and_then(|p| parse_amount(&p, ','))
                .ok_or_else(|| parse_error(format!("'{title}' has no price")))?;

            let details: Vec<String> = card
                .select(&DETAIL)
                .map(|d| collapse(&d.text().collect::<String>()))
                .collect();
            let year = details
                .iter()
                .find_map(|d| YEAR.captures(d).and_then(|c| c[1].parse::<i32>().ok()))
                .ok_or_else(|| parse_error(format!("'{title}' has no year")))?;
            let mileage = details
                .iter()
                .find_map(|d| MILEAGE.find(d).and_then(|m| digits(m.as_str())));

            let (city, country) = match text_of(card, &LOCATION) {
                Some(location) => {
                    let mut parts = location.split(',').map(str::trim);
                    let city = parts.next().filter(|c| !c.is_empty()).map(str::to_string);
                    let country = parts.next().filter(|c| !c.is_empty()).map(str::to_string);
                    (city, country)
                }
                None => (None, None),
            };

            let (brand, model) = split_title(&title, params)?;

            Ok(NormalizedListing {
                source: SOURCE.to_string(),
                brand,
                model,
                year,
                price,
                currency: "EUR".to_string(),
                mileage,
                source_url: absolute_url(&href, ORIGIN),
                image_url: attr_of(card, &IMAGE, "src"),
                city,
                country: country.or_else(|| Some("Germany".to_string())),
                dealer: text_of(card, &DEALER),
                parsed_at: now,
            })
        })
        .collect();

    let total_pages = document
        .select(&PAGINATION)
        .next()
        .map(|p| max_page_number(p, &PAGE_LINK))
        .unwrap_or(1);

    ListingPage::new(items, page < total_pages)
}

/// Brand and model from a card title such as "BMW X5 xDrive30d M Sport".
/// Searched names win over guesses from the title.
fn split_title(title: &str, params: &SearchParams) -> Result<(String, String), ScrapeError> {
    let mut words = title.split_whitespace();
    let title_brand = words.next().map(str::to_string);
    let title_model = words.next().map(str::to_string);

    let brand = params
        .brand
        .clone()
        .or(title_brand)
        .ok_or_else(|| parse_error("empty title"))?;
    let model = params
        .model
        .clone()
        .or(title_model)
        .ok_or_else(|| parse_error(format!("'{title}' has no model")))?;
    Ok((brand, model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    const PAGE: &str = r#"
    <html><body>
      <article data-testid="vehicle-card">
        <a class="js-title-link" href="/fahrzeuge/details.html?id=111">BMW X5 xDrive30d M Sport</a>
        <img src="https://img.classistatic.de/111.jpg">
        <span data-testid="price-primary">24.990,50&nbsp;€</span>
        <div class="rk-preset">EZ 05/2019</div>
        <div class="rk-preset">87.500 km</div>
        <div class="rk-preset">Diesel</div>
        <span data-testid="seller-location">Berlin, DE</span>
        <span data-testid="seller-name">Autohaus Nord</span>
      </article>
      <article data-testid="vehicle-card">
        <a class="js-title-link" href="/fahrzeuge/details.html?id=112">BMW X3 20d</a>
        <span data-testid="price-primary">Preis auf Anfrage</span>
        <div class="rk-preset">2020</div>
      </article>
      <article data-testid="vehicle-card">
        <a class="js-title-link" href="https://suchen.mobile.de/fahrzeuge/details.html?id=113">BMW 320i</a>
        <span data-testid="price-primary">18.000 €</span>
        <div class="rk-preset">2018</div>
      </article>
      <nav data-testid="pagination"><a>1</a><a>2</a><a>3</a><a>Weiter</a></nav>
    </body></html>"#;

    fn bmw() -> SearchParams {
        SearchParams {
            brand: Some("BMW".into()),
            ..SearchParams::default()
        }
    }

    #[test]
    fn parses_cards() {
        let page = parse_search_page(PAGE, &bmw(), 1, Utc::now());
        assert_eq!(page.items.len(), 3);
        assert!(page.has_next);

        let first = page.items[0].as_ref().unwrap();
        assert_eq!(first.brand, "BMW");
        assert_eq!(first.model, "X5");
        assert_eq!(first.year, 2019);
        assert_eq!(first.price, Decimal::from_str("24990.50").unwrap());
        assert_eq!(first.mileage, Some(87_500));
        assert_eq!(first.source_url, "https://www.mobile.de/fahrzeuge/details.html?id=111");
        assert_eq!(first.city.as_deref(), Some("Berlin"));
        assert_eq!(first.country.as_deref(), Some("DE"));
        assert_eq!(first.dealer.as_deref(), Some("Autohaus Nord"));

        assert!(matches!(page.items[1], Err(ScrapeError::Parse { .. })));

        let third = page.items[2].as_ref().unwrap();
        assert_eq!(third.source_url, "https://suchen.mobile.de/fahrzeuge/details.html?id=113");
        assert_eq!(third.country.as_deref(), Some("Germany"));
    }

    #[test]
    fn last_page_stops() {
        let page = parse_search_page(PAGE, &bmw(), 3, Utc::now());
        assert!(!page.has_next);
    }

    #[test]
    fn search_url_carries_filter() {
        let source = MobileDeSource::new(&RegionConfig::default());
        let params = SearchParams {
            model: Some("X5".into()),
            year_from: 2018,
            year_to: 2020,
            ..bmw()
        };
        let url = source.page_url(&params, 2).unwrap();
        let query = url.query().unwrap_or_default();
        assert!(query.contains("fr=2018%3A2020"));
        assert!(query.contains("q=BMW+X5"));
        assert!(query.contains("pageNumber=2"));
    }
}
