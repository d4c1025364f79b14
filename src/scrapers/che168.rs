//! che168.com (China) through its mobile JSON search API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use reqwest::{header, Client, StatusCode, Url};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::traits::ListingSource;
use super::types::{ListingPage, SearchParams};
use crate::config::RegionConfig;
use crate::error::ScrapeError;
use crate::models::NormalizedListing;

const SOURCE: &str = "che168";
const DEFAULT_API_URL: &str = "https://api2scsou.che168.com/api/v11/search";
const MOBILE_USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";
const PAGE_SIZE: u32 = 10;
/// Prices and mileage are quoted in 万 (ten thousand)
const WAN: i64 = 10_000;

/// Site brand ids for the brands we know how to search
fn brand_id(brand: &str) -> Option<&'static str> {
    match brand.trim().to_lowercase().as_str() {
        "audi" => Some("33"),
        "bmw" => Some("56"),
        "mercedes-benz" | "mercedes" | "mercedes benz" => Some("57"),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(alias = "returnCode", alias = "ReturnCode")]
    returncode: i64,
    #[serde(default)]
    message: String,
    result: Option<ApiResult>,
}

#[derive(Debug, Deserialize)]
struct ApiResult {
    #[serde(default, alias = "pageCount", alias = "PageCount")]
    pagecount: u32,
    #[serde(default, alias = "carList", alias = "CarList")]
    carlist: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct CarDto {
    #[serde(alias = "infoId")]
    infoid: i64,
    #[serde(default, alias = "carName")]
    carname: Option<String>,
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    mileage: Option<String>,
    #[serde(default)]
    cname: Option<String>,
    #[serde(default, alias = "firstRegYear")]
    firstregyear: Option<String>,
    #[serde(default, alias = "dealerLevel")]
    dealerlevel: Option<String>,
    #[serde(default, alias = "imageUrl")]
    imageurl: Option<String>,
    #[serde(default, alias = "imageUrl_800", alias = "ImageUrl_800")]
    imageurl_800: Option<String>,
}

pub struct Che168Source {
    client: Client,
    api_url: String,
    page_delay: Duration,
}

impl Che168Source {
    pub fn new(config: &RegionConfig) -> Result<Self, ScrapeError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json, text/plain, */*"));
        headers.insert(header::ACCEPT_LANGUAGE, header::HeaderValue::from_static("zh-CN,zh;q=0.9"));

        let mut builder = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.as_deref().unwrap_or(MOBILE_USER_AGENT))
            .default_headers(headers);
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }

        Ok(Self {
            client: builder.build()?,
            api_url: config.base_url.clone().unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            page_delay: config.page_delay(),
        })
    }

    fn search_url(&self, params: &SearchParams, page: u32) -> Result<Url, ScrapeError> {
        let mut url = Url::parse(&self.api_url).map_err(|e| ScrapeError::UnsupportedFilter {
            source_name: SOURCE,
            reason: format!("invalid API url: {e}"),
        })?;

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("pageindex", &page.to_string())
                .append_pair("pagesize", &PAGE_SIZE.to_string())
                .append_pair("ishideback", "1")
                .append_pair("srecom", "2")
                .append_pair("cid", "0")
                .append_pair("car_area", "1")
                .append_pair("filtertype", "0")
                .append_pair("ssnew", "1")
                .append_pair("_appid", "2sc.m");

            if let Some(brand) = &params.brand {
                let id = brand_id(brand).ok_or_else(|| ScrapeError::UnsupportedFilter {
                    source_name: SOURCE,
                    reason: format!("brand '{brand}'"),
                })?;
                query.append_pair("brandid", id);
            }
        }

        Ok(url)
    }
}

#[async_trait]
impl ListingSource for Che168Source {
    async fn fetch_page(&self, params: &SearchParams, page: u32) -> Result<ListingPage, ScrapeError> {
        let url = self.search_url(params, page)?;
        info!(page, brand = ?params.brand, "Fetching che168 page");

        let response = self.client.get(url).send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            warn!(?retry_after, "che168 is rate limiting");
            return Err(ScrapeError::RateLimited {
                source_name: SOURCE,
                retry_after,
            });
        }
        if !status.is_success() {
            return Err(ScrapeError::Status {
                source_name: SOURCE,
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        debug!(bytes = body.len(), "Received che168 response");
        parse_search_response(&body, params, page, Utc::now())
    }

    fn source_name(&self) -> &'static str {
        SOURCE
    }

    fn page_delay(&self) -> Duration {
        self.page_delay
    }
}

/// Map one API response to listings. Bad cars become `Parse` items.
pub fn parse_search_response(
    body: &str,
    params: &SearchParams,
    page: u32,
    now: DateTime<Utc>,
) -> Result<ListingPage, ScrapeError> {
    let response: ApiResponse = serde_json::from_str(body)?;

    if response.returncode != 0 {
        warn!(code = response.returncode, message = %response.message, "che168 API returned an error");
        return Ok(ListingPage::default());
    }

    let Some(result) = response.result else {
        return Ok(ListingPage::default());
    };

    let has_next = if result.pagecount > 0 {
        page < result.pagecount
    } else {
        !result.carlist.is_empty()
    };

    // The API filters by brand only, so other models of the brand come back too
    let mut skipped = 0;
    let mut items = Vec::with_capacity(result.carlist.len());
    for raw in result.carlist {
        let mapped = serde_json::from_value::<CarDto>(raw)
            .map_err(|e| parse_error(format!("malformed car entry: {e}")))
            .and_then(|dto| map_car(dto, params, now));

        match (mapped, params.model.as_deref()) {
            (Ok(car), Some(wanted)) if !model_matches(wanted, &car.model) => {
                debug!(url = %car.source_url, model = %car.model, wanted, "Skipping car of another model");
                skipped += 1;
            }
            (Ok(car), Some(wanted)) => items.push(Ok(NormalizedListing {
                model: wanted.to_string(),
                ..car
            })),
            (other, _) => items.push(other),
        }
    }

    Ok(ListingPage {
        items,
        has_next,
        skipped,
    })
}

fn normalize_model(raw: &str) -> String {
    raw.to_lowercase()
        .replace('系', "series")
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Whether the leading words of a parsed model spell the searched model.
///
/// "X5 xDrive40i" matches "X5", "3系 325Li" matches "3 Series", "A4L 45 TFSI"
/// does not match "A4".
fn model_matches(wanted: &str, parsed: &str) -> bool {
    let wanted = normalize_model(wanted);
    if wanted.is_empty() {
        return true;
    }

    let mut prefix = String::new();
    for word in parsed.split_whitespace() {
        prefix.push_str(&normalize_model(word));
        if prefix == wanted {
            return true;
        }
        if prefix.len() >= wanted.len() {
            return false;
        }
    }
    false
}

fn parse_error(reason: String) -> ScrapeError {
    ScrapeError::Parse {
        source_name: SOURCE,
        reason,
    }
}

fn map_car(dto: CarDto, params: &SearchParams, now: DateTime<Utc>) -> Result<NormalizedListing, ScrapeError> {
    let car_name = dto
        .carname
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| parse_error(format!("car {} has no name", dto.infoid)))?;

    let name = parse_car_name(car_name, now.year());

    let year = name
        .year
        .or_else(|| dto.firstregyear.as_deref().and_then(parse_year))
        .ok_or_else(|| parse_error(format!("car {} has no year", dto.infoid)))?;

    let price = dto
        .price
        .as_deref()
        .and_then(parse_wan)
        .filter(|p| *p > Decimal::ZERO)
        .ok_or_else(|| parse_error(format!("car {} has no price", dto.infoid)))?;

    let mileage = dto
        .mileage
        .as_deref()
        .and_then(parse_wan)
        .and_then(|km| km.trunc().try_into().ok());

    // The site names brands in Chinese and the query pins the brand id
    let brand = params.brand.clone().unwrap_or(name.brand);
    let model = Some(name.model)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| parse_error(format!("car {} has no model", dto.infoid)))?;

    Ok(NormalizedListing {
        source: SOURCE.to_string(),
        brand,
        model,
        year,
        price,
        currency: "CNY".to_string(),
        mileage,
        source_url: format!("https://www.che168.com/home?infoid={}", dto.infoid),
        image_url: image_url(dto.imageurl_800.as_deref().or(dto.imageurl.as_deref())),
        city: dto.cname.filter(|c| !c.trim().is_empty()),
        country: Some("China".to_string()),
        dealer: dto.dealerlevel.filter(|d| !d.trim().is_empty()),
        parsed_at: now,
    })
}

struct CarName {
    brand: String,
    model: String,
    year: Option<i32>,
}

/// "奥迪 Q3 2024款 40 TFSI 时尚动感型" → brand, model words, model year
fn parse_car_name(car_name: &str, current_year: i32) -> CarName {
    let mut parts = car_name.split_whitespace();
    let brand = parts.next().unwrap_or_default().to_string();

    let mut year = None;
    let mut model = Vec::new();
    for part in parts {
        if part.contains('款') {
            if let Some(y) = parse_year(&part.replace('款', "")) {
                if y <= current_year + 1 {
                    year = Some(y);
                    continue;
                }
            }
        }
        if part.chars().count() > 1 {
            model.push(part);
        }
    }

    CarName {
        brand,
        model: model.join(" "),
        year,
    }
}

fn parse_year(raw: &str) -> Option<i32> {
    let digits: String = raw.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse::<i32>().ok().filter(|y| *y >= 1900)
}

fn parse_wan(raw: &str) -> Option<Decimal> {
    raw.trim()
        .parse::<Decimal>()
        .ok()
        .map(|v| v * Decimal::from(WAN))
}

fn image_url(raw: Option<&str>) -> Option<String> {
    let raw = raw?.trim();
    if raw.is_empty() {
        None
    } else if raw.starts_with("http") {
        Some(raw.to_string())
    } else {
        Some(format!("https:{raw}"))
    }
}
