//! External exchange-rate providers.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

const USER_AGENT: &str = "car-scout/0.1 (+rates)";

/// A provider that can quote `from → to`
#[async_trait]
pub trait RateSource: Send + Sync {
    async fn fetch_rate(&self, from: &str, to: &str) -> Result<f64>;

    fn source_name(&self) -> &'static str;
}

fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .context("Failed to create HTTP client")
}

/// Central Bank of Russia daily quotes. Every currency is quoted against RUB, so
/// other pairs are derived as a cross rate.
pub struct CbrSource {
    client: Client,
    url: String,
}

#[derive(Debug, Deserialize)]
pub struct CbrDaily {
    #[serde(rename = "Valute")]
    pub valute: HashMap<String, CbrQuote>,
}

#[derive(Debug, Deserialize)]
pub struct CbrQuote {
    #[serde(rename = "Value")]
    pub value: f64,
    #[serde(rename = "Nominal")]
    pub nominal: f64,
}

impl CbrDaily {
    fn rub_per_unit(&self, code: &str) -> Result<f64> {
        if code == "RUB" {
            return Ok(1.0);
        }
        let quote = self
            .valute
            .get(code)
            .ok_or_else(|| anyhow!("CBR has no quote for {code}"))?;
        if quote.nominal <= 0.0 || quote.value <= 0.0 {
            return Err(anyhow!("CBR quote for {code} is not positive"));
        }
        Ok(quote.value / quote.nominal)
    }

    pub fn cross_rate(&self, from: &str, to: &str) -> Result<f64> {
        Ok(self.rub_per_unit(from)? / self.rub_per_unit(to)?)
    }
}

impl CbrSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl RateSource for CbrSource {
    async fn fetch_rate(&self, from: &str, to: &str) -> Result<f64> {
        debug!(url = %self.url, "Fetching CBR daily rates");
        let daily: CbrDaily = self
            .client
            .get(&self.url)
            .send()
            .await
            .context("Failed to reach CBR")?
            .error_for_status()
            .context("CBR returned an error status")?
            .json()
            .await
            .context("Failed to parse CBR response")?;

        daily.cross_rate(from, to)
    }

    fn source_name(&self) -> &'static str {
        "cbr"
    }
}

/// exchangerate-api style `latest/{FROM}` endpoint
pub struct ExchangeRateApiSource {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct LatestRates {
    rates: HashMap<String, f64>,
}

impl ExchangeRateApiSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl RateSource for ExchangeRateApiSource {
    async fn fetch_rate(&self, from: &str, to: &str) -> Result<f64> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), from);
        debug!(url = %url, "Fetching exchange rates");

        let latest: LatestRates = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to reach exchange rate API")?
            .error_for_status()
            .context("Exchange rate API returned an error status")?
            .json()
            .await
            .context("Failed to parse exchange rate response")?;

        latest
            .rates
            .get(to)
            .copied()
            .ok_or_else(|| anyhow!("exchange rate API has no {from}/{to} rate"))
    }

    fn source_name(&self) -> &'static str {
        "exchangerate-api"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAILY: &str = r#"{
        "Date": "2025-01-10T11:30:00+03:00",
        "Valute": {
            "CNY": {"CharCode": "CNY", "Nominal": 1, "Value": 13.9},
            "USD": {"CharCode": "USD", "Nominal": 1, "Value": 101.68},
            "JPY": {"CharCode": "JPY", "Nominal": 100, "Value": 64.5}
        }
    }"#;

    #[test]
    fn cross_rates_go_through_rub() {
        let daily: CbrDaily = serde_json::from_str(DAILY).unwrap();

        assert_eq!(daily.cross_rate("CNY", "RUB").unwrap(), 13.9);
        assert!((daily.cross_rate("JPY", "RUB").unwrap() - 0.645).abs() < 1e-9);
        assert!((daily.cross_rate("USD", "CNY").unwrap() - 101.68 / 13.9).abs() < 1e-9);
        assert!(daily.cross_rate("EUR", "RUB").is_err());
    }
}
