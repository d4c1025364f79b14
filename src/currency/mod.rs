//! Currency conversion with caching and tiered fallback.
//!
//! Rates are looked up in order: cache, each configured [`RateSource`], then a
//! static table of RUB anchors. Lookups never fail; a degraded answer is logged.

pub mod sources;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::CurrencyConfig;
pub use sources::{CbrSource, ExchangeRateApiSource, RateSource};

#[derive(Debug, Clone, Copy)]
struct CachedRate {
    rate: Decimal,
    fetched_at: Instant,
}

pub struct CurrencyNormalizer {
    target: String,
    sources: Vec<Box<dyn RateSource>>,
    /// Value of one unit of each currency in RUB
    anchors: HashMap<String, Decimal>,
    ttl: Duration,
    cache: RwLock<HashMap<String, CachedRate>>,
    /// One lock per cache key so concurrent misses share a single fetch
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

fn cache_key(from: &str, to: &str) -> String {
    format!("rate:{from}:{to}")
}

fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

impl CurrencyNormalizer {
    pub fn new(
        target: &str,
        sources: Vec<Box<dyn RateSource>>,
        fallback_rates: &HashMap<String, f64>,
        ttl: Duration,
    ) -> Self {
        // Keys may arrive lowercased from the config layer
        let anchors = fallback_rates
            .iter()
            .filter_map(|(code, rate)| {
                Decimal::try_from(*rate)
                    .ok()
                    .filter(|r| *r > Decimal::ZERO)
                    .map(|r| (normalize_code(code), r))
            })
            .collect();

        Self {
            target: normalize_code(target),
            sources,
            anchors,
            ttl,
            cache: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// CBR first, exchangerate-api second, static anchors last.
    pub fn from_config(config: &CurrencyConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let sources: Vec<Box<dyn RateSource>> = vec![
            Box::new(CbrSource::new(&config.cbr_url, timeout)?),
            Box::new(ExchangeRateApiSource::new(&config.exchange_rate_url, timeout)?),
        ];
        Ok(Self::new(
            &config.target,
            sources,
            &config.fallback_rates,
            config.cache_ttl(),
        ))
    }

    /// Currency every listing is stored in
    pub fn target(&self) -> &str {
        &self.target
    }

    /// `amount` in `to`, rounded to two decimal places. Equal codes pass through.
    pub async fn convert(&self, amount: Decimal, from: &str, to: &str) -> Decimal {
        if from.trim().eq_ignore_ascii_case(to.trim()) {
            return amount;
        }
        (amount * self.get_rate(from, to).await).round_dp(2)
    }

    pub async fn get_rate(&self, from: &str, to: &str) -> Decimal {
        let from = normalize_code(from);
        let to = normalize_code(to);
        if from == to {
            return Decimal::ONE;
        }

        let key = cache_key(&from, &to);
        if let Some(rate) = self.cached(&key).await {
            return rate;
        }

        let lock = self.key_lock(&key).await;
        let _guard = lock.lock().await;

        // Another caller may have filled the cache while we waited
        if let Some(rate) = self.cached(&key).await {
            return rate;
        }

        for source in &self.sources {
            match source.fetch_rate(&from, &to).await {
                Ok(raw) => match Decimal::try_from(raw) {
                    Ok(rate) if rate > Decimal::ZERO => {
                        debug!(source = source.source_name(), %from, %to, %rate, "Fetched exchange rate");
                        self.cache.write().await.insert(
                            key,
                            CachedRate {
                                rate,
                                fetched_at: Instant::now(),
                            },
                        );
                        return rate;
                    }
                    _ => warn!(source = source.source_name(), %from, %to, raw, "Ignoring unusable rate"),
                },
                Err(e) => {
                    warn!(source = source.source_name(), %from, %to, error = %e, "Rate source failed")
                }
            }
        }

        let rate = self.fallback_rate(&from, &to);
        warn!(%from, %to, %rate, "Using fallback exchange rate");
        rate
    }

    pub async fn invalidate_cache(&self, from: &str, to: &str) {
        let key = cache_key(&normalize_code(from), &normalize_code(to));
        self.cache.write().await.remove(&key);
    }

    async fn cached(&self, key: &str) -> Option<Decimal> {
        let cache = self.cache.read().await;
        cache
            .get(key)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.rate)
    }

    async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut inflight = self.inflight.lock().await;
        inflight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Ratio of RUB anchors; an unknown currency yields 1.
    fn fallback_rate(&self, from: &str, to: &str) -> Decimal {
        match (self.anchors.get(from), self.anchors.get(to)) {
            (Some(from_rub), Some(to_rub)) => from_rub / to_rub,
            _ => {
                warn!(%from, %to, "No fallback anchor, assuming parity");
                Decimal::ONE
            }
        }
    }
}
