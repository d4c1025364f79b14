//! Configuration loading.
//!
//! Settings come from an optional TOML file layered under environment variables
//! prefixed with `CAR_SCOUT__` (e.g. `CAR_SCOUT__SCHEDULER__BATCH_SIZE=20`).
//! Every value has a default, so an empty environment runs the stock setup.
//!
//! ```toml
//! [database]
//! url = "sqlite://car-scout.db"
//!
//! [scheduler]
//! poll_interval_secs = 60
//! batch_size = 10
//!
//! [regions.europe]
//! adapter = "mobile_de"
//! page_delay_ms = 2000
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "car-scout.toml";

/// Ceiling for configured rerun delays, keeping `now + delay` representable
pub const MAX_DELAY_MINUTES: u64 = 365 * 24 * 60;
pub const MAX_LEASE_SECS: u64 = 24 * 60 * 60;

/// Complete application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub scheduler: SchedulerConfig,
    pub backoff: BackoffConfig,
    pub currency: CurrencyConfig,
    /// Keyed by region code (`china`, `europe`, `usa`)
    pub regions: BTreeMap<String, RegionConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            scheduler: SchedulerConfig::default(),
            backoff: BackoffConfig::default(),
            currency: CurrencyConfig::default(),
            regions: default_regions(),
        }
    }
}

impl AppConfig {
    /// Load from `path` (or `car-scout.toml`) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));

        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("CAR_SCOUT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path.display()))?;

        let config: AppConfig = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;
        Ok(config.clamped())
    }

    /// Pull out-of-range durations back into what the scheduler can add to a timestamp.
    pub fn clamped(mut self) -> Self {
        self.scheduler.lease_secs = self.scheduler.lease_secs.clamp(1, MAX_LEASE_SECS);

        let backoff = &mut self.backoff;
        for minutes in [
            &mut backoff.idle_minutes,
            &mut backoff.base_minutes,
            &mut backoff.cap_minutes,
            &mut backoff.rate_limited_cap_minutes,
        ] {
            *minutes = (*minutes).min(MAX_DELAY_MINUTES);
        }
        for tier in &mut backoff.success_tiers {
            tier.minutes = tier.minutes.min(MAX_DELAY_MINUTES);
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// How long a writer waits for the write lock before giving up
    pub busy_timeout_ms: u64,
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://car-scout.db".to_string(),
            max_connections: 5,
            busy_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u64,
    /// Maximum tasks claimed per cycle
    pub batch_size: u32,
    /// Tasks processed concurrently within a cycle
    pub max_workers: usize,
    /// How long a claim stays valid before another worker may take the task
    pub lease_secs: u64,
    /// Pause after a cycle-level error
    pub error_pause_secs: u64,
    pub max_listings_per_task: usize,
    pub max_pages: u32,
    /// Regions of one task crawled concurrently
    pub region_concurrency: usize,
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn error_pause(&self) -> Duration {
        Duration::from_secs(self.error_pause_secs)
    }

    pub fn lease(&self) -> chrono::Duration {
        let secs = self.lease_secs.clamp(1, MAX_LEASE_SECS);
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
    }

    /// Leases held by a running cycle are renewed three times per lease period
    pub fn heartbeat_interval(&self) -> Duration {
        let lease_ms = self.lease_secs.clamp(1, MAX_LEASE_SECS) * 1000;
        Duration::from_millis((lease_ms / 3).max(100))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            batch_size: 10,
            max_workers: 2,
            lease_secs: 900,
            error_pause_secs: 300,
            max_listings_per_task: 100,
            max_pages: 10,
            region_concurrency: 2,
        }
    }
}

/// A task with at least `min_priority` attached searches reruns every `minutes`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuccessTier {
    pub min_priority: u32,
    pub minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub success_tiers: Vec<SuccessTier>,
    /// Rerun interval below the lowest tier
    pub idle_minutes: u64,
    pub base_minutes: u64,
    pub cap_minutes: u64,
    pub rate_limited_cap_minutes: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            success_tiers: vec![
                SuccessTier { min_priority: 10, minutes: 15 },
                SuccessTier { min_priority: 5, minutes: 30 },
                SuccessTier { min_priority: 2, minutes: 60 },
            ],
            idle_minutes: 120,
            base_minutes: 5,
            cap_minutes: 120,
            rate_limited_cap_minutes: 240,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrencyConfig {
    /// Currency every listing is converted into
    pub target: String,
    pub cache_ttl_secs: u64,
    pub request_timeout_secs: u64,
    /// Central Bank of Russia daily rates (primary source)
    pub cbr_url: String,
    /// exchangerate-api style `latest/{FROM}` endpoint (secondary source)
    pub exchange_rate_url: String,
    /// Value of one unit of each currency in RUB
    pub fallback_rates: HashMap<String, f64>,
}

impl CurrencyConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for CurrencyConfig {
    fn default() -> Self {
        let fallback_rates = [
            ("RUB", 1.0),
            ("CNY", 12.5),
            ("USD", 92.0),
            ("EUR", 99.0),
            ("JPY", 0.61),
            ("KRW", 0.065),
        ]
        .into_iter()
        .map(|(code, rate)| (code.to_string(), rate))
        .collect();

        Self {
            target: "RUB".to_string(),
            cache_ttl_secs: 30 * 60,
            request_timeout_secs: 10,
            cbr_url: "https://www.cbr-xml-daily.ru/daily_json.js".to_string(),
            exchange_rate_url: "https://api.exchangerate-api.com/v4/latest".to_string(),
            fallback_rates,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Che168,
    MobileDe,
    CarsCom,
    Replay,
}

/// Adapter binding and site etiquette for one region
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    pub adapter: AdapterKind,
    /// Search endpoint; the adapter's own default when unset
    pub base_url: Option<String>,
    /// Pause between page requests
    pub page_delay_ms: u64,
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
    /// Listings file for the replay adapter
    pub replay_path: Option<PathBuf>,
    pub headless: bool,
    pub request_timeout_secs: u64,
}

impl RegionConfig {
    pub fn new(adapter: AdapterKind, page_delay_ms: u64) -> Self {
        Self {
            adapter,
            page_delay_ms,
            ..Self::default()
        }
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            adapter: AdapterKind::Replay,
            base_url: None,
            page_delay_ms: 1000,
            user_agent: None,
            proxy: None,
            replay_path: None,
            headless: true,
            request_timeout_secs: 120,
        }
    }
}

fn default_regions() -> BTreeMap<String, RegionConfig> {
    BTreeMap::from([
        ("china".to_string(), RegionConfig::new(AdapterKind::Che168, 100)),
        ("europe".to_string(), RegionConfig::new(AdapterKind::MobileDe, 2000)),
        ("usa".to_string(), RegionConfig::new(AdapterKind::CarsCom, 2000)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_cover_every_region() {
        let config = AppConfig::default();
        assert_eq!(config.regions["china"].adapter, AdapterKind::Che168);
        assert_eq!(config.regions["europe"].adapter, AdapterKind::MobileDe);
        assert_eq!(config.regions["usa"].adapter, AdapterKind::CarsCom);
        assert_eq!(config.scheduler.batch_size, 10);
        assert_eq!(config.currency.fallback_rates["CNY"], 12.5);
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[scheduler]
batch_size = 3

[regions.china]
adapter = "replay"
replay_path = "fixtures/china.json"
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.scheduler.batch_size, 3);
        assert_eq!(config.scheduler.poll_interval_secs, 60);
        assert_eq!(config.regions["china"].adapter, AdapterKind::Replay);
        assert_eq!(
            config.regions["china"].replay_path.as_deref(),
            Some(Path::new("fixtures/china.json"))
        );
    }

    #[test]
    fn oversized_durations_are_clamped_on_load() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[scheduler]
lease_secs = 9223372036854775807

[backoff]
cap_minutes = 9223372036854775807
success_tiers = [{{ min_priority = 1, minutes = 9223372036854775807 }}]
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.scheduler.lease_secs, MAX_LEASE_SECS);
        assert_eq!(config.backoff.cap_minutes, MAX_DELAY_MINUTES);
        assert_eq!(config.backoff.success_tiers[0].minutes, MAX_DELAY_MINUTES);

        let _ = chrono::Utc::now() + config.scheduler.lease();
        assert_eq!(config.scheduler.heartbeat_interval(), Duration::from_secs(MAX_LEASE_SECS / 3));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = AppConfig::load(Some(Path::new("does-not-exist.toml"))).unwrap();
        assert_eq!(config.currency.target, "RUB");
        assert_eq!(config.backoff.cap_minutes, 120);
        assert!(config.regions.contains_key("europe"));
    }
}
