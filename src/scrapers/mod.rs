//! Listing sources and the region dispatch table.

pub mod browser;
pub mod cars_com;
pub mod che168;
pub mod html;
pub mod mobile_de;
pub mod replay;
pub mod traits;
pub mod types;

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Context, Result};
use futures::stream::{self, StreamExt};
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{AdapterKind, AppConfig, RegionConfig};
use crate::error::{CrawlError, ScrapeError};
use crate::models::{NormalizedListing, Region};

pub use cars_com::CarsComSource;
pub use che168::Che168Source;
pub use mobile_de::MobileDeSource;
pub use replay::ReplaySource;
pub use traits::{listing_stream, ListingSource, ListingStream};
pub use types::{ListingPage, SearchParams};

/// Every site the crawler can talk to
pub enum Adapter {
    Che168(Che168Source),
    MobileDe(MobileDeSource),
    CarsCom(CarsComSource),
    Replay(ReplaySource),
}

impl Adapter {
    pub fn from_config(config: &RegionConfig) -> Result<Self> {
        let adapter = match config.adapter {
            AdapterKind::Che168 => {
                Adapter::Che168(Che168Source::new(config).context("Failed to create che168 client")?)
            }
            AdapterKind::MobileDe => Adapter::MobileDe(MobileDeSource::new(config)),
            AdapterKind::CarsCom => Adapter::CarsCom(CarsComSource::new(config)),
            AdapterKind::Replay => {
                let path = config
                    .replay_path
                    .as_ref()
                    .ok_or_else(|| anyhow!("replay adapter needs replay_path"))?;
                Adapter::Replay(ReplaySource::from_file(path).with_page_delay(config.page_delay()))
            }
        };
        Ok(adapter)
    }

    pub fn source_name(&self) -> &'static str {
        match self {
            Adapter::Che168(s) => s.source_name(),
            Adapter::MobileDe(s) => s.source_name(),
            Adapter::CarsCom(s) => s.source_name(),
            Adapter::Replay(s) => s.source_name(),
        }
    }

    /// Paced, deduplicated stream of listings for `params`.
    pub fn search<'a>(&'a self, params: &'a SearchParams, cancel: CancellationToken) -> ListingStream<'a> {
        match self {
            Adapter::Che168(s) => listing_stream(s, params, cancel),
            Adapter::MobileDe(s) => listing_stream(s, params, cancel),
            Adapter::CarsCom(s) => listing_stream(s, params, cancel),
            Adapter::Replay(s) => listing_stream(s, params, cancel),
        }
    }
}

/// A listing (or listing-level error) tagged with the region it came from
pub type RegionItem = (Region, Result<NormalizedListing, ScrapeError>);

/// Static `Region → Adapter` table
pub struct RegionDispatcher {
    adapters: BTreeMap<Region, Adapter>,
    concurrency: usize,
}

impl RegionDispatcher {
    pub fn new(concurrency: usize) -> Self {
        Self {
            adapters: BTreeMap::new(),
            concurrency: concurrency.max(1),
        }
    }

    pub fn with_adapter(mut self, region: Region, adapter: Adapter) -> Self {
        self.adapters.insert(region, adapter);
        self
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let mut dispatcher = Self::new(config.scheduler.region_concurrency);
        for (code, region_config) in &config.regions {
            let region: Region = code.parse().map_err(|e: String| anyhow!(e))?;
            let adapter = Adapter::from_config(region_config)
                .with_context(|| format!("Failed to set up adapter for region {region}"))?;
            info!(%region, adapter = adapter.source_name(), "Registered adapter");
            dispatcher.adapters.insert(region, adapter);
        }
        Ok(dispatcher)
    }

    /// Crawl `regions` with bounded concurrency.
    ///
    /// Output keeps region order and, within a region, arrival order. Regions
    /// without an adapter are skipped; if none has one the task cannot run.
    pub fn dispatch<'a>(
        &'a self,
        regions: &BTreeSet<Region>,
        params: &'a SearchParams,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'a, RegionItem>, CrawlError> {
        let mut covered = Vec::new();
        for region in regions {
            match self.adapters.get(region) {
                Some(adapter) => covered.push((*region, adapter)),
                None => warn!(%region, "No adapter registered for region, skipping"),
            }
        }
        if covered.is_empty() {
            return Err(CrawlError::NoAdapter(regions.iter().copied().collect()));
        }

        let crawls = covered.into_iter().map(move |(region, adapter)| {
            let cancel = cancel.clone();
            async move {
                let items: Vec<_> = adapter.search(params, cancel).collect().await;
                stream::iter(items.into_iter().map(move |item| (region, item)))
            }
        });

        Ok(stream::iter(crawls)
            .buffered(self.concurrency)
            .flatten()
            .boxed())
    }
}
