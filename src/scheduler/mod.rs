//! The crawl loop.
//!
//! Each cycle claims due tasks under a lease, crawls their regions, stores what
//! comes back and reschedules every task through [`BackoffPolicy`].

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{AppConfig, SchedulerConfig};
use crate::currency::CurrencyNormalizer;
use crate::error::{CrawlError, ScrapeError, StorageError};
use crate::models::CrawlTask;
use crate::queue::BackoffPolicy;
use crate::scrapers::{RegionDispatcher, SearchParams};
use crate::storage::{ConvertedPrice, Database, StorageWriter, TaskStore, UpsertOutcome};

const EVENT_CAPACITY: usize = 64;

/// What one run of a task did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Listings received from adapters
    pub fetched: usize,
    /// Listings inside the task's year range and listing budget
    pub in_range: usize,
    pub inserted: usize,
    pub price_changes: usize,
    pub price_drops: usize,
    pub unchanged: usize,
    /// Listings skipped because they could not be parsed or stored
    pub failed: usize,
}

/// Published after every successful task run
#[derive(Debug, Clone, Serialize)]
pub struct IngestEvent {
    pub task_id: i64,
    pub report: IngestReport,
    pub completed_at: DateTime<Utc>,
}

pub struct Scheduler {
    worker_id: String,
    config: SchedulerConfig,
    policy: BackoffPolicy,
    tasks: TaskStore,
    writer: StorageWriter,
    currency: Arc<CurrencyNormalizer>,
    dispatcher: Arc<RegionDispatcher>,
    events: broadcast::Sender<IngestEvent>,
}

impl Scheduler {
    pub fn new(
        db: &Database,
        dispatcher: RegionDispatcher,
        currency: CurrencyNormalizer,
        config: SchedulerConfig,
        policy: BackoffPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            worker_id: Uuid::new_v4().to_string(),
            config,
            policy,
            tasks: db.tasks(),
            writer: db.writer(),
            currency: Arc::new(currency),
            dispatcher: Arc::new(dispatcher),
            events,
        }
    }

    /// Wire adapters, currency sources and policy from configuration.
    pub fn from_config(db: &Database, config: &AppConfig) -> Result<Self> {
        Ok(Self::new(
            db,
            RegionDispatcher::from_config(config)?,
            CurrencyNormalizer::from_config(&config.currency)?,
            config.scheduler.clone(),
            BackoffPolicy::from_config(&config.backoff),
        ))
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.events.subscribe()
    }

    /// Poll until `shutdown` fires. Cycle errors pause the loop, never end it.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            worker_id = %self.worker_id,
            batch_size = self.config.batch_size,
            max_workers = self.config.max_workers,
            "🚗 Scheduler starting"
        );

        while !shutdown.is_cancelled() {
            let pause = match self.run_cycle(&shutdown).await {
                Ok(processed) => {
                    if processed > 0 {
                        info!(processed, "Cycle finished");
                    }
                    self.config.poll_interval()
                }
                Err(e) => {
                    error!(error = %e, pause_secs = self.config.error_pause_secs, "Scheduler cycle failed");
                    self.config.error_pause()
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!(worker_id = %self.worker_id, "Scheduler stopped");
    }

    /// Claim and process one batch. Returns how many tasks were processed.
    pub async fn run_cycle(&self, shutdown: &CancellationToken) -> Result<usize, StorageError> {
        let claimed = self
            .tasks
            .claim_due(self.config.batch_size, &self.worker_id, self.config.lease(), Utc::now())
            .await?;

        if claimed.is_empty() {
            debug!("No due tasks");
            return Ok(0);
        }
        info!(count = claimed.len(), "Claimed tasks");

        let work = stream::iter(claimed)
            .map(|task| self.process_task(task, shutdown))
            .buffered(self.config.max_workers.max(1))
            .collect::<Vec<CrawlTask>>();
        tokio::pin!(work);

        // Queued and running tasks of this batch keep their leases until they finish
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.tick().await;

        let finished = loop {
            tokio::select! {
                finished = &mut work => break finished,
                _ = heartbeat.tick() => self.renew_leases().await,
            }
        };

        Ok(finished.len())
    }

    async fn renew_leases(&self) {
        match self
            .tasks
            .renew_leases(&self.worker_id, self.config.lease(), Utc::now())
            .await
        {
            Ok(renewed) => debug!(renewed, "Leases renewed"),
            Err(e) => warn!(error = %e, "Lease heartbeat failed"),
        }
    }

    /// Crawl one claimed task and persist its next state, which is returned.
    pub async fn process_task(&self, task: CrawlTask, shutdown: &CancellationToken) -> CrawlTask {
        info!(task_id = task.id, priority = task.priority, regions = ?task.regions, "Processing task");

        let result = self.crawl(&task, shutdown.child_token()).await;
        let now = Utc::now();

        let next = match &result {
            Ok(_) => task.completed(&self.policy, now),
            Err(CrawlError::Cancelled) => {
                info!(task_id = task.id, "Crawl interrupted, releasing task");
                task.released(now)
            }
            Err(e) => {
                warn!(task_id = task.id, error = %e, failures = task.consecutive_failures + 1, "Task failed");
                task.failed(e, &self.policy, now)
            }
        };

        match self.tasks.finish(&next, &self.worker_id).await {
            Ok(true) => {}
            Ok(false) => warn!(task_id = task.id, "Lease lost before the task finished"),
            Err(e) => error!(task_id = task.id, error = %e, "Failed to save task state"),
        }

        if let Ok(report) = result {
            self.announce(&next, report, now).await;
        }
        next
    }

    async fn announce(&self, task: &CrawlTask, report: IngestReport, now: DateTime<Utc>) {
        let new_listings = report.inserted > 0;
        let price_drop = report.price_drops > 0;
        if let Err(e) = self.tasks.flag_demand(task.id, new_listings, price_drop, now).await {
            error!(task_id = task.id, error = %e, "Failed to flag attached searches");
        }

        info!(
            task_id = task.id,
            fetched = report.fetched,
            inserted = report.inserted,
            price_changes = report.price_changes,
            failed = report.failed,
            next_parse_at = ?task.next_parse_at,
            "✅ Task completed"
        );

        // No subscribers is fine
        let _ = self.events.send(IngestEvent {
            task_id: task.id,
            report,
            completed_at: now,
        });
    }

    async fn search_params(&self, task: &CrawlTask) -> Result<SearchParams, CrawlError> {
        let brand = match task.filter.brand_id {
            Some(id) => Some(
                self.writer
                    .brand_name(id)
                    .await?
                    .ok_or(CrawlError::UnknownReference { entity: "brand", id })?,
            ),
            None => None,
        };
        let model = match task.filter.model_id {
            Some(id) => Some(
                self.writer
                    .model_name(id)
                    .await?
                    .ok_or(CrawlError::UnknownReference { entity: "model", id })?,
            ),
            None => None,
        };

        Ok(SearchParams {
            brand,
            model,
            generation: task.filter.generation.clone(),
            year_from: task.filter.year_from,
            year_to: task.filter.year_to,
            max_pages: self.config.max_pages,
            max_listings: self.config.max_listings_per_task,
        })
    }

    async fn crawl(&self, task: &CrawlTask, cancel: CancellationToken) -> Result<IngestReport, CrawlError> {
        let params = self.search_params(task).await?;
        let mut listings = self.dispatcher.dispatch(&task.regions, &params, cancel)?;
        let target = self.currency.target().to_string();
        let mut report = IngestReport::default();

        while let Some((region, item)) = listings.next().await {
            let listing = match item {
                Ok(listing) => listing,
                Err(e) if e.is_item_level() => {
                    warn!(task_id = task.id, %region, error = %e, "Skipping unparseable listing");
                    report.failed += 1;
                    continue;
                }
                Err(ScrapeError::Cancelled) => return Err(CrawlError::Cancelled),
                Err(source) => return Err(CrawlError::Scrape { region, source }),
            };
            report.fetched += 1;

            if !task.filter.accepts_year(listing.year) {
                debug!(task_id = task.id, url = %listing.source_url, year = listing.year, "Outside year range");
                continue;
            }
            if report.in_range >= self.config.max_listings_per_task {
                debug!(task_id = task.id, "Listing budget reached");
                break;
            }
            report.in_range += 1;

            let amount = self
                .currency
                .convert(listing.price, &listing.currency, &target)
                .await;
            let converted = ConvertedPrice {
                amount,
                currency: target.clone(),
            };

            match self.writer.upsert_listing(&listing, region, &converted).await {
                Ok(UpsertOutcome::Inserted { id }) => {
                    debug!(task_id = task.id, listing_id = id, url = %listing.source_url, "Listing inserted");
                    report.inserted += 1;
                }
                Ok(UpsertOutcome::Repriced { id, change }) => {
                    debug!(
                        task_id = task.id,
                        listing_id = id,
                        old = %change.old_price,
                        new = %change.new_price,
                        "Price changed"
                    );
                    report.price_changes += 1;
                    if change.is_drop() {
                        report.price_drops += 1;
                    }
                }
                Ok(UpsertOutcome::Unchanged { .. }) => report.unchanged += 1,
                Err(e) => {
                    warn!(task_id = task.id, url = %listing.source_url, error = %e, "Failed to store listing");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CurrencyConfig;
    use crate::models::{Region, TaskStatus};
    use crate::queue::{SearchCriteria, SearchQueueRegistry};
    use crate::scrapers::{Adapter, ReplaySource};
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn offline_currency() -> CurrencyNormalizer {
        let config = CurrencyConfig::default();
        CurrencyNormalizer::new("RUB", Vec::new(), &config.fallback_rates, Duration::from_secs(60))
    }

    fn scheduler(db: &Database, adapter: Adapter) -> Scheduler {
        let dispatcher = RegionDispatcher::new(1).with_adapter(Region::China, adapter);
        Scheduler::new(
            db,
            dispatcher,
            offline_currency(),
            SchedulerConfig::default(),
            BackoffPolicy::default(),
        )
    }

    #[tokio::test]
    async fn shutdown_releases_claimed_task_without_failure() {
        let db = Database::in_memory().await.unwrap();
        let registry = SearchQueueRegistry::new(db.pool().clone());
        let slow = ReplaySource::from_values(Vec::new()).with_page_delay(Duration::from_secs(60));
        let scheduler = scheduler(&db, Adapter::Replay(slow));

        let outcome = registry
            .enqueue_or_attach(&SearchCriteria::default(), 1)
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let claimed = db
            .tasks()
            .claim_due(1, scheduler.worker_id(), chrono::Duration::minutes(15), Utc::now())
            .await
            .unwrap();
        let next = scheduler.process_task(claimed[0].clone(), &shutdown).await;

        assert_eq!(next.status, TaskStatus::Pending);
        assert_eq!(next.consecutive_failures, 0);
        let stored = registry.task(outcome.task_id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert!(stored.lease_owner.is_none());
    }

    #[tokio::test]
    async fn unknown_brand_id_fails_the_task() {
        let db = Database::in_memory().await.unwrap();
        let registry = SearchQueueRegistry::new(db.pool().clone());
        let scheduler = scheduler(&db, Adapter::Replay(ReplaySource::from_values(Vec::new())));

        let criteria = SearchCriteria {
            brand_id: Some(999),
            regions: BTreeSet::from([Region::China]),
            ..SearchCriteria::default()
        };
        registry.enqueue_or_attach(&criteria, 1).await.unwrap();

        let processed = scheduler.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(processed, 1);

        let task = db.tasks().list().await.unwrap().remove(0);
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.last_error.unwrap().contains("unknown brand"));
    }
}
