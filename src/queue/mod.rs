//! The demand ledger.
//!
//! Many user searches with identical criteria share one [`CrawlTask`]. Each
//! attached search is a [`DemandLink`], and the task's priority is the number of
//! links attached to it.

pub mod backoff;

use std::collections::BTreeSet;

use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::error::RegistryError;
use crate::models::{CrawlFilter, CrawlTask, DemandLink, Region};
use crate::storage::{begin_write, tasks};

pub use backoff::BackoffPolicy;

pub const DEFAULT_YEAR_FROM: i32 = 2015;
pub const MIN_YEAR: i32 = 1900;

/// Search criteria as submitted by a user; unset values get defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchCriteria {
    pub brand_id: Option<i64>,
    pub model_id: Option<i64>,
    pub generation: Option<String>,
    pub year_from: Option<i32>,
    pub year_to: Option<i32>,
    pub regions: BTreeSet<Region>,
}

impl SearchCriteria {
    /// Apply defaults and validate, yielding the task identity and its regions.
    pub fn resolve(&self) -> Result<(CrawlFilter, BTreeSet<Region>), RegistryError> {
        let year_from = self.year_from.unwrap_or(DEFAULT_YEAR_FROM);
        let year_to = self.year_to.unwrap_or_else(|| Utc::now().year());

        if year_from < MIN_YEAR || year_to < MIN_YEAR {
            return Err(RegistryError::InvalidCriteria(format!(
                "years must be at least {MIN_YEAR}"
            )));
        }
        if year_from > year_to {
            return Err(RegistryError::InvalidCriteria(format!(
                "year_from {year_from} is after year_to {year_to}"
            )));
        }

        let generation = self
            .generation
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_string);

        let regions = if self.regions.is_empty() {
            BTreeSet::from([Region::China])
        } else {
            self.regions.clone()
        };

        let filter = CrawlFilter {
            brand_id: self.brand_id,
            model_id: self.model_id,
            generation,
            year_from,
            year_to,
        };
        Ok((filter, regions))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnqueueOutcome {
    pub task_id: i64,
    /// A new task was created for these criteria
    pub created: bool,
    /// A new demand link was created (false when the search was already attached)
    pub attached: bool,
}

/// Transactional access to crawl tasks and demand links
#[derive(Clone)]
pub struct SearchQueueRegistry {
    pool: SqlitePool,
}

impl SearchQueueRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Attach `search_id` to the task for `criteria`, creating the task if needed.
    pub async fn enqueue_or_attach(
        &self,
        criteria: &SearchCriteria,
        search_id: i64,
    ) -> Result<EnqueueOutcome, RegistryError> {
        let (filter, regions) = criteria.resolve()?;

        let mut tx = begin_write(&self.pool).await?;
        let outcome = attach(&mut tx, &filter, &regions, search_id).await?;
        tx.commit().await?;

        info!(
            task_id = outcome.task_id,
            search_id,
            created = outcome.created,
            attached = outcome.attached,
            "Search enqueued"
        );
        Ok(outcome)
    }

    /// Remove the link between a search and a task. Returns whether one existed.
    pub async fn detach_demand(&self, search_id: i64, task_id: i64) -> Result<bool, RegistryError> {
        let mut tx = begin_write(&self.pool).await?;
        let removed = detach(&mut tx, search_id, task_id).await?;
        tx.commit().await?;

        debug!(search_id, task_id, removed, "Demand detached");
        Ok(removed)
    }

    /// Detach a search from every task it is linked to.
    pub async fn cancel_search(&self, search_id: i64) -> Result<usize, RegistryError> {
        let mut tx = begin_write(&self.pool).await?;
        let links = tasks::links_for_search(&mut tx, search_id).await?;

        let mut removed = 0;
        for link in &links {
            if detach(&mut tx, search_id, link.task_id).await? {
                removed += 1;
            }
        }
        tx.commit().await?;

        info!(search_id, removed, "Search cancelled");
        Ok(removed)
    }

    /// Move a search whose criteria changed onto the matching task.
    pub async fn repoint(
        &self,
        search_id: i64,
        from_task_id: i64,
        criteria: &SearchCriteria,
    ) -> Result<EnqueueOutcome, RegistryError> {
        let (filter, regions) = criteria.resolve()?;

        let mut tx = begin_write(&self.pool).await?;
        detach(&mut tx, search_id, from_task_id).await?;
        let outcome = attach(&mut tx, &filter, &regions, search_id).await?;
        tx.commit().await?;

        info!(
            search_id,
            from_task_id,
            task_id = outcome.task_id,
            "Search repointed"
        );
        Ok(outcome)
    }

    pub async fn task(&self, task_id: i64) -> Result<CrawlTask, RegistryError> {
        let mut conn = self.pool.acquire().await?;
        tasks::task_by_id(&mut conn, task_id)
            .await?
            .ok_or(RegistryError::TaskNotFound(task_id))
    }

    pub async fn links_for_search(&self, search_id: i64) -> Result<Vec<DemandLink>, RegistryError> {
        let mut conn = self.pool.acquire().await?;
        Ok(tasks::links_for_search(&mut conn, search_id).await?)
    }

    /// Clear the notification flags once the consumer has delivered them.
    pub async fn mark_notified(&self, search_id: i64, task_id: i64) -> Result<bool, RegistryError> {
        let mut conn = self.pool.acquire().await?;
        Ok(tasks::clear_flags(&mut conn, search_id, task_id, Utc::now()).await?)
    }
}

async fn attach(
    conn: &mut SqliteConnection,
    filter: &CrawlFilter,
    regions: &BTreeSet<Region>,
    search_id: i64,
) -> Result<EnqueueOutcome, RegistryError> {
    let now = Utc::now();

    let (task_id, created) = match tasks::task_by_filter(conn, filter).await? {
        Some(task) => {
            if !regions.is_subset(&task.regions) {
                let merged: BTreeSet<Region> = task.regions.union(regions).copied().collect();
                tasks::set_regions(conn, task.id, &merged, now).await?;
            }
            (task.id, false)
        }
        None => (tasks::insert_task(conn, filter, regions, now).await?, true),
    };

    let attached = tasks::insert_link(conn, search_id, task_id, now).await?;
    if attached {
        tasks::adjust_priority(conn, task_id, 1, now).await?;
    }

    Ok(EnqueueOutcome {
        task_id,
        created,
        attached,
    })
}

async fn detach(conn: &mut SqliteConnection, search_id: i64, task_id: i64) -> Result<bool, RegistryError> {
    let removed = tasks::delete_link(conn, search_id, task_id).await?;
    if removed {
        tasks::adjust_priority(conn, task_id, -1, Utc::now()).await?;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskStatus;
    use crate::storage::Database;

    fn bmw() -> SearchCriteria {
        SearchCriteria {
            brand_id: Some(1),
            year_from: Some(2018),
            year_to: Some(2020),
            ..SearchCriteria::default()
        }
    }

    async fn registry() -> (Database, SearchQueueRegistry) {
        let db = Database::in_memory().await.unwrap();
        let registry = SearchQueueRegistry::new(db.pool().clone());
        (db, registry)
    }

    #[test]
    fn defaults_are_applied() {
        let (filter, regions) = SearchCriteria::default().resolve().unwrap();
        assert_eq!(filter.year_from, 2015);
        assert_eq!(filter.year_to, Utc::now().year());
        assert_eq!(regions, BTreeSet::from([Region::China]));
    }

    #[test]
    fn inverted_or_ancient_years_are_rejected() {
        let inverted = SearchCriteria {
            year_from: Some(2021),
            year_to: Some(2019),
            ..SearchCriteria::default()
        };
        assert!(matches!(inverted.resolve(), Err(RegistryError::InvalidCriteria(_))));

        let ancient = SearchCriteria {
            year_from: Some(1850),
            ..SearchCriteria::default()
        };
        assert!(ancient.resolve().is_err());
    }

    #[tokio::test]
    async fn attach_is_idempotent() {
        let (_db, registry) = registry().await;

        let first = registry.enqueue_or_attach(&bmw(), 7).await.unwrap();
        let second = registry.enqueue_or_attach(&bmw(), 7).await.unwrap();

        assert!(first.created && first.attached);
        assert_eq!(second.task_id, first.task_id);
        assert!(!second.created && !second.attached);

        let task = registry.task(first.task_id).await.unwrap();
        assert_eq!(task.priority, 1);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(registry.links_for_search(7).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unset_fields_only_match_unset_fields() {
        let (_db, registry) = registry().await;

        let wildcard = registry.enqueue_or_attach(&bmw(), 1).await.unwrap();
        let specific = SearchCriteria {
            model_id: Some(4),
            ..bmw()
        };
        let narrowed = registry.enqueue_or_attach(&specific, 2).await.unwrap();
        assert_ne!(wildcard.task_id, narrowed.task_id);
    }

    #[tokio::test]
    async fn regions_are_merged_on_attach() {
        let (_db, registry) = registry().await;

        let first = registry.enqueue_or_attach(&bmw(), 1).await.unwrap();
        let europe = SearchCriteria {
            regions: BTreeSet::from([Region::Europe]),
            ..bmw()
        };
        registry.enqueue_or_attach(&europe, 2).await.unwrap();

        let task = registry.task(first.task_id).await.unwrap();
        assert_eq!(task.regions, BTreeSet::from([Region::China, Region::Europe]));
    }

    #[tokio::test]
    async fn detach_only_counts_existing_links() {
        let (_db, registry) = registry().await;

        let outcome = registry.enqueue_or_attach(&bmw(), 1).await.unwrap();
        assert!(!registry.detach_demand(99, outcome.task_id).await.unwrap());
        assert_eq!(registry.task(outcome.task_id).await.unwrap().priority, 1);

        assert!(registry.detach_demand(1, outcome.task_id).await.unwrap());
        assert!(!registry.detach_demand(1, outcome.task_id).await.unwrap());
        assert_eq!(registry.task(outcome.task_id).await.unwrap().priority, 0);
    }

    #[tokio::test]
    async fn cancel_and_repoint_move_demand() {
        let (_db, registry) = registry().await;

        let a = registry.enqueue_or_attach(&bmw(), 5).await.unwrap();
        let audi = SearchCriteria {
            brand_id: Some(2),
            ..bmw()
        };
        let b = registry.repoint(5, a.task_id, &audi).await.unwrap();

        assert_eq!(registry.task(a.task_id).await.unwrap().priority, 0);
        assert_eq!(registry.task(b.task_id).await.unwrap().priority, 1);

        registry.enqueue_or_attach(&bmw(), 5).await.unwrap();
        assert_eq!(registry.cancel_search(5).await.unwrap(), 2);
        assert!(registry.links_for_search(5).await.unwrap().is_empty());
        assert_eq!(registry.task(b.task_id).await.unwrap().priority, 0);
    }

    #[tokio::test]
    async fn unknown_task_is_reported() {
        let (_db, registry) = registry().await;
        assert!(matches!(registry.task(404).await, Err(RegistryError::TaskNotFound(404))));
    }
}
