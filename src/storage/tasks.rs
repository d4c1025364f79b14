//! Persistence for crawl tasks and their demand links.
//!
//! Pool-level methods on [`TaskStore`] serve the scheduler. The `pub(crate)`
//! connection-level functions run inside the registry's transactions.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use super::{from_millis, int_to, opt_from_millis, to_millis};
use crate::error::StorageError;
use crate::models::{CrawlFilter, CrawlTask, DemandLink, Region, TaskStatus};

const TASK_COLUMNS: &str = "id, brand_id, model_id, generation, year_from, year_to, regions, status, \
     priority, consecutive_failures, created_at, updated_at, last_parsed_at, next_parse_at, \
     last_error, lease_owner, lease_expires_at";

#[derive(Debug, FromRow)]
struct TaskRow {
    id: i64,
    brand_id: Option<i64>,
    model_id: Option<i64>,
    generation: Option<String>,
    year_from: i64,
    year_to: i64,
    regions: String,
    status: String,
    priority: i64,
    consecutive_failures: i64,
    created_at: i64,
    updated_at: Option<i64>,
    last_parsed_at: Option<i64>,
    next_parse_at: Option<i64>,
    last_error: Option<String>,
    lease_owner: Option<String>,
    lease_expires_at: Option<i64>,
}

impl TaskRow {
    fn into_task(self) -> Result<CrawlTask, StorageError> {
        let regions: BTreeSet<Region> = serde_json::from_str(&self.regions)?;
        let status = self
            .status
            .parse::<TaskStatus>()
            .map_err(|_| StorageError::Corrupt {
                column: "status",
                value: self.status.clone(),
            })?;

        Ok(CrawlTask {
            id: self.id,
            filter: CrawlFilter {
                brand_id: self.brand_id,
                model_id: self.model_id,
                generation: self.generation,
                year_from: int_to("year_from", self.year_from)?,
                year_to: int_to("year_to", self.year_to)?,
            },
            regions,
            status,
            priority: int_to("priority", self.priority)?,
            consecutive_failures: int_to("consecutive_failures", self.consecutive_failures)?,
            created_at: from_millis("created_at", self.created_at)?,
            updated_at: opt_from_millis("updated_at", self.updated_at)?,
            last_parsed_at: opt_from_millis("last_parsed_at", self.last_parsed_at)?,
            next_parse_at: opt_from_millis("next_parse_at", self.next_parse_at)?,
            last_error: self.last_error,
            lease_owner: self.lease_owner,
            lease_expires_at: opt_from_millis("lease_expires_at", self.lease_expires_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct LinkRow {
    search_id: i64,
    task_id: i64,
    new_listings_pending: bool,
    price_drop_pending: bool,
    created_at: i64,
    updated_at: Option<i64>,
}

impl LinkRow {
    fn into_link(self) -> Result<DemandLink, StorageError> {
        Ok(DemandLink {
            search_id: self.search_id,
            task_id: self.task_id,
            new_listings_pending: self.new_listings_pending,
            price_drop_pending: self.price_drop_pending,
            created_at: from_millis("created_at", self.created_at)?,
            updated_at: opt_from_millis("updated_at", self.updated_at)?,
        })
    }
}

/// Crawl task persistence used by the scheduler
#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Atomically claim up to `limit` due tasks for `owner`.
    ///
    /// A task is due when it is pending, when its rerun time has passed, or when
    /// another worker's lease on it has expired. The claim is a single UPDATE, so
    /// concurrent callers never receive the same task.
    pub async fn claim_due(
        &self,
        limit: u32,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<CrawlTask>, StorageError> {
        let sql = format!(
            "UPDATE crawl_tasks \
             SET status = 'processing', lease_owner = ?1, lease_expires_at = ?2, updated_at = ?3 \
             WHERE id IN ( \
                 SELECT id FROM crawl_tasks \
                 WHERE status = 'pending' \
                    OR (status IN ('completed', 'failed') AND next_parse_at <= ?3) \
                    OR (status = 'processing' AND lease_expires_at < ?3) \
                 ORDER BY priority DESC, created_at ASC, id ASC \
                 LIMIT ?4 \
             ) \
             RETURNING {TASK_COLUMNS}"
        );

        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(owner)
            .bind(to_millis(now + lease))
            .bind(to_millis(now))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        // RETURNING gives no ordering guarantee
        let mut tasks = rows
            .into_iter()
            .map(TaskRow::into_task)
            .collect::<Result<Vec<_>, _>>()?;
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(tasks)
    }

    /// Persist the outcome of a run. Returns `false` when `owner` no longer holds
    /// the lease, in which case nothing is written.
    pub async fn finish(&self, task: &CrawlTask, owner: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE crawl_tasks \
             SET status = ?, consecutive_failures = ?, last_parsed_at = ?, next_parse_at = ?, \
                 last_error = ?, updated_at = ?, lease_owner = NULL, lease_expires_at = NULL \
             WHERE id = ? AND lease_owner = ?",
        )
        .bind(task.status.as_str())
        .bind(i64::from(task.consecutive_failures))
        .bind(task.last_parsed_at.map(to_millis))
        .bind(task.next_parse_at.map(to_millis))
        .bind(task.last_error.as_deref())
        .bind(task.updated_at.map(to_millis))
        .bind(task.id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Push back the lease expiry of every task `owner` is still processing.
    /// Returns how many leases were renewed.
    pub async fn renew_leases(
        &self,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let result = sqlx::query(
            "UPDATE crawl_tasks SET lease_expires_at = ? \
             WHERE lease_owner = ? AND status = 'processing'",
        )
        .bind(to_millis(now + lease))
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn get(&self, task_id: i64) -> Result<Option<CrawlTask>, StorageError> {
        let mut conn = self.pool.acquire().await?;
        task_by_id(&mut conn, task_id).await
    }

    pub async fn list(&self) -> Result<Vec<CrawlTask>, StorageError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM crawl_tasks ORDER BY priority DESC, created_at ASC, id ASC"
        );
        let rows: Vec<TaskRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    /// Raise notification flags on every link attached to `task_id`.
    pub async fn flag_demand(
        &self,
        task_id: i64,
        new_listings: bool,
        price_drop: bool,
        now: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        if !new_listings && !price_drop {
            return Ok(0);
        }

        let result = sqlx::query(
            "UPDATE demand_links \
             SET new_listings_pending = MAX(new_listings_pending, ?), \
                 price_drop_pending = MAX(price_drop_pending, ?), \
                 updated_at = ? \
             WHERE task_id = ?",
        )
        .bind(new_listings)
        .bind(price_drop)
        .bind(to_millis(now))
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

pub(crate) async fn task_by_id(
    conn: &mut SqliteConnection,
    task_id: i64,
) -> Result<Option<CrawlTask>, StorageError> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM crawl_tasks WHERE id = ?");
    let row: Option<TaskRow> = sqlx::query_as(&sql)
        .bind(task_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(TaskRow::into_task).transpose()
}

pub(crate) async fn task_by_filter(
    conn: &mut SqliteConnection,
    filter: &CrawlFilter,
) -> Result<Option<CrawlTask>, StorageError> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM crawl_tasks WHERE filter_key = ?");
    let row: Option<TaskRow> = sqlx::query_as(&sql)
        .bind(filter.key())
        .fetch_optional(&mut *conn)
        .await?;
    row.map(TaskRow::into_task).transpose()
}

/// Insert a pending task at priority 0, due immediately.
pub(crate) async fn insert_task(
    conn: &mut SqliteConnection,
    filter: &CrawlFilter,
    regions: &BTreeSet<Region>,
    now: DateTime<Utc>,
) -> Result<i64, StorageError> {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO crawl_tasks \
         (filter_key, brand_id, model_id, generation, year_from, year_to, regions, status, \
          priority, consecutive_failures, created_at, updated_at, next_parse_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', 0, 0, ?, ?, ?) \
         RETURNING id",
    )
    .bind(filter.key())
    .bind(filter.brand_id)
    .bind(filter.model_id)
    .bind(filter.generation.as_deref())
    .bind(filter.year_from)
    .bind(filter.year_to)
    .bind(serde_json::to_string(regions)?)
    .bind(to_millis(now))
    .bind(to_millis(now))
    .bind(to_millis(now))
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

pub(crate) async fn set_regions(
    conn: &mut SqliteConnection,
    task_id: i64,
    regions: &BTreeSet<Region>,
    now: DateTime<Utc>,
) -> Result<(), StorageError> {
    sqlx::query("UPDATE crawl_tasks SET regions = ?, updated_at = ? WHERE id = ?")
        .bind(serde_json::to_string(regions)?)
        .bind(to_millis(now))
        .bind(task_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Add `delta` to a task's priority, never going below zero.
pub(crate) async fn adjust_priority(
    conn: &mut SqliteConnection,
    task_id: i64,
    delta: i64,
    now: DateTime<Utc>,
) -> Result<(), StorageError> {
    sqlx::query("UPDATE crawl_tasks SET priority = MAX(priority + ?, 0), updated_at = ? WHERE id = ?")
        .bind(delta)
        .bind(to_millis(now))
        .bind(task_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Returns `true` when a new link was created.
pub(crate) async fn insert_link(
    conn: &mut SqliteConnection,
    search_id: i64,
    task_id: i64,
    now: DateTime<Utc>,
) -> Result<bool, StorageError> {
    let result = sqlx::query(
        "INSERT INTO demand_links (search_id, task_id, created_at) VALUES (?, ?, ?) \
         ON CONFLICT (search_id, task_id) DO NOTHING",
    )
    .bind(search_id)
    .bind(task_id)
    .bind(to_millis(now))
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Returns `true` when a link was removed.
pub(crate) async fn delete_link(
    conn: &mut SqliteConnection,
    search_id: i64,
    task_id: i64,
) -> Result<bool, StorageError> {
    let result = sqlx::query("DELETE FROM demand_links WHERE search_id = ? AND task_id = ?")
        .bind(search_id)
        .bind(task_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub(crate) async fn links_for_search(
    conn: &mut SqliteConnection,
    search_id: i64,
) -> Result<Vec<DemandLink>, StorageError> {
    let rows: Vec<LinkRow> = sqlx::query_as(
        "SELECT search_id, task_id, new_listings_pending, price_drop_pending, created_at, updated_at \
         FROM demand_links WHERE search_id = ? ORDER BY task_id",
    )
    .bind(search_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(LinkRow::into_link).collect()
}

pub(crate) async fn clear_flags(
    conn: &mut SqliteConnection,
    search_id: i64,
    task_id: i64,
    now: DateTime<Utc>,
) -> Result<bool, StorageError> {
    let result = sqlx::query(
        "UPDATE demand_links \
         SET new_listings_pending = 0, price_drop_pending = 0, updated_at = ? \
         WHERE search_id = ? AND task_id = ?",
    )
    .bind(to_millis(now))
    .bind(search_id)
    .bind(task_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}
