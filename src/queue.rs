//! Durable work queue for item processing tasks.
//!
//! Jobs live in their own SQLite database so that the dispatcher can enqueue
//! while it holds the write lock on the batch store. Delivery is
//! at-least-once: a claimed job is leased, and a worker that dies mid-task
//! simply lets the lease expire.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::db;
use crate::model::ProcessItem;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
    #[error("queue migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("stored job {id} is corrupt: {reason}")]
    Corrupt { id: i64, reason: String },
    #[error("failed to encode job: {0}")]
    Encode(#[from] serde_json::Error),
}

/// How often, and after how long, a failed task is tried again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Wait before retry `n` is `intervals[n]`; the last entry repeats.
    pub intervals: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            intervals: [10, 30, 60].into_iter().map(Duration::from_secs).collect(),
        }
    }
}

impl RetryPolicy {
    pub fn from_secs(max_retries: u32, intervals: &[u64]) -> Self {
        Self {
            max_retries,
            intervals: intervals.iter().copied().map(Duration::from_secs).collect(),
        }
    }

    pub fn interval_for(&self, attempt: u32) -> Duration {
        self.intervals
            .get(attempt as usize)
            .or_else(|| self.intervals.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

/// A leased job handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: i64,
    pub task: ProcessItem,
    /// Retries already spent.
    pub attempt: u32,
    pub retry: RetryPolicy,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Accept a task for processing; returns the job id.
    async fn enqueue(&self, task: ProcessItem, retry: &RetryPolicy) -> Result<i64, QueueError>;
}

#[derive(Debug, Clone)]
pub struct SqliteTaskQueue {
    pool: SqlitePool,
    name: String,
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), QueueError> {
    sqlx::migrate!("./migrations/queue").run(pool).await?;
    Ok(())
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// `at + delay` in epoch millis, saturating instead of wrapping.
fn millis_after(at: DateTime<Utc>, delay: Duration) -> i64 {
    let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    millis(at).saturating_add(delay_ms)
}

fn job_from_row(row: &SqliteRow) -> Result<Job, QueueError> {
    let id: i64 = row.try_get("id")?;
    let intervals: String = row.try_get("intervals")?;
    let intervals: Vec<u64> =
        serde_json::from_str(&intervals).map_err(|err| QueueError::Corrupt {
            id,
            reason: err.to_string(),
        })?;
    let attempt: i64 = row.try_get("attempt")?;
    let max_retries: i64 = row.try_get("max_retries")?;
    Ok(Job {
        id,
        task: ProcessItem {
            item_id: row.try_get("item_id")?,
        },
        attempt: attempt as u32,
        retry: RetryPolicy::from_secs(max_retries as u32, &intervals),
    })
}

impl SqliteTaskQueue {
    pub fn new(pool: SqlitePool, name: impl Into<String>) -> Self {
        Self {
            pool,
            name: name.into(),
        }
    }

    /// Open (creating if needed) the queue database and bring its schema up to date.
    pub async fn connect(
        database_url: &str,
        busy_timeout: Duration,
        name: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let pool = db::init_pool(database_url, busy_timeout).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool, name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn claim_next(&self, lease: Duration) -> Result<Option<Job>, QueueError> {
        self.claim_next_at(lease, Utc::now()).await
    }

    /// Lease the oldest due job that nobody holds a live lease on.
    #[instrument(skip_all, fields(queue = %self.name))]
    pub async fn claim_next_at(
        &self,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        let now_ms = millis(now);
        let row = sqlx::query(
            "UPDATE jobs SET leased_until = ? \
             WHERE id = ( \
                 SELECT id FROM jobs \
                 WHERE queue = ? AND due_at <= ? \
                   AND (leased_until IS NULL OR leased_until <= ?) \
                 ORDER BY due_at ASC, id ASC LIMIT 1) \
             RETURNING id, item_id, attempt, max_retries, intervals",
        )
        .bind(millis_after(now, lease))
        .bind(&self.name)
        .bind(now_ms)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip_all, fields(job_id = job.id))]
    pub async fn complete(&self, job: &Job) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(job.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn fail(&self, job: &Job) -> Result<bool, QueueError> {
        self.fail_at(job, Utc::now()).await
    }

    /// Reschedule a failed job, or drop it once its retries are spent.
    /// Returns whether it will run again.
    #[instrument(skip_all, fields(job_id = job.id, attempt = job.attempt))]
    pub async fn fail_at(&self, job: &Job, now: DateTime<Utc>) -> Result<bool, QueueError> {
        if job.attempt >= job.retry.max_retries {
            sqlx::query("DELETE FROM jobs WHERE id = ?")
                .bind(job.id)
                .execute(&self.pool)
                .await?;
            error!(
                item_id = job.task.item_id,
                retries = job.attempt,
                "retries exhausted; dropping job"
            );
            return Ok(false);
        }

        let delay = job.retry.interval_for(job.attempt);
        sqlx::query(
            "UPDATE jobs SET attempt = attempt + 1, due_at = ?, leased_until = NULL WHERE id = ?",
        )
        .bind(millis_after(now, delay))
        .bind(job.id)
        .execute(&self.pool)
        .await?;
        info!(item_id = job.task.item_id, ?delay, "job rescheduled");
        Ok(true)
    }

    pub async fn len(&self) -> Result<i64, QueueError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE queue = ?")
            .bind(&self.name)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }

    /// Drop every job on this queue. Returns how many were removed.
    pub async fn clear(&self) -> Result<u64, QueueError> {
        let res = sqlx::query("DELETE FROM jobs WHERE queue = ?")
            .bind(&self.name)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl TaskQueue for SqliteTaskQueue {
    #[instrument(skip_all, fields(queue = %self.name, item_id = task.item_id))]
    async fn enqueue(&self, task: ProcessItem, retry: &RetryPolicy) -> Result<i64, QueueError> {
        let now = Utc::now();
        let intervals: Vec<u64> = retry.intervals.iter().map(Duration::as_secs).collect();
        let intervals = serde_json::to_string(&intervals)?;
        let id: i64 = sqlx::query(
            "INSERT INTO jobs (queue, item_id, attempt, max_retries, intervals, due_at, created_at) \
             VALUES (?, ?, 0, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&self.name)
        .bind(task.item_id)
        .bind(retry.max_retries as i64)
        .bind(intervals)
        .bind(millis(now))
        .bind(now)
        .fetch_one(&self.pool)
        .await?
        .get("id");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    async fn setup_queue() -> SqliteTaskQueue {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteTaskQueue::new(pool, "amex")
    }

    const LEASE: Duration = Duration::from_secs(60);

    #[test]
    fn last_interval_repeats() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.interval_for(0), Duration::from_secs(10));
        assert_eq!(policy.interval_for(2), Duration::from_secs(60));
        assert_eq!(policy.interval_for(7), Duration::from_secs(60));
        assert_eq!(RetryPolicy::from_secs(1, &[]).interval_for(0), Duration::ZERO);
    }

    #[tokio::test]
    async fn claim_is_fifo_and_leased() {
        let queue = setup_queue().await;
        let policy = RetryPolicy::default();
        let first = queue.enqueue(ProcessItem { item_id: 1 }, &policy).await.unwrap();
        queue.enqueue(ProcessItem { item_id: 2 }, &policy).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 2);

        let now = Utc::now() + ChronoDuration::seconds(1);
        let job = queue.claim_next_at(LEASE, now).await.unwrap().unwrap();
        assert_eq!(job.id, first);
        assert_eq!(job.task.item_id, 1);
        assert_eq!(job.retry, policy);

        let second = queue.claim_next_at(LEASE, now).await.unwrap().unwrap();
        assert_eq!(second.task.item_id, 2);
        assert!(queue.claim_next_at(LEASE, now).await.unwrap().is_none());

        queue.complete(&job).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn expired_lease_makes_job_visible_again() {
        let queue = setup_queue().await;
        queue
            .enqueue(ProcessItem { item_id: 9 }, &RetryPolicy::default())
            .await
            .unwrap();
        let now = Utc::now() + ChronoDuration::seconds(1);
        let job = queue.claim_next_at(LEASE, now).await.unwrap().unwrap();

        let later = now + ChronoDuration::seconds(61);
        let again = queue.claim_next_at(LEASE, later).await.unwrap().unwrap();
        assert_eq!(again.id, job.id);
    }

    #[tokio::test]
    async fn failed_job_is_retried_at_intervals_then_dropped() {
        let queue = setup_queue().await;
        let policy = RetryPolicy::from_secs(2, &[10, 30]);
        queue.enqueue(ProcessItem { item_id: 5 }, &policy).await.unwrap();

        let mut now = Utc::now() + ChronoDuration::seconds(1);
        let job = queue.claim_next_at(LEASE, now).await.unwrap().unwrap();
        assert!(queue.fail_at(&job, now).await.unwrap());

        // Not due until the first interval has passed.
        assert!(queue
            .claim_next_at(LEASE, now + ChronoDuration::seconds(9))
            .await
            .unwrap()
            .is_none());
        now += ChronoDuration::seconds(10);
        let job = queue.claim_next_at(LEASE, now).await.unwrap().unwrap();
        assert_eq!(job.attempt, 1);
        assert!(queue.fail_at(&job, now).await.unwrap());

        now += ChronoDuration::seconds(30);
        let job = queue.claim_next_at(LEASE, now).await.unwrap().unwrap();
        assert_eq!(job.attempt, 2);
        assert!(!queue.fail_at(&job, now).await.unwrap());
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn clear_only_touches_own_queue() {
        let queue = setup_queue().await;
        let other = SqliteTaskQueue::new(queue.pool.clone(), "other");
        let policy = RetryPolicy::default();
        queue.enqueue(ProcessItem { item_id: 1 }, &policy).await.unwrap();
        queue.enqueue(ProcessItem { item_id: 2 }, &policy).await.unwrap();
        other.enqueue(ProcessItem { item_id: 3 }, &policy).await.unwrap();

        assert_eq!(queue.clear().await.unwrap(), 2);
        assert_eq!(queue.len().await.unwrap(), 0);
        assert_eq!(other.len().await.unwrap(), 1);
    }

    #[test]
    fn huge_delays_saturate() {
        let now = Utc::now();
        assert_eq!(millis_after(now, Duration::from_secs(u64::MAX)), i64::MAX);
        assert_eq!(millis_after(now, Duration::from_secs(2)), millis(now) + 2_000);
    }
}
