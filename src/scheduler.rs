//! Lock-guarded periodic jobs.
//!
//! Every instance ticks the same jobs; the distributed lock lets one of them
//! in, and `job_runs.last_run_at` (checked again after acquiring the lock)
//! keeps a job from running twice within its interval.

use std::future::Future;
use std::time::Duration;

use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::config::SchedulerConfig;
use crate::idempotency;
use crate::lock::{names, DistributedLock};
use crate::storage::schema::JobRuns;
use crate::storage::{now_millis, StorageError};

/// Outcome of [`JobScheduler::run_if_due`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRun<T> {
    Ran(T),
    /// The job ran within its interval.
    NotDue,
    /// Another instance holds the job's lock.
    LockHeld,
}

#[derive(Clone)]
pub struct JobScheduler {
    pool: SqlitePool,
    lock: DistributedLock,
}

impl JobScheduler {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            lock: DistributedLock::new(pool.clone()),
            pool,
        }
    }

    /// Run `f` under the lock named `job` if it has not run in the last `every`.
    pub async fn run_if_due<F, Fut, T>(
        &self,
        job: &str,
        every: Duration,
        ttl: Duration,
        f: F,
    ) -> Result<JobRun<T>, StorageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.is_due(job, every).await? {
            return Ok(JobRun::NotDue);
        }

        let context = serde_json::json!({ "job": job, "everyMs": every.as_millis() as u64 });
        let locked = self
            .lock
            .with_lock(job, ttl, context, move || self.run_locked(job, every, f))
            .await?;

        match locked {
            None => {
                debug!(job, "Job lock held elsewhere");
                Ok(JobRun::LockHeld)
            }
            Some(Ok(None)) => Ok(JobRun::NotDue),
            Some(Ok(Some(output))) => {
                info!(job, "Job ran");
                Ok(JobRun::Ran(output))
            }
            Some(Err(e)) => Err(e),
        }
    }

    async fn run_locked<F, Fut, T>(
        &self,
        job: &str,
        every: Duration,
        f: F,
    ) -> Result<Option<T>, StorageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        // Another instance may have finished the job between the first check
        // and acquiring the lock.
        if !self.is_due(job, every).await? {
            return Ok(None);
        }
        let output = f().await;
        self.record_run(job).await?;
        Ok(Some(output))
    }

    /// Epoch ms of the job's last recorded run.
    pub async fn last_run_at(&self, job: &str) -> Result<Option<i64>, StorageError> {
        let select = Query::select()
            .column(JobRuns::LastRunAt)
            .from(JobRuns::Table)
            .and_where(Expr::col(JobRuns::JobName).eq(job))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&select).fetch_optional(&self.pool).await?;
        Ok(match row {
            Some(row) => Some(row.try_get("last_run_at")?),
            None => None,
        })
    }

    async fn is_due(&self, job: &str, every: Duration) -> Result<bool, StorageError> {
        Ok(match self.last_run_at(job).await? {
            Some(last) => now_millis() - last >= every.as_millis() as i64,
            None => true,
        })
    }

    async fn record_run(&self, job: &str) -> Result<(), StorageError> {
        let upsert = Query::insert()
            .into_table(JobRuns::Table)
            .columns([JobRuns::JobName, JobRuns::LastRunAt])
            .values_panic([job.into(), now_millis().into()])
            .on_conflict(
                OnConflict::column(JobRuns::JobName)
                    .update_column(JobRuns::LastRunAt)
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&upsert).execute(&self.pool).await?;
        Ok(())
    }

    /// Purge expired idempotency records, at most once per configured interval.
    pub async fn run_retention_cleanup(
        &self,
        config: &SchedulerConfig,
    ) -> Result<JobRun<u64>, StorageError> {
        let pool = self.pool.clone();
        self.run_if_due(
            names::IDEMPOTENCY_RETENTION,
            config.retention_every(),
            config.default_ttl(),
            || async move { idempotency::purge_expired(&pool, now_millis()).await },
        )
        .await
    }
}
