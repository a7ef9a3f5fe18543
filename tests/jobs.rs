//! Distributed lock and lock-guarded jobs across competing instances.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;

use common::{count, date, file_pool, memory_pool, tenant};
use ledgerbox::config::SchedulerConfig;
use ledgerbox::lock::{names, DistributedLock};
use ledgerbox::payments::{CapturePayment, PaymentService};
use ledgerbox::scheduler::{JobRun, JobScheduler};
use ledgerbox::OutboxPublisher;

#[tokio::test]
async fn test_backup_scheduler_has_single_holder() {
    let db = file_pool(4).await;
    let pool = db.pool.clone();
    let ttl = SchedulerConfig::default().default_ttl();
    assert_eq!(ttl, Duration::from_millis(900_000));

    let instances: Vec<DistributedLock> = (0..6).map(|_| DistributedLock::new(pool.clone())).collect();
    let attempts = instances.iter().enumerate().map(|(i, lock)| async move {
        lock.try_acquire(names::BACKUP_SCHEDULER, ttl, &json!({ "instance": i }))
            .await
            .unwrap()
    });
    let leases: Vec<_> = join_all(attempts).await.into_iter().flatten().collect();

    assert_eq!(leases.len(), 1);
    let lease = &leases[0];
    let remaining = lease.expires_at - chrono::Utc::now().timestamp_millis();
    assert!(remaining > 899_000 && remaining <= 900_000);

    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM distributed_locks WHERE name = 'backup-scheduler'").await,
        1
    );
}

#[tokio::test]
async fn test_one_of_two_backup_triggers_creates_the_backup() {
    let db = file_pool(4).await;
    let pool = db.pool.clone();
    sqlx::query("CREATE TABLE backup_settings (id INTEGER PRIMARY KEY, last_scheduled_backup_at INTEGER)")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO backup_settings (id) VALUES (1)")
        .execute(&pool)
        .await
        .unwrap();

    let backups = Arc::new(AtomicUsize::new(0));
    let ttl = Duration::from_millis(900_000);
    let triggers = (0..2).map(|i| {
        let lock = DistributedLock::new(pool.clone());
        let pool = pool.clone();
        let backups = backups.clone();
        async move {
            lock.with_lock(
                names::BACKUP_SCHEDULER,
                ttl,
                json!({ "trigger": "schedule", "instance": i }),
                || async move {
                    backups.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    sqlx::query("UPDATE backup_settings SET last_scheduled_backup_at = ? WHERE id = 1")
                        .bind(chrono::Utc::now().timestamp_millis())
                        .execute(&pool)
                        .await
                        .unwrap();
                },
            )
            .await
            .unwrap()
        }
    });
    let outcomes = join_all(triggers).await;

    assert_eq!(outcomes.iter().filter(|o| o.is_some()).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| o.is_none()).count(), 1);
    assert_eq!(backups.load(Ordering::SeqCst), 1);

    let marked: Option<i64> =
        sqlx::query_scalar("SELECT last_scheduled_backup_at FROM backup_settings WHERE id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(marked.is_some());
    // Released after the run, so the next scheduled trigger can take it.
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM distributed_locks").await, 0);
}

#[tokio::test]
async fn test_released_lock_is_available_again() {
    let pool = memory_pool().await;
    let a = DistributedLock::new(pool.clone());
    let b = DistributedLock::new(pool);
    let ttl = Duration::from_secs(900);

    let held = a
        .with_lock(names::BACKUP_SCHEDULER, ttl, json!({}), || async {
            b.try_acquire(names::BACKUP_SCHEDULER, ttl, &json!({}))
                .await
                .unwrap()
                .is_some()
        })
        .await
        .unwrap();
    assert_eq!(held, Some(false));

    assert!(b
        .try_acquire(names::BACKUP_SCHEDULER, ttl, &json!({}))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_job_runs_once_across_instances() {
    let db = file_pool(4).await;
    let pool = db.pool.clone();
    let runs = Arc::new(AtomicUsize::new(0));
    let every = Duration::from_secs(3600);
    let ttl = Duration::from_secs(900);

    let schedulers: Vec<JobScheduler> = (0..4).map(|_| JobScheduler::new(pool.clone())).collect();
    let ticks = schedulers.iter().map(|scheduler| {
        let runs = runs.clone();
        async move {
            scheduler
                .run_if_due("nightly-backup", every, ttl, || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                })
                .await
                .unwrap()
        }
    });
    let outcomes = join_all(ticks).await;

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(
        outcomes.iter().filter(|o| matches!(o, JobRun::Ran(()))).count(),
        1
    );
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, JobRun::Ran(()) | JobRun::NotDue | JobRun::LockHeld)));

    // Within the interval every later tick is a no-op.
    let again = schedulers[0]
        .run_if_due("nightly-backup", every, ttl, || async {})
        .await
        .unwrap();
    assert_eq!(again, JobRun::NotDue);
}

#[tokio::test]
async fn test_retention_cleanup_purges_expired_keys() {
    let pool = memory_pool().await;
    let payments = PaymentService::new(
        OutboxPublisher::new(pool.clone()).with_retention(Duration::ZERO),
    );
    payments
        .capture(
            tenant(),
            "cap-1",
            CapturePayment {
                payment_type: "card".to_string(),
                amount_cents: 500,
                sub_department_id: None,
                business_date: date(2024, 3, 15),
            },
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let scheduler = JobScheduler::new(pool.clone());
    let config = SchedulerConfig::default();

    let first = scheduler.run_retention_cleanup(&config).await.unwrap();
    assert_eq!(first, JobRun::Ran(1));
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM idempotency_keys").await, 0);

    let second = scheduler.run_retention_cleanup(&config).await.unwrap();
    assert_eq!(second, JobRun::NotDue);
}

#[tokio::test]
async fn test_temp_database_is_removed_on_drop() {
    let db = file_pool(2).await;
    let dir = db.dir().to_path_buf();
    assert!(dir.join("ledgerbox.db").exists());

    db.pool.close().await;
    drop(db);
    assert!(!dir.exists());
}
