//! PostgreSQL integration tests
//!
//! These tests share one PostgreSQL container and need Docker. Run with:
//!
//! ```bash
//! cargo test -p record-store --test postgres_integration -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use record::{DurableRecord, Payload, RecordFamily, RecordState, RetryPolicy, SagaRecord};
use record_store::{
    Cursor, LeaseLockStore, LeaseToken, PartitionManager, PostgresLeaseLock,
    PostgresPartitionManager, PostgresRecordRepository, PostgresSagaRepository, RecordQuery,
    RecordRepository, RecordRepositoryExt, SagaRepository, StoreError,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_reliability_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// A fresh pool with every table cleared.
async fn get_test_pool() -> PgPool {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query(
        "TRUNCATE TABLE task_record, event_record, saga, saga_step, lease_lock, \
         archived_task_record, archived_event_record, archived_saga, archived_saga_step",
    )
    .execute(&pool)
    .await
    .unwrap();

    pool
}

/// Whole-second instant; TIMESTAMPTZ keeps microseconds only.
fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_790_000_000 + secs, 0).unwrap()
}

fn task(uuid: Option<&str>, now: DateTime<Utc>) -> DurableRecord {
    DurableRecord::new(
        RecordFamily::Task,
        "send_invoice",
        "billing",
        Payload::raw("invoice", serde_json::json!({"invoice_id": 42})),
        now,
        &RetryPolicy::new(3, Duration::hours(1)),
    )
    .with_uuid(uuid)
}

// ============================================================================
// Records
// ============================================================================

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn test_insert_and_get_record() {
    let repo = PostgresRecordRepository::new(get_test_pool().await, RecordFamily::Task).unwrap();

    let stored = repo.insert(&task(Some("inv-1"), at(0))).await.unwrap();
    let loaded = repo.get(stored.id).await.unwrap().unwrap();

    assert_eq!(loaded, stored);
    assert_eq!(loaded.state(), RecordState::Init);
    assert!(repo.exists_by_uuid("billing", "inv-1").await.unwrap());
}

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn test_duplicate_uuid_is_rejected() {
    let repo = PostgresRecordRepository::new(get_test_pool().await, RecordFamily::Task).unwrap();

    repo.insert(&task(Some("inv-1"), at(0))).await.unwrap();
    let result = repo.insert(&task(Some("inv-1"), at(1))).await;

    assert!(matches!(result, Err(StoreError::DuplicateKey { .. })));
}

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn test_records_without_uuid_do_not_collide() {
    let repo = PostgresRecordRepository::new(get_test_pool().await, RecordFamily::Task).unwrap();

    repo.insert(&task(None, at(0))).await.unwrap();
    repo.insert(&task(None, at(1))).await.unwrap();

    let all = repo.query(&RecordQuery::new()).await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn test_stale_update_conflicts() {
    let repo = PostgresRecordRepository::new(get_test_pool().await, RecordFamily::Task).unwrap();

    let stored = repo.insert(&task(None, at(0))).await.unwrap();

    let mut first = stored.clone();
    first.begin_attempt(at(0), &Default::default()).unwrap();
    repo.update(&first).await.unwrap();

    let mut second = stored;
    second.cancel();
    let result = repo.update(&second).await;

    assert!(matches!(result, Err(StoreError::Conflict { .. })));
}

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn test_due_query_pages_with_cursor() {
    let repo = PostgresRecordRepository::new(get_test_pool().await, RecordFamily::Task).unwrap();
    for i in 0..5 {
        repo.insert(&task(None, at(i))).await.unwrap();
    }

    let base = RecordQuery::due("billing", RecordFamily::Task.retryable_states(), at(10)).limit(2);
    let page1 = repo.query(&base).await.unwrap();
    assert_eq!(page1.len(), 2);

    let page2 = repo
        .query(&base.clone().after(Cursor::after(&page1[1])))
        .await
        .unwrap();
    assert_eq!(page2.len(), 2);
    assert!(page2[0].lifecycle.created_at > page1[1].lifecycle.created_at);
}

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn test_archive_moves_record() {
    let repo = PostgresRecordRepository::new(get_test_pool().await, RecordFamily::Event).unwrap();

    let mut event = DurableRecord::new(
        RecordFamily::Event,
        "order_placed",
        "shop",
        Payload::unit(),
        at(0),
        &RetryPolicy::event_default(),
    );
    event.begin_attempt(at(0), &Default::default()).unwrap();
    event.complete(None);
    let stored = repo.insert(&event).await.unwrap();

    let moved = repo.archive(&[stored.id], at(100)).await.unwrap();

    assert_eq!(moved, 1);
    assert!(repo.get(stored.id).await.unwrap().is_none());
    let archived = repo.get_archived(stored.id).await.unwrap().unwrap();
    assert_eq!(archived.state(), RecordState::Delivered);
}

// ============================================================================
// Sagas
// ============================================================================

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn test_saga_round_trip_with_steps() {
    let repo = PostgresSagaRepository::new(get_test_pool().await);

    let mut saga = SagaRecord::new(
        "order_fulfillment",
        "shop",
        Payload::raw("order", serde_json::json!({"order_id": 7})),
        "order-7",
        at(0),
        &RetryPolicy::saga_default(),
    );
    saga.ensure_step(10, "reserve", at(0));
    saga.ensure_step(20, "charge", at(0));
    let stored = repo.insert(&saga).await.unwrap();

    let mut running = stored.clone();
    running.begin_attempt(at(1), &Default::default()).unwrap();
    running
        .step_mut(10)
        .unwrap()
        .begin_attempt(at(1), Payload::unit())
        .unwrap();
    let updated = repo.update(&running).await.unwrap();

    let loaded = repo
        .find_by_uuid("shop", "order_fulfillment", "order-7")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded, updated);
    assert_eq!(loaded.steps.len(), 2);
    assert_eq!(loaded.step(10).unwrap().state(), RecordState::Running);

    let stale = repo.update(&stored).await;
    assert!(matches!(stale, Err(StoreError::Conflict { .. })));
}

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn test_saga_archive_takes_steps() {
    let repo = PostgresSagaRepository::new(get_test_pool().await);

    let mut saga = SagaRecord::new(
        "order_fulfillment",
        "shop",
        Payload::unit(),
        "order-8",
        at(0),
        &RetryPolicy::saga_default(),
    );
    saga.ensure_step(10, "reserve", at(0));
    let stored = repo.insert(&saga).await.unwrap();

    // Archival is counted by the archive sweep, not by the store.
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    let guard = metrics::set_default_local_recorder(&recorder);
    assert_eq!(repo.archive(&[stored.id()], at(50)).await.unwrap(), 1);
    drop(guard);
    assert!(!handle.render().contains("archived_records_total"));
    assert!(repo.get(stored.id()).await.unwrap().is_none());

    let archived = repo.get_archived(stored.id()).await.unwrap().unwrap();
    assert_eq!(archived.steps.len(), 1);
}

// ============================================================================
// Lease lock
// ============================================================================

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn test_lease_lock_excludes_other_tokens_until_expiry() {
    let lock = PostgresLeaseLock::new(get_test_pool().await);
    let a = LeaseToken::generate();
    let b = LeaseToken::generate();
    let ttl = Duration::seconds(30);

    assert!(lock.try_acquire("sweep[svc]", a.as_str(), ttl, at(0)).await.unwrap());
    assert!(!lock.try_acquire("sweep[svc]", b.as_str(), ttl, at(10)).await.unwrap());
    assert!(lock.try_acquire("sweep[svc]", a.as_str(), ttl, at(10)).await.unwrap());
    assert!(lock.try_acquire("sweep[svc]", b.as_str(), ttl, at(41)).await.unwrap());

    assert!(!lock.release("sweep[svc]", a.as_str()).await.unwrap());
    assert!(lock.release("sweep[svc]", b.as_str()).await.unwrap());
}

// ============================================================================
// Partitions
// ============================================================================

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn test_rotate_partition_is_idempotent() {
    let partitions = PostgresPartitionManager::new(get_test_pool().await);
    let month = NaiveDate::from_ymd_opt(2031, 3, 1).unwrap();

    assert!(partitions
        .ensure_monthly_partition("archived_task_record", month)
        .await
        .unwrap());
    assert!(!partitions
        .ensure_monthly_partition("archived_task_record", month)
        .await
        .unwrap());
    assert!(partitions
        .ensure_monthly_partition("task_record", month)
        .await
        .is_err());
}
