//! Migrations apply cleanly and are idempotent.

use hostwatch_db::pool;
use hostwatch_test_utils::TestDb;

#[tokio::test]
async fn migrations_create_registry_table() {
    let db = TestDb::create().await;

    let summary = pool::registry_summary(&db.pool).await.unwrap();
    assert_eq!(summary.entries, 0);
    assert!(summary.workers.is_empty());
    assert_eq!(summary.schema_version, Some(1));

    db.drop().await;
}

#[tokio::test]
async fn summary_counts_running_rows_per_worker() {
    let db = TestDb::create().await;

    sqlx::query(
        "INSERT INTO registry_entries (name, worker, status) VALUES \
         ('a', 'host-1', 1), ('b', 'host-1', 0), ('c', 'host-2', 1)",
    )
    .execute(&db.pool)
    .await
    .unwrap();

    let summary = pool::registry_summary(&db.pool).await.unwrap();
    assert_eq!(summary.entries, 3);
    assert_eq!(
        summary.workers,
        vec![
            pool::WorkerCount { worker: "host-1".into(), running: 1, total: 2 },
            pool::WorkerCount { worker: "host-2".into(), running: 1, total: 1 },
        ]
    );

    db.drop().await;
}

#[tokio::test]
async fn summary_requires_the_schema() {
    let db = TestDb::create().await;
    sqlx::query("DROP TABLE registry_entries").execute(&db.pool).await.unwrap();

    let err = pool::registry_summary(&db.pool).await.unwrap_err();
    assert!(err.to_string().contains("db-init"), "{err:#}");

    db.drop().await;
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let db = TestDb::create().await;

    pool::run_migrations(&db.pool)
        .await
        .expect("second run should be a no-op");

    db.drop().await;
}

#[tokio::test]
async fn status_and_way_checks_reject_unknown_codes() {
    let db = TestDb::create().await;

    let bad_status = sqlx::query(
        "INSERT INTO registry_entries (name, worker, status) VALUES ('x', 'w', 7)",
    )
    .execute(&db.pool)
    .await;
    assert!(bad_status.is_err());

    let bad_way =
        sqlx::query("INSERT INTO registry_entries (name, worker, way) VALUES ('x', 'w', 3)")
            .execute(&db.pool)
            .await;
    assert!(bad_way.is_err());

    db.drop().await;
}
