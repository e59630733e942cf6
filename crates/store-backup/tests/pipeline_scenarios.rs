//! End-to-end backup and restore runs against in-memory accounts.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use bytes::Bytes;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use store_backup::codec::encode_record;
use store_backup::core::{ListOptions, ObjectStore, PropertyValue, Record, RecordStore};
use store_backup::filter::{Selection, TABLE_BACKUP_CONTAINER};
use store_backup::ledger::{Direction, ItemStatus, OperationLedger, RunMode};
use store_backup::pipeline::{
    BackupPipeline, PipelineSettings, RestorePipeline, RestoreRequest, SnapshotWindow,
};
use store_backup::retry::RetryPolicy;
use store_backup::store::{FaultPoint, MemoryStore, StorageAccount};
use store_backup::BackupError;

struct Accounts {
    prod: Arc<MemoryStore>,
    bak: Arc<MemoryStore>,
    ledger: OperationLedger,
}

async fn accounts() -> Accounts {
    let prod = Arc::new(MemoryStore::new("prod"));
    let bak = Arc::new(MemoryStore::new("bak"));
    let ledger = OperationLedger::new(bak.clone());
    ledger.init().await.unwrap();
    Accounts { prod, bak, ledger }
}

fn settings() -> PipelineSettings {
    PipelineSettings {
        discovery_workers: 4,
        copy_workers: 8,
        batch_size: 100,
        retry: RetryPolicy::new(StdDuration::from_millis(1), 3),
    }
}

fn backup(a: &Accounts) -> BackupPipeline {
    BackupPipeline::new(
        StorageAccount::from_store(a.prod.clone()),
        StorageAccount::from_store(a.bak.clone()),
        a.ledger.clone(),
        settings(),
    )
}

fn restore_into(a: &Accounts, target: Arc<MemoryStore>) -> RestorePipeline {
    RestorePipeline::new(
        StorageAccount::from_store(a.bak.clone()),
        StorageAccount::from_store(target),
        a.ledger.clone(),
        settings(),
    )
}

fn jan(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
}

fn archive(rows: &[Record]) -> Bytes {
    let mut body = String::new();
    for row in rows {
        body.push_str(&encode_record(row).unwrap());
        body.push('\n');
    }
    Bytes::from(body)
}

#[tokio::test]
async fn test_excluded_container_never_reaches_copy_stage() {
    let a = accounts().await;
    let at = Utc::now() - Duration::days(1);
    for container in ["images", "docs", "wad-diagnostics"] {
        for item in ["one.bin", "two.bin"] {
            a.prod
                .put_object_at(container, item, Bytes::from_static(b"payload"), at);
        }
    }

    let out = backup(&a).run(CancellationToken::new()).await.unwrap();

    let mut containers = out.containers.clone();
    containers.sort();
    assert_eq!(containers, vec!["docs", "images"]);
    assert_eq!(out.outcomes.len(), 4);
    assert!(out.outcomes.iter().all(|o| !o.source.starts_with("wad-")));
    assert_eq!(out.summary.copied, 4);
    assert!(a
        .bak
        .list_objects("wad-diagnostics", ListOptions::current())
        .await
        .is_err());
}

#[tokio::test]
async fn test_restore_window_selects_only_snapshots_inside() {
    let a = accounts().await;
    let order = |n: i32| Record::new("eu", format!("order-{}", n)).with("Total", n * 10);

    a.bak.put_snapshot(
        TABLE_BACKUP_CONTAINER,
        "orders",
        Utc.with_ymd_and_hms(2023, 12, 31, 23, 0, 0).unwrap(),
        archive(&[order(0)]),
    );
    a.bak
        .put_snapshot(TABLE_BACKUP_CONTAINER, "orders", jan(1, 5), archive(&[order(1)]));
    a.bak
        .put_snapshot(TABLE_BACKUP_CONTAINER, "orders", jan(1, 12), archive(&[order(2)]));
    a.bak.put_snapshot(
        TABLE_BACKUP_CONTAINER,
        "customers",
        jan(1, 6),
        archive(&[Record::new("eu", "c1")]),
    );

    let request = RestoreRequest {
        tables: Selection::parse("orders"),
        window: Some(SnapshotWindow::parse("2024-01-01T00:00:00", "2024-01-02T00:00:00").unwrap()),
    };
    let out = restore_into(&a, a.prod.clone())
        .run(&request, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(out.outcomes.len(), 2);
    assert_eq!(out.summary.copied, 2);
    assert_eq!(out.tables, vec!["orders"]);
    assert_eq!(a.prod.row_count("orders"), 2);
    assert!(a
        .prod
        .get_row("orders", "eu", "order-0")
        .await
        .unwrap()
        .is_none());
    assert_eq!(a.prod.row_count("customers"), 0);
}

#[tokio::test]
async fn test_one_faulted_copy_does_not_stop_the_run() {
    let a = accounts().await;
    let at = Utc::now() - Duration::days(1);
    for i in 1..=10 {
        a.prod.put_object_at(
            "docs",
            &format!("item-{:02}", i),
            Bytes::from(format!("body {}", i)),
            at,
        );
    }
    a.prod
        .inject_fault(FaultPoint::CopyObject("docs/item-05".into()), false, None);

    let out = backup(&a).run(CancellationToken::new()).await.unwrap();

    assert_eq!(out.summary.copied, 9);
    assert_eq!(out.summary.faulted, 1);
    let faulted: Vec<_> = out
        .outcomes
        .iter()
        .filter(|o| o.status.is_faulted())
        .collect();
    assert_eq!(faulted.len(), 1);
    assert_eq!(faulted[0].source, "docs/item-05");
    assert!(out.finished);

    let runs = a
        .ledger
        .run_history(Direction::Backup, "prod", "bak")
        .await
        .unwrap();
    assert_eq!(runs[0].summary.faulted, 1);
    assert_eq!(runs[0].summary.copied, 9);
}

#[tokio::test]
async fn test_restore_flushes_at_every_key_change() {
    let a = accounts().await;
    // Keys alternate every three rows: a a a b b b a a a b b b
    let rows: Vec<Record> = (0..12)
        .map(|i| {
            let pk = if (i / 3) % 2 == 0 { "a" } else { "b" };
            Record::new(pk, format!("r{:02}", i))
        })
        .collect();
    a.bak
        .put_snapshot(TABLE_BACKUP_CONTAINER, "orders", jan(1, 5), archive(&rows));

    let request = RestoreRequest {
        tables: Selection::All,
        window: Some(SnapshotWindow::new(jan(1, 0), jan(2, 0)).unwrap()),
    };
    let prod = a.prod.clone();
    restore_into(&a, prod)
        .run(&request, CancellationToken::new())
        .await
        .unwrap();

    let batches: Vec<(String, usize)> = a
        .prod
        .batch_history()
        .into_iter()
        .filter(|b| b.table == "orders")
        .map(|b| (b.partition_key, b.rows))
        .collect();
    assert_eq!(
        batches,
        vec![
            ("a".to_string(), 3),
            ("b".to_string(), 3),
            ("a".to_string(), 3),
            ("b".to_string(), 3),
        ]
    );
    assert_eq!(a.prod.row_count("orders"), 12);
}

#[tokio::test]
async fn test_second_backup_is_incremental() {
    let a = accounts().await;
    let old = Utc::now() - Duration::days(1);
    a.prod.put_object_at("docs", "old-1", Bytes::from_static(b"1"), old);
    a.prod.put_object_at("docs", "old-2", Bytes::from_static(b"2"), old);

    let first = backup(&a).run(CancellationToken::new()).await.unwrap();
    assert_eq!(first.handle.mode, RunMode::Full);
    assert_eq!(first.summary.copied, 2);

    a.prod.put_object_at(
        "docs",
        "new-1",
        Bytes::from_static(b"3"),
        Utc::now() + Duration::minutes(1),
    );

    let second = backup(&a).run(CancellationToken::new()).await.unwrap();
    assert_eq!(second.handle.mode, RunMode::Incremental);
    assert!(second.handle.previous_run.is_some());
    assert_eq!(second.summary.copied, 1);
    assert_eq!(second.summary.skipped, 2);

    let history = a
        .ledger
        .run_history(Direction::Backup, "prod", "bak")
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].run_id, second.handle.run_id);
    assert!(history.iter().all(|r| r.is_finished()));
}

#[tokio::test]
async fn test_listing_failure_leaves_run_started() {
    let a = accounts().await;
    a.prod
        .put_object_at("docs", "a", Bytes::from_static(b"a"), Utc::now());
    a.prod
        .inject_fault(FaultPoint::ListObjects("docs".into()), false, None);

    let err = backup(&a).run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, BackupError::Enumeration { .. }));

    let history = a
        .ledger
        .run_history(Direction::Backup, "prod", "bak")
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert!(!history[0].is_finished());
}

#[tokio::test]
async fn test_backup_then_restore_roundtrip() {
    let a = accounts().await;
    let stamp = Utc::now() - Duration::days(2);
    a.prod.seed_rows(
        "customers",
        (0..30i32).map(|i| {
            Record::new(format!("region{}", i % 3), format!("c{:02}", i))
                .with("Name", format!("Customer {}", i))
                .with("Balance", f64::from(i) * 1.5)
                .with("Vip", i % 7 == 0)
                .with_timestamp(stamp)
        }),
    );
    a.prod
        .put_object_at("docs", "readme.md", Bytes::from_static(b"# hi"), stamp);

    let out = backup(&a).run(CancellationToken::new()).await.unwrap();
    assert_eq!(out.summary.copied, 2);
    assert_eq!(a.bak.row_count("customers"), 30);

    let fresh = Arc::new(MemoryStore::new("fresh"));
    let request = RestoreRequest {
        tables: Selection::parse("customers"),
        window: Some(
            SnapshotWindow::new(Utc::now() - Duration::hours(1), Utc::now() + Duration::hours(1))
                .unwrap(),
        ),
    };
    let restored = restore_into(&a, fresh.clone())
        .run(&request, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(restored.summary.copied, 1);
    assert!(matches!(restored.outcomes[0].status, ItemStatus::Completed));
    assert_eq!(restored.outcomes[0].destination.as_deref(), Some("customers"));
    assert_eq!(fresh.row_count("customers"), 30);

    let row = fresh
        .get_row("customers", "region1", "c07")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        row.get("Name"),
        Some(&PropertyValue::String("Customer 7".into()))
    );
    assert_eq!(row.get("Balance"), Some(&PropertyValue::Double(10.5)));
    assert_eq!(row.get("Vip"), Some(&PropertyValue::Boolean(true)));
}
