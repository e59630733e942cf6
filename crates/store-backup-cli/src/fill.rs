//! Seeds an account with dummy tables and containers for trying out backups.

use bytes::Bytes;
use chrono::Utc;
use store_backup::{BatchWriter, Record, Result, StorageAccount};
use tracing::{info, warn};
use uuid::Uuid;

const TABLES: usize = 2;
const ROWS_PER_TABLE: usize = 250;
const PARTITIONS: usize = 5;
const CONTAINERS: usize = 2;
const OBJECTS_PER_CONTAINER: usize = 10;

/// What a fill created.
#[derive(Debug, Default)]
pub struct FillReport {
    pub tables: Vec<String>,
    pub containers: Vec<String>,
    pub rows: usize,
    pub objects: usize,
}

/// Create a few freshly named tables and containers in `account` and
/// populate them.
pub async fn fill_storage(account: &StorageAccount) -> Result<FillReport> {
    let mut report = FillReport::default();
    let writer = BatchWriter::default();

    info!("Creating and populating dummy tables in {}", account.name);
    for _ in 0..TABLES {
        let table = format!("dummy{}", short_id());
        account.records.create_table_if_absent(&table).await?;

        let rows = (0..ROWS_PER_TABLE).map(dummy_row).collect();
        let written = writer.commit_all(account.records.as_ref(), &table, rows).await;
        if !written.is_clean() {
            warn!("{}: {} batches failed", table, written.failures.len());
        }
        report.rows += written.committed;
        report.tables.push(table);
    }

    info!("Creating and populating dummy containers in {}", account.name);
    for _ in 0..CONTAINERS {
        let container = format!("dummy-{}", short_id());
        account.objects.create_container_if_absent(&container).await?;

        for i in 0..OBJECTS_PER_CONTAINER {
            let name = format!("item-{:03}.txt", i);
            let body = format!("dummy object {} of {}\n", i, container);
            account
                .objects
                .put_object(&container, &name, Bytes::from(body))
                .await?;
            report.objects += 1;
        }
        report.containers.push(container);
    }

    info!(
        "Filled {}: {} tables ({} rows), {} containers ({} objects)",
        account.name,
        report.tables.len(),
        report.rows,
        report.containers.len(),
        report.objects
    );
    Ok(report)
}

fn dummy_row(index: usize) -> Record {
    Record::new(format!("partition{}", index % PARTITIONS), Uuid::new_v4().to_string())
        .with("Name", format!("Dummy entry {}", index))
        .with("Index", index as i64)
        .with("Enabled", index % 2 == 0)
        .with("CreatedAt", Utc::now())
        .with("ExternalId", Uuid::new_v4())
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}
