//! Store traits consumed by the backup and restore pipelines.
//!
//! This module defines the two collaborator seams of the engine:
//!
//! - [`ObjectStore`]: containers of blob-like objects with snapshots
//! - [`RecordStore`]: tables of schema-less records with batch commits
//!
//! Concrete clients live in [`crate::store`]. The pipelines only ever see
//! `Arc<dyn ObjectStore>` / `Arc<dyn RecordStore>`, so every implementation
//! must be safe for concurrent use by all workers of a run.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tokio::io::{AsyncBufRead, AsyncReadExt};

use crate::error::{BackupError, Result};

use super::object::{ListOptions, ObjectRef};
use super::record::Record;

/// Maximum rows a record store accepts in one batch commit.
pub const MAX_BATCH_SIZE: usize = 100;

/// Buffered byte stream returned by [`ObjectStore::open_read`].
pub type ObjectReader = Pin<Box<dyn AsyncBufRead + Send>>;

/// Blob-style storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Account this store belongs to.
    fn account_name(&self) -> &str;

    /// List container names.
    async fn list_containers(&self) -> Result<Vec<String>>;

    /// Create a container if it does not exist yet.
    async fn create_container_if_absent(&self, container: &str) -> Result<()>;

    /// List objects in a container, ordered by name (snapshots before the
    /// current version of the same name, oldest first).
    async fn list_objects(&self, container: &str, options: ListOptions) -> Result<Vec<ObjectRef>>;

    /// Write (or overwrite) an object.
    async fn put_object(&self, container: &str, name: &str, data: Bytes) -> Result<()>;

    /// Open an object (or snapshot) for buffered reading.
    async fn open_read(&self, object: &ObjectRef) -> Result<ObjectReader>;

    /// Read an object fully into memory.
    async fn read_object(&self, object: &ObjectRef) -> Result<Bytes> {
        let mut reader = self.open_read(object).await?;
        let mut buf = Vec::with_capacity(object.size as usize);
        reader.read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Copy an object from this store into `destination` under the same
    /// container and name.
    ///
    /// Treated as atomic by the pipeline. Stores with a native server-side
    /// copy should override this.
    async fn copy_object(&self, object: &ObjectRef, destination: &dyn ObjectStore) -> Result<()> {
        let data = self.read_object(object).await?;
        destination
            .put_object(&object.container, &object.name, data)
            .await
    }

    /// Create an empty append object, replacing any existing one.
    async fn create_append_object(&self, container: &str, name: &str) -> Result<()>;

    /// Append bytes to an append object created with [`create_append_object`].
    ///
    /// [`create_append_object`]: ObjectStore::create_append_object
    async fn append_bytes(&self, container: &str, name: &str, data: Bytes) -> Result<()>;

    /// Capture a read-only snapshot of the current object and return its time.
    async fn snapshot_object(&self, container: &str, name: &str) -> Result<DateTime<Utc>>;
}

/// Table-style storage of [`Record`]s.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Account this store belongs to.
    fn account_name(&self) -> &str;

    /// List table names.
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Create a table if it does not exist yet.
    async fn create_table_if_absent(&self, table: &str) -> Result<()>;

    /// Read every row of a table, ordered by (partition key, row key).
    async fn list_all_rows(&self, table: &str) -> Result<Vec<Record>>;

    /// Read one partition, ordered by row key ascending.
    async fn query_partition(&self, table: &str, partition_key: &str) -> Result<Vec<Record>>;

    /// Stream one partition, ordered by row key ascending.
    ///
    /// Stores that can page override this so a caller dropping the stream
    /// early never reads the rest of the partition. The default reads the
    /// whole partition up front.
    fn stream_partition<'a>(
        &'a self,
        table: &'a str,
        partition_key: &'a str,
    ) -> BoxStream<'a, Result<Record>> {
        stream::once(self.query_partition(table, partition_key))
            .map_ok(|rows| stream::iter(rows.into_iter().map(Ok::<Record, BackupError>)))
            .try_flatten()
            .boxed()
    }

    /// Point lookup.
    async fn get_row(&self, table: &str, partition_key: &str, row_key: &str)
        -> Result<Option<Record>>;

    /// Atomically insert-or-merge a batch of rows.
    ///
    /// Fails without writing anything when the batch is empty, holds more
    /// than [`MAX_BATCH_SIZE`] rows, mixes partition keys, or carries a
    /// property name rejected by [`check_property_name`].
    ///
    /// [`check_property_name`]: super::record::check_property_name
    async fn commit_batch(&self, table: &str, rows: Vec<Record>) -> Result<()>;
}

/// Check the batch constraints shared by every record store.
pub fn validate_batch(table: &str, rows: &[Record]) -> Result<()> {
    let first = rows
        .first()
        .ok_or_else(|| BackupError::batch_rejected(table, "batch is empty"))?;

    if rows.len() > MAX_BATCH_SIZE {
        return Err(BackupError::batch_rejected(
            table,
            format!(
                "batch holds {} rows, limit is {}",
                rows.len(),
                MAX_BATCH_SIZE
            ),
        ));
    }

    if let Some(other) = rows.iter().find(|r| r.partition_key != first.partition_key) {
        return Err(BackupError::batch_rejected(
            table,
            format!(
                "batch mixes partition keys '{}' and '{}'",
                first.partition_key, other.partition_key
            ),
        ));
    }

    for row in rows {
        row.check_property_names().map_err(|e| {
            BackupError::batch_rejected(table, format!("row '{}': {}", row.row_key, e))
        })?;
    }

    Ok(())
}
