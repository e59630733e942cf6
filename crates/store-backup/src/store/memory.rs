//! In-process store implementing both store traits.
//!
//! Used by tests and by `UseMemoryStorage=true` connection strings. Besides
//! the plain store behavior it supports fault injection and keeps a history
//! of committed batches so tests can assert on batch boundaries.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Duration, DurationRound, Utc};
use futures::stream::{self, BoxStream, StreamExt};

use crate::core::{
    validate_batch, ListOptions, ObjectReader, ObjectRef, ObjectStore, Record, RecordStore,
};
use crate::error::{BackupError, Result};

/// Store call a fault can be attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultPoint {
    ListContainers,
    ListTables,
    /// Listing objects of the named container.
    ListObjects(String),
    /// Reading the object with this identifier (see [`ObjectRef::identifier`]).
    ReadObject(String),
    /// Copying the object with this identifier.
    CopyObject(String),
    /// Committing a batch into the named table.
    CommitBatch(String),
    /// Listing all rows of the named table.
    ListRows(String),
}

#[derive(Debug)]
struct Fault {
    point: FaultPoint,
    transient: bool,
    remaining: Option<u32>,
}

/// One successful batch commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub table: String,
    pub partition_key: String,
    pub rows: usize,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
    /// Oldest first.
    snapshots: Vec<(DateTime<Utc>, Bytes)>,
}

#[derive(Debug, Default)]
struct State {
    containers: BTreeMap<String, BTreeMap<String, StoredObject>>,
    tables: BTreeMap<String, BTreeMap<(String, String), Record>>,
    faults: Vec<Fault>,
    history: Vec<BatchEntry>,
    rows_read: u64,
}

/// In-memory object and record store.
#[derive(Debug)]
pub struct MemoryStore {
    name: String,
    state: Mutex<State>,
}

fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    now.duration_trunc(Duration::microseconds(1)).unwrap_or(now)
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::default()),
        }
    }

    pub fn account_name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make calls at `point` fail. `times: None` fails forever.
    pub fn inject_fault(&self, point: FaultPoint, transient: bool, times: Option<u32>) {
        self.state().faults.push(Fault {
            point,
            transient,
            remaining: times,
        });
    }

    pub fn clear_faults(&self) {
        self.state().faults.clear();
    }

    fn check_fault(&self, point: &FaultPoint) -> Result<()> {
        let mut state = self.state();
        let hit = state
            .faults
            .iter_mut()
            .find(|f| &f.point == point && f.remaining != Some(0));

        match hit {
            Some(fault) => {
                if let Some(n) = fault.remaining.as_mut() {
                    *n -= 1;
                }
                let operation = format!("{:?}", point);
                Err(if fault.transient {
                    BackupError::transient(operation, "injected transient fault")
                } else {
                    BackupError::store(operation, "injected fault")
                })
            }
            None => Ok(()),
        }
    }

    /// Successful batch commits so far, in commit order.
    pub fn batch_history(&self) -> Vec<BatchEntry> {
        self.state().history.clone()
    }

    /// Write an object with an explicit last-modified time, creating the
    /// container if needed.
    pub fn put_object_at(&self, container: &str, name: &str, data: Bytes, at: DateTime<Utc>) {
        let mut state = self.state();
        let objects = state.containers.entry(container.to_string()).or_default();
        match objects.get_mut(name) {
            Some(existing) => {
                existing.data = data;
                existing.last_modified = at;
            }
            None => {
                objects.insert(
                    name.to_string(),
                    StoredObject {
                        data,
                        last_modified: at,
                        snapshots: Vec::new(),
                    },
                );
            }
        }
    }

    /// Add a snapshot captured at `at` with the given content.
    pub fn put_snapshot(&self, container: &str, name: &str, at: DateTime<Utc>, data: Bytes) {
        let mut state = self.state();
        let object = state
            .containers
            .entry(container.to_string())
            .or_default()
            .entry(name.to_string())
            .or_insert_with(|| StoredObject {
                data: data.clone(),
                last_modified: at,
                snapshots: Vec::new(),
            });
        object.snapshots.push((at, data));
        object.snapshots.sort_by_key(|(t, _)| *t);
    }

    /// Insert rows as given, keeping their timestamps. Creates the table.
    pub fn seed_rows(&self, table: &str, rows: impl IntoIterator<Item = Record>) {
        let mut state = self.state();
        let target = state.tables.entry(table.to_string()).or_default();
        for row in rows {
            target.insert((row.partition_key.clone(), row.row_key.clone()), row);
        }
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.state().tables.get(table).map_or(0, BTreeMap::len)
    }

    /// Rows handed out by record reads so far.
    pub fn rows_read(&self) -> u64 {
        self.state().rows_read
    }

    /// First row of a partition whose row key sorts after `after`.
    fn next_in_partition(
        &self,
        table: &str,
        partition_key: &str,
        after: Option<&str>,
    ) -> Result<Option<Record>> {
        let mut state = self.state();
        let rows = state
            .tables
            .get(table)
            .ok_or_else(|| Self::not_found("table", table))?;

        let lower = match after {
            Some(row_key) => Bound::Excluded((partition_key.to_string(), row_key.to_string())),
            None => Bound::Included((partition_key.to_string(), String::new())),
        };
        let next = rows
            .range((lower, Bound::Unbounded))
            .next()
            .filter(|((pk, _), _)| pk == partition_key)
            .map(|(_, row)| row.clone());

        if next.is_some() {
            state.rows_read += 1;
        }
        Ok(next)
    }

    fn not_found(what: &str, name: &str) -> BackupError {
        BackupError::NotFound(format!("{} '{}'", what, name))
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn account_name(&self) -> &str {
        &self.name
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        self.check_fault(&FaultPoint::ListContainers)?;
        Ok(self.state().containers.keys().cloned().collect())
    }

    async fn create_container_if_absent(&self, container: &str) -> Result<()> {
        self.state()
            .containers
            .entry(container.to_string())
            .or_default();
        Ok(())
    }

    async fn list_objects(&self, container: &str, options: ListOptions) -> Result<Vec<ObjectRef>> {
        self.check_fault(&FaultPoint::ListObjects(container.to_string()))?;
        let state = self.state();
        let objects = state
            .containers
            .get(container)
            .ok_or_else(|| Self::not_found("container", container))?;

        let mut listed = Vec::new();
        for (name, object) in objects {
            // Hierarchical listings only show top-level names.
            if !options.flat && name.contains('/') {
                continue;
            }
            if options.include_snapshots {
                for (at, data) in &object.snapshots {
                    listed.push(ObjectRef {
                        container: container.to_string(),
                        name: name.clone(),
                        snapshot: Some(*at),
                        last_modified: *at,
                        size: data.len() as u64,
                    });
                }
            }
            listed.push(ObjectRef {
                container: container.to_string(),
                name: name.clone(),
                snapshot: None,
                last_modified: object.last_modified,
                size: object.data.len() as u64,
            });
        }
        Ok(listed)
    }

    async fn put_object(&self, container: &str, name: &str, data: Bytes) -> Result<()> {
        if !self.state().containers.contains_key(container) {
            return Err(Self::not_found("container", container));
        }
        self.put_object_at(container, name, data, now_micros());
        Ok(())
    }

    async fn open_read(&self, object: &ObjectRef) -> Result<ObjectReader> {
        self.check_fault(&FaultPoint::ReadObject(object.identifier()))?;
        let state = self.state();
        let stored = state
            .containers
            .get(&object.container)
            .and_then(|c| c.get(&object.name))
            .ok_or_else(|| Self::not_found("object", &object.identifier()))?;

        let data = match object.snapshot {
            None => stored.data.clone(),
            Some(at) => stored
                .snapshots
                .iter()
                .find(|(t, _)| *t == at)
                .map(|(_, d)| d.clone())
                .ok_or_else(|| Self::not_found("snapshot", &object.identifier()))?,
        };
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn copy_object(&self, object: &ObjectRef, destination: &dyn ObjectStore) -> Result<()> {
        self.check_fault(&FaultPoint::CopyObject(object.identifier()))?;
        let data = self.read_object(object).await?;
        destination
            .put_object(&object.container, &object.name, data)
            .await
    }

    async fn create_append_object(&self, container: &str, name: &str) -> Result<()> {
        self.put_object(container, name, Bytes::new()).await
    }

    async fn append_bytes(&self, container: &str, name: &str, data: Bytes) -> Result<()> {
        let mut state = self.state();
        let object = state
            .containers
            .get_mut(container)
            .and_then(|c| c.get_mut(name))
            .ok_or_else(|| Self::not_found("append object", &format!("{}/{}", container, name)))?;

        let mut buf = BytesMut::with_capacity(object.data.len() + data.len());
        buf.extend_from_slice(&object.data);
        buf.extend_from_slice(&data);
        object.data = buf.freeze();
        object.last_modified = now_micros();
        Ok(())
    }

    async fn snapshot_object(&self, container: &str, name: &str) -> Result<DateTime<Utc>> {
        let mut state = self.state();
        let object = state
            .containers
            .get_mut(container)
            .and_then(|c| c.get_mut(name))
            .ok_or_else(|| Self::not_found("object", &format!("{}/{}", container, name)))?;

        // Snapshot times are unique per object.
        let mut at = now_micros();
        if let Some((last, _)) = object.snapshots.last() {
            if at <= *last {
                at = *last + Duration::microseconds(1);
            }
        }
        object.snapshots.push((at, object.data.clone()));
        Ok(at)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    fn account_name(&self) -> &str {
        &self.name
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.check_fault(&FaultPoint::ListTables)?;
        Ok(self.state().tables.keys().cloned().collect())
    }

    async fn create_table_if_absent(&self, table: &str) -> Result<()> {
        self.state().tables.entry(table.to_string()).or_default();
        Ok(())
    }

    async fn list_all_rows(&self, table: &str) -> Result<Vec<Record>> {
        self.check_fault(&FaultPoint::ListRows(table.to_string()))?;
        let mut state = self.state();
        let rows: Vec<Record> = state
            .tables
            .get(table)
            .ok_or_else(|| Self::not_found("table", table))?
            .values()
            .cloned()
            .collect();
        state.rows_read += rows.len() as u64;
        Ok(rows)
    }

    async fn query_partition(&self, table: &str, partition_key: &str) -> Result<Vec<Record>> {
        let mut state = self.state();
        let rows: Vec<Record> = state
            .tables
            .get(table)
            .ok_or_else(|| Self::not_found("table", table))?
            .values()
            .filter(|r| r.partition_key == partition_key)
            .cloned()
            .collect();
        state.rows_read += rows.len() as u64;
        Ok(rows)
    }

    /// Pulls one row per poll, so dropping the stream stops the read.
    fn stream_partition<'a>(
        &'a self,
        table: &'a str,
        partition_key: &'a str,
    ) -> BoxStream<'a, Result<Record>> {
        stream::try_unfold(None::<String>, move |after| async move {
            let next = self.next_in_partition(table, partition_key, after.as_deref())?;
            Ok::<_, BackupError>(next.map(|row| {
                let row_key = row.row_key.clone();
                (row, Some(row_key))
            }))
        })
        .boxed()
    }

    async fn get_row(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<Record>> {
        let state = self.state();
        let rows = state
            .tables
            .get(table)
            .ok_or_else(|| Self::not_found("table", table))?;
        Ok(rows
            .get(&(partition_key.to_string(), row_key.to_string()))
            .cloned())
    }

    async fn commit_batch(&self, table: &str, rows: Vec<Record>) -> Result<()> {
        validate_batch(table, &rows)?;
        self.check_fault(&FaultPoint::CommitBatch(table.to_string()))?;

        let mut state = self.state();
        let target = state
            .tables
            .get_mut(table)
            .ok_or_else(|| Self::not_found("table", table))?;

        let now = now_micros();
        let partition_key = rows[0].partition_key.clone();
        let count = rows.len();
        for mut row in rows {
            row.timestamp = Some(now);
            let key = (row.partition_key.clone(), row.row_key.clone());
            match target.get_mut(&key) {
                Some(existing) => existing.merge_from(row),
                None => {
                    target.insert(key, row);
                }
            }
        }

        state.history.push(BatchEntry {
            table: table.to_string(),
            partition_key,
            rows: count,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_objects_and_snapshots() {
        let store = MemoryStore::new("acct");
        store.create_container_if_absent("docs").await.unwrap();
        store
            .put_object("docs", "a.txt", Bytes::from_static(b"v1"))
            .await
            .unwrap();
        let first = store.snapshot_object("docs", "a.txt").await.unwrap();
        store
            .put_object("docs", "a.txt", Bytes::from_static(b"v2"))
            .await
            .unwrap();
        let second = store.snapshot_object("docs", "a.txt").await.unwrap();
        assert!(second > first);

        let current = store.list_objects("docs", ListOptions::current()).await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(store.read_object(&current[0]).await.unwrap(), Bytes::from_static(b"v2"));

        let all = store
            .list_objects("docs", ListOptions::all_versions())
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].snapshot, Some(first));
        assert_eq!(store.read_object(&all[0]).await.unwrap(), Bytes::from_static(b"v1"));
    }

    #[tokio::test]
    async fn test_put_requires_container() {
        let store = MemoryStore::new("acct");
        let err = store
            .put_object("missing", "x", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_append_then_snapshot() {
        let store = MemoryStore::new("acct");
        store.create_container_if_absent("tablebackup").await.unwrap();
        store.create_append_object("tablebackup", "orders").await.unwrap();
        store
            .append_bytes("tablebackup", "orders", Bytes::from_static(b"line1\n"))
            .await
            .unwrap();
        store
            .append_bytes("tablebackup", "orders", Bytes::from_static(b"line2\n"))
            .await
            .unwrap();
        let at = store.snapshot_object("tablebackup", "orders").await.unwrap();

        let mut snapshot = ObjectRef::new("tablebackup", "orders");
        snapshot.snapshot = Some(at);
        assert_eq!(
            store.read_object(&snapshot).await.unwrap(),
            Bytes::from_static(b"line1\nline2\n")
        );
    }

    #[tokio::test]
    async fn test_commit_merges_and_stamps() {
        let store = MemoryStore::new("acct");
        store.create_table_if_absent("t").await.unwrap();
        store
            .commit_batch("t", vec![Record::new("p", "r").with("a", 1i32)])
            .await
            .unwrap();
        store
            .commit_batch("t", vec![Record::new("p", "r").with("b", 2i32)])
            .await
            .unwrap();

        let row = store.get_row("t", "p", "r").await.unwrap().unwrap();
        assert!(row.get("a").is_some());
        assert!(row.get("b").is_some());
        assert!(row.timestamp.is_some());
        assert_eq!(store.batch_history().len(), 2);
    }

    #[tokio::test]
    async fn test_commit_rejects_colliding_property_names() {
        let store = MemoryStore::new("acct");
        store.create_table_if_absent("t").await.unwrap();
        for name in ["RowKey", "Note@type"] {
            let err = store
                .commit_batch("t", vec![Record::new("p", "r").with(name, "x")])
                .await
                .unwrap_err();
            assert!(matches!(err, BackupError::BatchRejected { .. }));
        }
        assert_eq!(store.row_count("t"), 0);
    }

    #[tokio::test]
    async fn test_stream_partition_reads_lazily() {
        use futures::TryStreamExt;

        let store = MemoryStore::new("acct");
        store.seed_rows(
            "t",
            (0..5)
                .map(|i| Record::new("b", format!("r{}", i)))
                .chain([Record::new("a", "r9"), Record::new("c", "r0")]),
        );

        let mut rows = store.stream_partition("t", "b");
        let first = rows.try_next().await.unwrap().unwrap();
        assert_eq!(first.row_key, "r0");
        drop(rows);
        assert_eq!(store.rows_read(), 1);

        let all: Vec<Record> = store.stream_partition("t", "b").try_collect().await.unwrap();
        let keys: Vec<_> = all.iter().map(|r| r.row_key.as_str()).collect();
        assert_eq!(keys, vec!["r0", "r1", "r2", "r3", "r4"]);

        assert!(store.stream_partition("missing", "b").try_next().await.is_err());
    }

    #[tokio::test]
    async fn test_commit_rejects_mixed_keys() {
        let store = MemoryStore::new("acct");
        store.create_table_if_absent("t").await.unwrap();
        let err = store
            .commit_batch("t", vec![Record::new("a", "1"), Record::new("b", "1")])
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::BatchRejected { .. }));
        assert_eq!(store.row_count("t"), 0);
    }

    #[tokio::test]
    async fn test_faults_expire() {
        let store = MemoryStore::new("acct");
        store.inject_fault(FaultPoint::ListTables, true, Some(2));
        assert!(store.list_tables().await.unwrap_err().is_transient());
        assert!(store.list_tables().await.is_err());
        assert!(store.list_tables().await.is_ok());
    }

    #[tokio::test]
    async fn test_seeded_rows_keep_timestamps() {
        let store = MemoryStore::new("acct");
        let at = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        store.seed_rows("t", [Record::new("p", "r").with_timestamp(at)]);
        let rows = store.list_all_rows("t").await.unwrap();
        assert_eq!(rows[0].timestamp, Some(at));
    }
}
