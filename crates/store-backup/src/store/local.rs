//! Directory-backed store for local runs.
//!
//! Layout under the root directory:
//!
//! ```text
//! objects/<container>/<name>              current object content
//! snapshots/<container>/<name>/@<micros>  snapshot captured at <micros> since the UNIX epoch
//! tables/<table>.jsonl                    one serialized record per line
//! ```
//!
//! A table file is a log: each committed batch is appended as lines, and a
//! later line for the same row merges into the earlier ones on read. The file
//! is compacted to one line per row, through a temporary file and a rename,
//! on the first commit to the table after opening and again whenever
//! [`DEFAULT_COMPACT_AFTER`] lines have been appended since, so a restore
//! costs linear rather than quadratic IO in the table size. A crash during an
//! append can leave a torn last line; it is dropped on read and by the next
//! compaction.
//!
//! Object writes go through one async mutex and table writes through another.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, DurationRound, Utc};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::codec::{decode_line, encode_record};
use crate::core::{
    validate_batch, ListOptions, ObjectReader, ObjectRef, ObjectStore, Record, RecordStore,
};
use crate::error::{BackupError, Result};

const OBJECTS_DIR: &str = "objects";
const SNAPSHOTS_DIR: &str = "snapshots";
const TABLES_DIR: &str = "tables";
const TABLE_EXT: &str = "jsonl";

/// Appended lines after which a table file is compacted.
pub const DEFAULT_COMPACT_AFTER: usize = 10_000;

/// Object and record store rooted at a local directory.
#[derive(Debug)]
pub struct LocalStore {
    name: String,
    root: PathBuf,
    write_lock: Mutex<()>,
    compact_after: usize,
    /// Lines appended to each table since its last compaction. A table
    /// without an entry has not been compacted by this instance yet.
    appended: Mutex<HashMap<String, usize>>,
}

fn truncate_micros(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(Duration::microseconds(1)).unwrap_or(at)
}

/// Reject names that would escape their directory.
fn check_name(kind: &str, name: &str) -> Result<()> {
    let escapes = Path::new(name)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if name.is_empty() || escapes {
        return Err(BackupError::store(
            format!("resolve {}", kind),
            format!("invalid {} name '{}'", kind, name),
        ));
    }
    Ok(())
}

fn not_found_or(e: std::io::Error, what: &str, name: &str) -> BackupError {
    if e.kind() == ErrorKind::NotFound {
        BackupError::NotFound(format!("{} '{}'", what, name))
    } else {
        BackupError::Io(e)
    }
}

impl LocalStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(name: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [OBJECTS_DIR, SNAPSHOTS_DIR, TABLES_DIR] {
            fs::create_dir_all(root.join(dir)).await?;
        }
        debug!("Local store opened at {}", root.display());
        Ok(Self {
            name: name.into(),
            root,
            write_lock: Mutex::new(()),
            compact_after: DEFAULT_COMPACT_AFTER,
            appended: Mutex::new(HashMap::new()),
        })
    }

    /// Compact a table file once this many lines were appended to it.
    pub fn with_compaction_threshold(mut self, lines: usize) -> Self {
        self.compact_after = lines.max(1);
        self
    }

    pub fn account_name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_dir(&self, container: &str) -> PathBuf {
        self.root.join(OBJECTS_DIR).join(container)
    }

    fn object_path(&self, container: &str, name: &str) -> PathBuf {
        self.container_dir(container).join(name)
    }

    fn snapshot_dir(&self, container: &str, name: &str) -> PathBuf {
        self.root.join(SNAPSHOTS_DIR).join(container).join(name)
    }

    fn snapshot_path(&self, container: &str, name: &str, at: DateTime<Utc>) -> PathBuf {
        self.snapshot_dir(container, name)
            .join(format!("@{}", at.timestamp_micros()))
    }

    fn table_path(&self, table: &str) -> PathBuf {
        self.root
            .join(TABLES_DIR)
            .join(format!("{}.{}", table, TABLE_EXT))
    }

    async fn modified(path: &Path) -> Result<DateTime<Utc>> {
        let modified = fs::metadata(path).await?.modified()?;
        Ok(truncate_micros(DateTime::<Utc>::from(modified)))
    }

    /// Object names under a container directory, relative and `/`-separated.
    async fn walk_names(dir: &Path, flat: bool) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut pending = vec![(dir.to_path_buf(), String::new())];

        while let Some((current, prefix)) = pending.pop() {
            let mut entries = fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_name = entry.file_name().to_string_lossy().into_owned();
                let relative = if prefix.is_empty() {
                    file_name
                } else {
                    format!("{}/{}", prefix, file_name)
                };
                if entry.file_type().await?.is_dir() {
                    if flat {
                        pending.push((entry.path(), relative));
                    }
                } else {
                    names.push(relative);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Snapshot times of one object, oldest first.
    async fn snapshot_times(&self, container: &str, name: &str) -> Result<Vec<DateTime<Utc>>> {
        let dir = self.snapshot_dir(container, name);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut times = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(micros) = file_name.strip_prefix('@').and_then(|m| m.parse::<i64>().ok()) else {
                continue;
            };
            if let Some(at) = DateTime::from_timestamp_micros(micros) {
                times.push(at);
            }
        }
        times.sort();
        Ok(times)
    }

    async fn read_table(&self, table: &str) -> Result<BTreeMap<(String, String), Record>> {
        let text = fs::read_to_string(self.table_path(table))
            .await
            .map_err(|e| not_found_or(e, "table", table))?;

        let torn_tail = !text.is_empty() && !text.ends_with('\n');
        let last = text.lines().count();

        let mut rows: BTreeMap<(String, String), Record> = BTreeMap::new();
        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record = match decode_line(line) {
                Ok(record) => record,
                Err(e) if torn_tail && index + 1 == last => {
                    warn!("{}: ignoring torn line {}: {}", table, index + 1, e);
                    continue;
                }
                Err(e) => {
                    return Err(BackupError::Serialization(format!(
                        "{} line {}: {}",
                        table,
                        index + 1,
                        e
                    )))
                }
            };
            match rows.entry((record.partition_key.clone(), record.row_key.clone())) {
                Entry::Occupied(mut current) => current.get_mut().merge_from(record),
                Entry::Vacant(slot) => {
                    slot.insert(record);
                }
            }
        }
        Ok(rows)
    }

    async fn write_table(&self, table: &str, rows: &BTreeMap<(String, String), Record>) -> Result<()> {
        let path = self.table_path(table);
        let tmp = path.with_extension(format!("{}.tmp", TABLE_EXT));

        let mut body = String::new();
        for record in rows.values() {
            body.push_str(&encode_record(record)?);
            body.push('\n');
        }

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(body.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Rewrite a table file with one line per row.
    async fn compact_table(&self, table: &str) -> Result<()> {
        let rows = self.read_table(table).await?;
        self.write_table(table, &rows).await?;
        debug!("Compacted table {} to {} rows", table, rows.len());
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn account_name(&self) -> &str {
        &self.name
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(self.root.join(OBJECTS_DIR)).await?;
        let mut containers = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                containers.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        containers.sort();
        Ok(containers)
    }

    async fn create_container_if_absent(&self, container: &str) -> Result<()> {
        check_name("container", container)?;
        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(self.container_dir(container)).await?;
        Ok(())
    }

    async fn list_objects(&self, container: &str, options: ListOptions) -> Result<Vec<ObjectRef>> {
        check_name("container", container)?;
        let dir = self.container_dir(container);
        if !fs::try_exists(&dir).await? {
            return Err(BackupError::NotFound(format!("container '{}'", container)));
        }

        let mut listed = Vec::new();
        for name in Self::walk_names(&dir, options.flat).await? {
            if options.include_snapshots {
                for at in self.snapshot_times(container, &name).await? {
                    let size = fs::metadata(self.snapshot_path(container, &name, at))
                        .await?
                        .len();
                    listed.push(ObjectRef {
                        container: container.to_string(),
                        name: name.clone(),
                        snapshot: Some(at),
                        last_modified: at,
                        size,
                    });
                }
            }
            let path = self.object_path(container, &name);
            listed.push(ObjectRef {
                container: container.to_string(),
                name: name.clone(),
                snapshot: None,
                last_modified: Self::modified(&path).await?,
                size: fs::metadata(&path).await?.len(),
            });
        }
        Ok(listed)
    }

    async fn put_object(&self, container: &str, name: &str, data: Bytes) -> Result<()> {
        check_name("container", container)?;
        check_name("object", name)?;
        let dir = self.container_dir(container);
        if !fs::try_exists(&dir).await? {
            return Err(BackupError::NotFound(format!("container '{}'", container)));
        }

        let _guard = self.write_lock.lock().await;
        let path = self.object_path(container, name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, &data).await?;
        debug!("Put {} bytes to {}/{}", data.len(), container, name);
        Ok(())
    }

    async fn open_read(&self, object: &ObjectRef) -> Result<ObjectReader> {
        check_name("container", &object.container)?;
        check_name("object", &object.name)?;
        let path = match object.snapshot {
            Some(at) => self.snapshot_path(&object.container, &object.name, at),
            None => self.object_path(&object.container, &object.name),
        };
        let file = fs::File::open(&path)
            .await
            .map_err(|e| not_found_or(e, "object", &object.identifier()))?;
        Ok(Box::pin(BufReader::new(file)))
    }

    async fn create_append_object(&self, container: &str, name: &str) -> Result<()> {
        self.put_object(container, name, Bytes::new()).await
    }

    async fn append_bytes(&self, container: &str, name: &str, data: Bytes) -> Result<()> {
        check_name("container", container)?;
        check_name("object", name)?;
        let _guard = self.write_lock.lock().await;
        let path = self.object_path(container, name);
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| not_found_or(e, "append object", &format!("{}/{}", container, name)))?;
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn snapshot_object(&self, container: &str, name: &str) -> Result<DateTime<Utc>> {
        check_name("container", container)?;
        check_name("object", name)?;
        let _guard = self.write_lock.lock().await;

        let source = self.object_path(container, name);
        if !fs::try_exists(&source).await? {
            return Err(BackupError::NotFound(format!("object '{}/{}'", container, name)));
        }

        fs::create_dir_all(self.snapshot_dir(container, name)).await?;
        let mut at = truncate_micros(Utc::now());
        while fs::try_exists(self.snapshot_path(container, name, at)).await? {
            at += Duration::microseconds(1);
        }
        if let Some(last) = self.snapshot_times(container, name).await?.last() {
            if at <= *last {
                at = *last + Duration::microseconds(1);
            }
        }

        fs::copy(&source, self.snapshot_path(container, name, at)).await?;
        debug!("Snapshot of {}/{} taken at {}", container, name, at);
        Ok(at)
    }
}

#[async_trait]
impl RecordStore for LocalStore {
    fn account_name(&self) -> &str {
        &self.name
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(self.root.join(TABLES_DIR)).await?;
        let mut tables = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(TABLE_EXT) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    tables.push(stem.to_string());
                }
            }
        }
        tables.sort();
        Ok(tables)
    }

    async fn create_table_if_absent(&self, table: &str) -> Result<()> {
        check_name("table", table)?;
        let _guard = self.appended.lock().await;
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.table_path(table))
            .await?;
        Ok(())
    }

    async fn list_all_rows(&self, table: &str) -> Result<Vec<Record>> {
        check_name("table", table)?;
        Ok(self.read_table(table).await?.into_values().collect())
    }

    async fn query_partition(&self, table: &str, partition_key: &str) -> Result<Vec<Record>> {
        check_name("table", table)?;
        Ok(self
            .read_table(table)
            .await?
            .into_values()
            .filter(|r| r.partition_key == partition_key)
            .collect())
    }

    async fn get_row(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<Record>> {
        check_name("table", table)?;
        let mut rows = self.read_table(table).await?;
        Ok(rows.remove(&(partition_key.to_string(), row_key.to_string())))
    }

    /// Append the batch to the table log, compacting it when due.
    async fn commit_batch(&self, table: &str, rows: Vec<Record>) -> Result<()> {
        check_name("table", table)?;
        validate_batch(table, &rows)?;

        let now = truncate_micros(Utc::now());
        let count = rows.len();
        let mut body = String::new();
        for mut row in rows {
            row.timestamp = Some(now);
            body.push_str(&encode_record(&row)?);
            body.push('\n');
        }

        let mut appended = self.appended.lock().await;
        let path = self.table_path(table);
        if !fs::try_exists(&path).await? {
            return Err(BackupError::NotFound(format!("table '{}'", table)));
        }
        if !appended.contains_key(table) {
            self.compact_table(table).await?;
        }

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| not_found_or(e, "table", table))?;
        file.write_all(body.as_bytes()).await?;
        file.sync_data().await?;
        drop(file);

        let pending = appended.get(table).copied().unwrap_or(0) + count;
        if pending >= self.compact_after {
            self.compact_table(table).await?;
            appended.insert(table.to_string(), 0);
        } else {
            appended.insert(table.to_string(), pending);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;

    #[tokio::test]
    async fn test_tables_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = LocalStore::open("local", dir.path()).await.unwrap();
            store.create_table_if_absent("orders").await.unwrap();
            store
                .commit_batch(
                    "orders",
                    vec![
                        Record::new("p1", "r1").with("Qty", 3i32),
                        Record::new("p1", "r2").with("Qty", 4i64),
                    ],
                )
                .await
                .unwrap();
        }

        let store = LocalStore::open("local", dir.path()).await.unwrap();
        assert_eq!(store.list_tables().await.unwrap(), vec!["orders"]);
        let rows = store.list_all_rows("orders").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get("Qty").and_then(|v| v.as_i64()), Some(4));
        assert!(rows[0].timestamp.is_some());
    }

    #[tokio::test]
    async fn test_rejected_batch_leaves_table_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open("local", dir.path()).await.unwrap();
        store.create_table_if_absent("t").await.unwrap();
        assert!(store
            .commit_batch("t", vec![Record::new("a", "1"), Record::new("b", "1")])
            .await
            .is_err());
        assert!(store.list_all_rows("t").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_colliding_property_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open("local", dir.path()).await.unwrap();
        store.create_table_if_absent("t").await.unwrap();
        let err = store
            .commit_batch("t", vec![Record::new("p1", "r1").with("PartitionKey", "p2")])
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::BatchRejected { .. }));
        assert!(store.list_all_rows("t").await.unwrap().is_empty());
    }

    async fn file_lines(store: &LocalStore, table: &str) -> usize {
        fs::read_to_string(store.table_path(table))
            .await
            .unwrap()
            .lines()
            .count()
    }

    #[tokio::test]
    async fn test_appended_batches_merge_and_compact() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open("local", dir.path())
            .await
            .unwrap()
            .with_compaction_threshold(4);
        store.create_table_if_absent("orders").await.unwrap();

        for round in 0..3i32 {
            let batch = vec![
                Record::new("p1", "r1").with(format!("Round{}", round), round),
                Record::new("p1", "r2").with("Last", round),
            ];
            store.commit_batch("orders", batch).await.unwrap();
        }

        // Second commit reached the threshold and compacted; the third appended.
        assert_eq!(file_lines(&store, "orders").await, 4);

        let reopened = LocalStore::open("local", dir.path()).await.unwrap();
        let rows = reopened.list_all_rows("orders").await.unwrap();
        assert_eq!(rows.len(), 2);
        for round in 0..3i32 {
            assert_eq!(
                rows[0].get(&format!("Round{}", round)).and_then(|v| v.as_i64()),
                Some(i64::from(round))
            );
        }
        assert_eq!(rows[1].get("Last").and_then(|v| v.as_i64()), Some(2));

        reopened
            .commit_batch("orders", vec![Record::new("p1", "r3")])
            .await
            .unwrap();
        assert_eq!(file_lines(&reopened, "orders").await, 3);
    }

    #[tokio::test]
    async fn test_torn_last_line_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open("local", dir.path()).await.unwrap();
        store.create_table_if_absent("t").await.unwrap();
        let good = encode_record(&Record::new("p", "r1")).unwrap();
        fs::write(store.table_path("t"), format!("{}\n{{\"PartitionKey\":\"p", good))
            .await
            .unwrap();

        assert_eq!(store.list_all_rows("t").await.unwrap().len(), 1);

        store
            .commit_batch("t", vec![Record::new("p", "r2")])
            .await
            .unwrap();
        let rows = store.list_all_rows("t").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(file_lines(&store, "t").await, 2);
    }

    #[tokio::test]
    async fn test_corrupt_inner_line_still_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open("local", dir.path()).await.unwrap();
        store.create_table_if_absent("t").await.unwrap();
        let good = encode_record(&Record::new("p", "r1")).unwrap();
        fs::write(store.table_path("t"), format!("{{broken\n{}\n", good))
            .await
            .unwrap();

        let err = store.list_all_rows("t").await.unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[tokio::test]
    async fn test_nested_objects_and_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open("local", dir.path()).await.unwrap();
        store.create_container_if_absent("images").await.unwrap();
        store
            .put_object("images", "2024/cat.png", Bytes::from_static(b"meow"))
            .await
            .unwrap();
        store
            .put_object("images", "dog.png", Bytes::from_static(b"woof"))
            .await
            .unwrap();

        let flat = store.list_objects("images", ListOptions::current()).await.unwrap();
        let names: Vec<_> = flat.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["2024/cat.png", "dog.png"]);

        let top = store
            .list_objects(
                "images",
                ListOptions {
                    include_snapshots: false,
                    flat: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(top.len(), 1);

        let first = store.snapshot_object("images", "dog.png").await.unwrap();
        let second = store.snapshot_object("images", "dog.png").await.unwrap();
        assert!(second > first);

        let all = store
            .list_objects("images", ListOptions::all_versions())
            .await
            .unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[1].snapshot, Some(first));
        assert_eq!(store.read_object(&all[1]).await.unwrap(), Bytes::from_static(b"woof"));
    }

    #[tokio::test]
    async fn test_append_object_reads_by_line() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open("local", dir.path()).await.unwrap();
        store.create_container_if_absent("tablebackup").await.unwrap();
        store.create_append_object("tablebackup", "orders").await.unwrap();
        for chunk in ["a\n", "b\n", "c\n"] {
            store
                .append_bytes("tablebackup", "orders", Bytes::from(chunk))
                .await
                .unwrap();
        }

        let reader = store
            .open_read(&ObjectRef::new("tablebackup", "orders"))
            .await
            .unwrap();
        let mut lines = reader.lines();
        let mut seen = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            seen.push(line);
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_path_escape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open("local", dir.path()).await.unwrap();
        assert!(store.create_container_if_absent("../outside").await.is_err());
        assert!(store.create_table_if_absent("").await.is_err());
    }
}
