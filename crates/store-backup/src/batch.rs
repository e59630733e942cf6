//! Partition-keyed batching of record writes.
//!
//! Record stores only accept batches of at most [`MAX_BATCH_SIZE`] rows that
//! all share one partition key. Two writers sit on top of the same flush rule:
//!
//! - [`BatchSink`] streams records in and stops at the first failed commit.
//!   Table copy and restore use it; a failure faults the whole item.
//! - [`BatchWriter::commit_all`] commits a finished list and keeps going past
//!   failed batches, reporting each one. The operation ledger uses it.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::{Record, RecordStore, MAX_BATCH_SIZE};
use crate::error::Result;

/// Clamp a configured batch size into `1..=MAX_BATCH_SIZE`.
pub fn clamp_batch_size(size: usize) -> usize {
    size.clamp(1, MAX_BATCH_SIZE)
}

/// Split `items` into batches.
///
/// A batch is closed when it reaches `limit`, when the next item's key
/// differs from the batch key, and at the end of the input. Items are never
/// reordered, so interleaved keys produce one batch per run of equal keys.
pub fn plan_batches<T, K, F>(items: impl IntoIterator<Item = T>, key: F, limit: usize) -> Vec<Vec<T>>
where
    K: PartialEq,
    F: Fn(&T) -> K,
{
    let limit = limit.max(1);
    let mut batches = Vec::new();
    let mut current: Vec<T> = Vec::new();
    let mut current_key: Option<K> = None;

    for item in items {
        let item_key = key(&item);
        let key_changed = current_key.as_ref().is_some_and(|k| *k != item_key);
        if !current.is_empty() && (key_changed || current.len() >= limit) {
            batches.push(std::mem::take(&mut current));
        }
        current_key = Some(item_key);
        current.push(item);
    }

    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Streaming batch writer for one destination table.
pub struct BatchSink {
    store: Arc<dyn RecordStore>,
    table: String,
    limit: usize,
    pending: Vec<Record>,
    committed: usize,
    batches: usize,
}

impl BatchSink {
    pub fn new(store: Arc<dyn RecordStore>, table: impl Into<String>, limit: usize) -> Self {
        let limit = clamp_batch_size(limit);
        Self {
            store,
            table: table.into(),
            limit,
            pending: Vec::with_capacity(limit),
            committed: 0,
            batches: 0,
        }
    }

    /// Add one record, committing the pending batch first if the partition
    /// key changes, and afterwards if the batch is full.
    pub async fn push(&mut self, record: Record) -> Result<()> {
        let key_changed = self
            .pending
            .first()
            .is_some_and(|first| first.partition_key != record.partition_key);
        if key_changed {
            self.flush().await?;
        }

        self.pending.push(record);

        if self.pending.len() >= self.limit {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let rows = std::mem::replace(&mut self.pending, Vec::with_capacity(self.limit));
        let count = rows.len();
        debug!(
            "{}: committing {} rows for partition '{}'",
            self.table, count, rows[0].partition_key
        );
        self.store.commit_batch(&self.table, rows).await?;
        self.committed += count;
        self.batches += 1;
        Ok(())
    }

    /// Commit whatever is pending and return the total rows committed.
    pub async fn finish(mut self) -> Result<usize> {
        self.flush().await?;
        debug!(
            "{}: {} rows committed in {} batches",
            self.table, self.committed, self.batches
        );
        Ok(self.committed)
    }
}

/// A batch that could not be committed.
#[derive(Debug, Clone)]
pub struct BatchFailure {
    pub partition_key: String,
    pub row_keys: Vec<String>,
    pub error: String,
}

/// Result of a tolerant [`BatchWriter::commit_all`].
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub batches: usize,
    pub committed: usize,
    pub failures: Vec<BatchFailure>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Commits a finished set of records, continuing past failed batches.
#[derive(Debug, Clone, Copy)]
pub struct BatchWriter {
    limit: usize,
}

impl Default for BatchWriter {
    fn default() -> Self {
        Self::new(MAX_BATCH_SIZE)
    }
}

impl BatchWriter {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: clamp_batch_size(limit),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Sort `records` by partition key (stable) and commit every batch.
    pub async fn commit_all(
        &self,
        store: &dyn RecordStore,
        table: &str,
        mut records: Vec<Record>,
    ) -> BatchReport {
        records.sort_by(|a, b| a.partition_key.cmp(&b.partition_key));

        let mut report = BatchReport::default();
        for batch in plan_batches(records, |r| r.partition_key.clone(), self.limit) {
            report.batches += 1;
            let partition_key = batch[0].partition_key.clone();
            let row_keys: Vec<String> = batch.iter().map(|r| r.row_key.clone()).collect();
            let count = batch.len();

            match store.commit_batch(table, batch).await {
                Ok(()) => report.committed += count,
                Err(e) => {
                    warn!(
                        "{}: batch of {} rows for partition '{}' failed: {}",
                        table, count, partition_key, e
                    );
                    report.failures.push(BatchFailure {
                        partition_key,
                        row_keys,
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }
}
