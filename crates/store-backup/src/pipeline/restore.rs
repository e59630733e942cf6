//! Restore pipeline: select archived table snapshots inside a time window
//! and replay them into the destination record store.
//!
//! Tables restore in parallel. Snapshots of one table replay one after
//! another, oldest first, so the newest snapshot in the window decides the
//! final value of every row it holds.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::batch::BatchSink;
use crate::codec::decode_line;
use crate::core::{ListOptions, ObjectRef};
use crate::error::{BackupError, Result};
use crate::filter::{Selection, TABLE_BACKUP_CONTAINER};
use crate::ledger::{Direction, ItemOutcome, OperationLedger, RunHandle};
use crate::retry::RetryPolicy;
use crate::store::StorageAccount;

use super::stage::{spawn_feeder, spawn_stage};
use super::{complete_run, join_recorder, spawn_recorder, PipelineSettings, RunOutput};

/// Input format of window bounds, interpreted as UTC.
pub const WINDOW_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Half-open snapshot time window `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl SnapshotWindow {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self> {
        if from > to {
            return Err(BackupError::Config(format!(
                "restore window starts after it ends ({} > {})",
                from, to
            )));
        }
        Ok(Self { from, to })
    }

    /// Parse bounds written as `2024-01-01T00:00:00`.
    pub fn parse(from: &str, to: &str) -> Result<Self> {
        Self::new(parse_bound("from", from)?, parse_bound("to", to)?)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from <= at && at < self.to
    }
}

fn parse_bound(name: &str, value: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), WINDOW_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| {
            BackupError::Config(format!(
                "invalid --{} '{}': expected {} ({})",
                name, value, WINDOW_FORMAT, e
            ))
        })
}

/// Which archived tables to restore, and from when.
#[derive(Debug, Clone, Default)]
pub struct RestoreRequest {
    pub tables: Selection,
    /// Required; a request without one is rejected before the run starts.
    pub window: Option<SnapshotWindow>,
}

/// Snapshots whose capture time lies in `window` and whose name is selected.
///
/// Both bounds always apply, whatever the number of snapshots matching the
/// lower bound.
pub fn select_snapshots(
    objects: Vec<ObjectRef>,
    tables: &Selection,
    window: &SnapshotWindow,
) -> Vec<ObjectRef> {
    objects
        .into_iter()
        .filter(|o| o.snapshot.is_some_and(|at| window.contains(at)))
        .filter(|o| tables.matches(&o.name))
        .collect()
}

/// Group snapshots by table name, each group ordered by capture time.
pub fn group_by_table(snapshots: Vec<ObjectRef>) -> Vec<Vec<ObjectRef>> {
    let mut groups: BTreeMap<String, Vec<ObjectRef>> = BTreeMap::new();
    for snapshot in snapshots {
        groups.entry(snapshot.name.clone()).or_default().push(snapshot);
    }
    groups
        .into_values()
        .map(|mut group| {
            group.sort_by_key(|s| s.snapshot);
            group
        })
        .collect()
}

struct RestoreContext {
    source: StorageAccount,
    destination: StorageAccount,
    batch_size: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl RestoreContext {
    /// Replay one table's snapshots in order. Stops between snapshots once
    /// the run is cancelled.
    async fn restore_table(&self, snapshots: Vec<ObjectRef>) -> Vec<ItemOutcome> {
        let mut outcomes = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            if self.cancel.is_cancelled() {
                debug!("Cancelled before {}", snapshot.identifier());
                break;
            }
            outcomes.push(self.restore(snapshot).await);
        }
        outcomes
    }

    async fn restore(&self, snapshot: ObjectRef) -> ItemOutcome {
        let identifier = snapshot.identifier();
        let table = snapshot.name.clone();

        match self.replay(&snapshot).await {
            Ok(rows) => {
                debug!("Restored {} rows into {} from {}", rows, table, identifier);
                ItemOutcome::completed(identifier).with_destination(table)
            }
            Err(e) => {
                warn!("Snapshot {} faulted: {}", identifier, e);
                ItemOutcome::faulted(identifier, e.to_string()).with_destination(table)
            }
        }
    }

    async fn replay(&self, snapshot: &ObjectRef) -> Result<usize> {
        let table = &snapshot.name;
        self.destination
            .records
            .create_table_if_absent(table)
            .await?;

        let reader = self
            .retry
            .run(&format!("open snapshot {}", snapshot.identifier()), || {
                self.source.objects.open_read(snapshot)
            })
            .await?;
        let mut lines = reader.lines();
        let mut sink = BatchSink::new(self.destination.records.clone(), table.as_str(), self.batch_size);
        let mut line_no = 0usize;

        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let record = decode_line(&line)
                .map_err(|e| BackupError::Serialization(format!("line {}: {}", line_no, e)))?;
            sink.push(record).await?;
        }

        sink.finish().await
    }
}

/// Replays archived table snapshots from a backup account.
pub struct RestorePipeline {
    source: StorageAccount,
    destination: StorageAccount,
    ledger: OperationLedger,
    settings: PipelineSettings,
}

impl RestorePipeline {
    pub fn new(
        source: StorageAccount,
        destination: StorageAccount,
        ledger: OperationLedger,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            source,
            destination,
            ledger,
            settings,
        }
    }

    /// Run one restore.
    pub async fn run(&self, request: &RestoreRequest, cancel: CancellationToken) -> Result<RunOutput> {
        let window = request.window.ok_or_else(|| {
            BackupError::Config("restore requires a snapshot window (--from and --to)".into())
        })?;

        let handle = self
            .ledger
            .start_run(Direction::Restore, &self.source.name, &self.destination.name)
            .await?;

        let span = info_span!("restore", run_id = %handle.run_id, mode = %handle.mode);
        self.run_started(handle, &request.tables, window, cancel)
            .instrument(span)
            .await
    }

    async fn run_started(
        &self,
        handle: RunHandle,
        tables: &Selection,
        window: SnapshotWindow,
        cancel: CancellationToken,
    ) -> Result<RunOutput> {
        info!(
            "Listing snapshots in {} between {} and {}",
            TABLE_BACKUP_CONTAINER, window.from, window.to
        );
        let objects = self.source.objects.clone();
        let listed = self
            .settings
            .retry
            .run("list snapshots", || {
                let objects = objects.clone();
                async move {
                    objects
                        .list_objects(TABLE_BACKUP_CONTAINER, ListOptions::all_versions())
                        .await
                }
            })
            .await
            .map_err(|e| BackupError::enumeration(TABLE_BACKUP_CONTAINER, e))?;

        let snapshots = select_snapshots(listed, tables, &window);
        let count = snapshots.len();
        let groups = group_by_table(snapshots);
        let restored_tables: Vec<String> = groups
            .iter()
            .filter_map(|group| group.first().map(|s| s.name.clone()))
            .collect();
        info!(
            "Restoring {} snapshots of {} tables",
            count,
            restored_tables.len()
        );

        let (group_tx, group_rx) = async_channel::bounded(self.settings.copy_workers);
        let (outcome_tx, outcome_rx) = async_channel::bounded(self.settings.batch_size);

        let feeder = spawn_feeder(groups, group_tx, cancel.clone());

        let context = Arc::new(RestoreContext {
            source: self.source.clone(),
            destination: self.destination.clone(),
            batch_size: self.settings.batch_size,
            retry: self.settings.retry,
            cancel: cancel.clone(),
        });
        let restore = spawn_stage(
            "restore",
            self.settings.copy_workers,
            group_rx,
            outcome_tx,
            cancel.clone(),
            move |group: Vec<ObjectRef>| {
                let context = context.clone();
                async move { context.restore_table(group).await }
            },
        );

        let recorder = spawn_recorder(
            self.ledger.clone(),
            handle.clone(),
            self.settings.batch_size,
            outcome_rx,
        );

        if let Err(e) = feeder.await {
            warn!("Snapshot feeder failed: {}", e);
        }
        restore.join().await;
        let outcomes = join_recorder(recorder).await?;

        let output = complete_run(
            &self.ledger,
            handle,
            Vec::new(),
            restored_tables,
            outcomes,
            cancel.is_cancelled(),
        )
        .await;
        info!(
            "Restore complete: {} restored, {} faulted",
            output.summary.copied, output.summary.faulted
        );
        Ok(output)
    }
}
