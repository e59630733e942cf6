//! Operation ledger: durable record of runs and per-item outcomes.
//!
//! Two tables live in the operational account:
//!
//! - `backupoperations`: one row per run, partitioned by
//!   `direction_source_destination` and keyed by the reverse-chronological
//!   run id. The first finished row of a partition is the latest finished run
//!   and decides whether the next backup is incremental.
//! - `backupoperationdetails`: one row per item, partitioned by
//!   `runPartition_runId` and keyed by the sanitized item identifier.

pub mod keys;
pub mod model;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use tracing::{debug, error, info, warn};

use crate::batch::{BatchReport, BatchWriter};
use crate::core::{Record, RecordStore};
use crate::error::{BackupError, Result};
use crate::summary::Summary;

pub use keys::{detail_partition_key, run_id_for, run_partition_key, run_time_from_id, sanitize_key};
pub use model::{Direction, ItemOutcome, ItemStatus, RunHandle, RunMode, RunRecord};

/// Run table name.
pub const RUN_TABLE: &str = "backupoperations";
/// Per-item detail table name.
pub const DETAIL_TABLE: &str = "backupoperationdetails";

const COL_ITEM_SOURCE: &str = "Source";
const COL_ITEM_DESTINATION: &str = "Destination";
const COL_ITEM_STATUS: &str = "Status";
const COL_ITEM_EXTRA: &str = "ExtraInformation";

fn ledger_error(action: &str, e: BackupError) -> BackupError {
    BackupError::Ledger(format!("{}: {}", action, e))
}

/// Reads and writes run and outcome rows in a [`RecordStore`].
#[derive(Clone)]
pub struct OperationLedger {
    store: Arc<dyn RecordStore>,
    writer: BatchWriter,
}

impl OperationLedger {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            writer: BatchWriter::default(),
        }
    }

    /// Use a smaller batch size for outcome commits.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.writer = BatchWriter::new(batch_size);
        self
    }

    /// Create both ledger tables if they do not exist yet.
    pub async fn init(&self) -> Result<()> {
        for table in [RUN_TABLE, DETAIL_TABLE] {
            self.store
                .create_table_if_absent(table)
                .await
                .map_err(|e| ledger_error(&format!("create table {}", table), e))?;
        }
        Ok(())
    }

    /// Every run of a (direction, source, destination) triple, newest first.
    pub async fn run_history(
        &self,
        direction: Direction,
        source: &str,
        destination: &str,
    ) -> Result<Vec<RunRecord>> {
        let partition = run_partition_key(direction, source, destination);
        let rows = self
            .store
            .query_partition(RUN_TABLE, &partition)
            .await
            .map_err(|e| ledger_error("read run history", e))?;

        rows.iter().map(RunRecord::from_record).collect()
    }

    /// Latest run of the triple that reached `Finished`.
    pub async fn last_finished_run(
        &self,
        direction: Direction,
        source: &str,
        destination: &str,
    ) -> Result<Option<RunRecord>> {
        let partition = run_partition_key(direction, source, destination);
        let mut rows = self.store.stream_partition(RUN_TABLE, &partition);
        while let Some(row) = rows
            .try_next()
            .await
            .map_err(|e| ledger_error("read run history", e))?
        {
            let run = RunRecord::from_record(&row)?;
            if run.is_finished() {
                return Ok(Some(run));
            }
        }
        Ok(None)
    }

    pub async fn start_run(
        &self,
        direction: Direction,
        source: &str,
        destination: &str,
    ) -> Result<RunHandle> {
        self.start_run_at(direction, source, destination, Utc::now())
            .await
    }

    /// Persist a `Started` row for a run beginning at `now`.
    pub async fn start_run_at(
        &self,
        direction: Direction,
        source: &str,
        destination: &str,
        now: DateTime<Utc>,
    ) -> Result<RunHandle> {
        let previous = match direction {
            Direction::Backup => self.last_finished_run(direction, source, destination).await?,
            Direction::Restore => None,
        };
        let mode = if previous.is_some() {
            RunMode::Incremental
        } else {
            RunMode::Full
        };

        let run = RunRecord {
            partition_key: run_partition_key(direction, source, destination),
            run_id: run_id_for(now),
            direction,
            mode,
            source: source.to_string(),
            destination: destination.to_string(),
            start_time: now,
            end_time: None,
            summary: Summary::default(),
        };

        self.store
            .commit_batch(RUN_TABLE, vec![run.to_record()])
            .await
            .map_err(|e| ledger_error("persist started run", e))?;

        info!(
            "Started {} run {} ({} mode, {} -> {})",
            direction, run.run_id, mode, source, destination
        );

        Ok(RunHandle {
            run_id: run.run_id,
            direction,
            partition_key: run.partition_key,
            mode,
            previous_run: previous.map(|p| p.start_time),
            started_at: now,
        })
    }

    fn outcome_row(detail_partition: &str, outcome: &ItemOutcome) -> Record {
        let mut row = Record::new(detail_partition, sanitize_key(&outcome.source))
            .with(COL_ITEM_SOURCE, outcome.source.as_str())
            .with(COL_ITEM_STATUS, outcome.status.as_str());
        if let Some(destination) = &outcome.destination {
            row.set(COL_ITEM_DESTINATION, destination.as_str());
        }
        if let Some(diagnostic) = outcome.diagnostic() {
            row.set(COL_ITEM_EXTRA, diagnostic);
        }
        row
    }

    /// Write per-item detail rows. Failed batches are logged and reported;
    /// the remaining batches are still committed.
    pub async fn record_outcomes(&self, handle: &RunHandle, outcomes: &[ItemOutcome]) -> BatchReport {
        if outcomes.is_empty() {
            return BatchReport::default();
        }

        let partition = detail_partition_key(&handle.partition_key, &handle.run_id);
        let rows: Vec<Record> = outcomes
            .iter()
            .map(|o| Self::outcome_row(&partition, o))
            .collect();

        let report = self
            .writer
            .commit_all(self.store.as_ref(), DETAIL_TABLE, rows)
            .await;

        for failure in &report.failures {
            error!(
                "Run {}: could not record outcomes for {}: {}",
                handle.run_id,
                failure.row_keys.join(", "),
                failure.error
            );
        }
        debug!(
            "Run {}: recorded {} outcomes in {} batches",
            handle.run_id, report.committed, report.batches
        );
        report
    }

    /// Mark the run finished with its counts.
    ///
    /// Returns `Ok(false)` without writing when the started row is missing.
    pub async fn finish_run(&self, handle: &RunHandle, summary: &Summary) -> Result<bool> {
        let row = self
            .store
            .get_row(RUN_TABLE, &handle.partition_key, &handle.run_id)
            .await
            .map_err(|e| ledger_error("load started run", e))?;

        let Some(row) = row else {
            error!(
                "Could not finish run {} because its start row was not found",
                handle.run_id
            );
            return Ok(false);
        };

        let mut run = RunRecord::from_record(&row)?;
        run.end_time = Some(Utc::now());
        run.summary = *summary;

        self.store
            .commit_batch(RUN_TABLE, vec![run.to_record()])
            .await
            .map_err(|e| ledger_error("persist finished run", e))?;

        if summary.faulted > 0 {
            warn!(
                "Finished run {} with {} faulted items",
                handle.run_id, summary.faulted
            );
        } else {
            info!("Finished run {}", handle.run_id);
        }
        Ok(true)
    }
}
