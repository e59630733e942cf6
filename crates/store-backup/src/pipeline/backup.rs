//! Backup pipeline: discover, enumerate, copy, record.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::batch::BatchSink;
use crate::codec::encode_record;
use crate::core::{ListOptions, ObjectRef, Record};
use crate::error::{BackupError, Result};
use crate::filter::{is_included, Selection, TABLE_BACKUP_CONTAINER};
use crate::ledger::{Direction, ItemOutcome, OperationLedger, RunHandle, RunMode};
use crate::retry::RetryPolicy;
use crate::store::StorageAccount;

use super::stage::{spawn_feeder, spawn_stage};
use super::{complete_run, join_recorder, spawn_recorder, PipelineSettings, RunOutput};

/// Serialized lines per append call when archiving a table.
const ARCHIVE_CHUNK_LINES: usize = 1000;

/// Unit handed from discovery to enumeration.
#[derive(Debug, Clone)]
enum Target {
    Container(String),
    Table(String),
}

/// Unit handed from enumeration to copy.
#[derive(Debug, Clone)]
enum BackupItem {
    Object(ObjectRef),
    Table(String),
}

/// State shared by the copy workers of one run.
struct CopyContext {
    source: StorageAccount,
    destination: StorageAccount,
    handle: RunHandle,
    retry: RetryPolicy,
    batch_size: usize,
}

impl CopyContext {
    /// Start of the previous finished run, when this run is incremental.
    fn since(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        match self.handle.mode {
            RunMode::Incremental => self.handle.previous_run,
            RunMode::Full => None,
        }
    }

    async fn copy(&self, item: BackupItem) -> ItemOutcome {
        match item {
            BackupItem::Object(object) => self.copy_object(object).await,
            BackupItem::Table(table) => match self.copy_table(&table).await {
                Ok(rows) => {
                    debug!("Table {}: {} rows copied", table, rows);
                    ItemOutcome::completed(table)
                }
                Err(e) => {
                    warn!("Table {} faulted: {}", table, e);
                    ItemOutcome::faulted(table, e.to_string())
                }
            },
        }
    }

    async fn copy_object(&self, object: ObjectRef) -> ItemOutcome {
        let identifier = object.identifier();

        if let Some(since) = self.since() {
            if object.last_modified < since {
                return ItemOutcome::skipped(identifier);
            }
        }

        let result = async {
            self.destination
                .objects
                .create_container_if_absent(&object.container)
                .await?;
            self.source
                .objects
                .copy_object(&object, self.destination.objects.as_ref())
                .await
        }
        .await;

        match result {
            Ok(()) => ItemOutcome::completed(identifier),
            Err(e) => {
                warn!("Object {} faulted: {}", identifier, e);
                ItemOutcome::faulted(identifier, e.to_string())
            }
        }
    }

    /// Replay changed rows into the destination table, then archive the
    /// whole table as a snapshot in the record-backup container.
    async fn copy_table(&self, table: &str) -> Result<usize> {
        let source = self.source.records.clone();
        let rows = self
            .retry
            .run(&format!("list rows of {}", table), || {
                let source = source.clone();
                async move { source.list_all_rows(table).await }
            })
            .await?;

        self.destination
            .records
            .create_table_if_absent(table)
            .await?;

        let since = self.since();
        let mut changed: Vec<&Record> = rows
            .iter()
            .filter(|r| match (since, r.timestamp) {
                (Some(since), Some(ts)) => ts >= since,
                _ => true,
            })
            .collect();
        changed.sort_by(|a, b| a.partition_key.cmp(&b.partition_key));

        let mut sink = BatchSink::new(self.destination.records.clone(), table, self.batch_size);
        for row in changed {
            sink.push(row.clone()).await?;
        }
        let copied = sink.finish().await?;

        self.archive_table(table, &rows).await?;
        Ok(copied)
    }

    async fn archive_table(&self, table: &str, rows: &[Record]) -> Result<()> {
        let objects = &self.destination.objects;
        objects
            .create_container_if_absent(TABLE_BACKUP_CONTAINER)
            .await?;
        objects
            .create_append_object(TABLE_BACKUP_CONTAINER, table)
            .await?;

        for chunk in rows.chunks(ARCHIVE_CHUNK_LINES) {
            let mut body = String::new();
            for row in chunk {
                body.push_str(&encode_record(row)?);
                body.push('\n');
            }
            objects
                .append_bytes(TABLE_BACKUP_CONTAINER, table, Bytes::from(body))
                .await?;
        }

        let at = objects
            .snapshot_object(TABLE_BACKUP_CONTAINER, table)
            .await?;
        debug!("Table {}: archived {} rows, snapshot {}", table, rows.len(), at);
        Ok(())
    }
}

/// Copies every included container and table from a source account into a
/// destination account.
pub struct BackupPipeline {
    source: StorageAccount,
    destination: StorageAccount,
    ledger: OperationLedger,
    settings: PipelineSettings,
    containers: Selection,
    tables: Selection,
}

impl BackupPipeline {
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
            containers: Selection::All,
            tables: Selection::All,
        }
    }

    /// Limit the run to the named containers and tables.
    pub fn with_selection(mut self, containers: Selection, tables: Selection) -> Self {
        self.containers = containers;
        self.tables = tables;
        self
    }

    /// Run one backup.
    ///
    /// Returns `Err` when the run could not start or a listing failed; in the
    /// latter case the run stays unfinished in the ledger. Per-item failures
    /// are reported as faulted outcomes.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunOutput> {
        let handle = self
            .ledger
            .start_run(Direction::Backup, &self.source.name, &self.destination.name)
            .await?;

        let span = info_span!("backup", run_id = %handle.run_id, mode = %handle.mode);
        self.run_started(handle, cancel).instrument(span).await
    }

    async fn discover(&self) -> Result<(Vec<String>, Vec<String>)> {
        let objects = self.source.objects.clone();
        let containers = self
            .settings
            .retry
            .run("list containers", || {
                let objects = objects.clone();
                async move { objects.list_containers().await }
            })
            .await
            .map_err(|e| BackupError::enumeration("containers", e))?;

        let records = self.source.records.clone();
        let tables = self
            .settings
            .retry
            .run("list tables", || {
                let records = records.clone();
                async move { records.list_tables().await }
            })
            .await
            .map_err(|e| BackupError::enumeration("tables", e))?;

        let containers: Vec<String> = containers
            .into_iter()
            .filter(|c| is_included(c) && self.containers.matches(c))
            .collect();
        let tables: Vec<String> = tables
            .into_iter()
            .filter(|t| is_included(t) && self.tables.matches(t))
            .collect();
        Ok((containers, tables))
    }

    async fn run_started(&self, handle: RunHandle, cancel: CancellationToken) -> Result<RunOutput> {
        info!("Discovering containers and tables on {}", self.source.name);
        let (containers, tables) = self.discover().await?;
        info!(
            "Backing up {} containers and {} tables",
            containers.len(),
            tables.len()
        );

        // Internal token: fired by the caller or by an enumeration failure.
        let run_cancel = cancel.child_token();
        let failure: Arc<Mutex<Option<BackupError>>> = Arc::new(Mutex::new(None));

        let targets: Vec<Target> = containers
            .iter()
            .cloned()
            .map(Target::Container)
            .chain(tables.iter().cloned().map(Target::Table))
            .collect();

        let workers = &self.settings;
        let (target_tx, target_rx) = async_channel::bounded(workers.discovery_workers);
        let (item_tx, item_rx) = async_channel::bounded(workers.copy_workers);
        let (outcome_tx, outcome_rx) = async_channel::bounded(workers.batch_size);

        let feeder = spawn_feeder(targets, target_tx, run_cancel.clone());

        let enumerate = {
            let objects = self.source.objects.clone();
            let retry = self.settings.retry;
            let failure = failure.clone();
            let run_cancel = run_cancel.clone();
            spawn_stage(
                "enumerate",
                workers.discovery_workers,
                target_rx,
                item_tx,
                run_cancel.clone(),
                move |target: Target| {
                    let objects = objects.clone();
                    let failure = failure.clone();
                    let run_cancel = run_cancel.clone();
                    async move {
                        match target {
                            Target::Table(table) => vec![BackupItem::Table(table)],
                            Target::Container(container) => {
                                let listed = retry
                                    .run(&format!("list objects in {}", container), || {
                                        let objects = objects.clone();
                                        let container = container.clone();
                                        async move {
                                            objects
                                                .list_objects(&container, ListOptions::current())
                                                .await
                                        }
                                    })
                                    .await;
                                match listed {
                                    Ok(objects) => {
                                        debug!("Container {}: {} objects", container, objects.len());
                                        objects.into_iter().map(BackupItem::Object).collect()
                                    }
                                    Err(e) => {
                                        {
                                            let mut slot = failure
                                                .lock()
                                                .unwrap_or_else(|poisoned| poisoned.into_inner());
                                            if slot.is_none() {
                                                *slot = Some(BackupError::enumeration(
                                                    format!("container {}", container),
                                                    e,
                                                ));
                                            }
                                        }
                                        run_cancel.cancel();
                                        Vec::new()
                                    }
                                }
                            }
                        }
                    }
                },
            )
        };

        let context = Arc::new(CopyContext {
            source: self.source.clone(),
            destination: self.destination.clone(),
            handle: handle.clone(),
            retry: self.settings.retry,
            batch_size: self.settings.batch_size,
        });
        let copy = spawn_stage(
            "copy",
            workers.copy_workers,
            item_rx,
            outcome_tx,
            run_cancel.clone(),
            move |item: BackupItem| {
                let context = context.clone();
                async move { vec![context.copy(item).await] }
            },
        );

        let recorder = spawn_recorder(
            self.ledger.clone(),
            handle.clone(),
            self.settings.batch_size,
            outcome_rx,
        );

        if let Err(e) = feeder.await {
            warn!("Target feeder failed: {}", e);
        }
        enumerate.join().await;
        copy.join().await;
        let outcomes = join_recorder(recorder).await?;

        let failure = failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(e) = failure {
            warn!(
                "Run {} left unfinished after {} recorded outcomes",
                handle.run_id,
                outcomes.len()
            );
            return Err(e);
        }

        let output = complete_run(
            &self.ledger,
            handle,
            containers,
            tables,
            outcomes,
            cancel.is_cancelled(),
        )
        .await;
        info!(
            "Backup complete: {} copied, {} skipped, {} faulted",
            output.summary.copied, output.summary.skipped, output.summary.faulted
        );
        Ok(output)
    }
}
