//! Backup and restore pipelines.
//!
//! Both pipelines are chains of fixed-size worker pools joined by bounded
//! `async_channel` queues, ending in a single recorder task:
//!
//! ```text
//! backup:  targets -> enumerate (10) -> copy (20) -> recorder
//! restore: snapshots -> restore (20) -> recorder
//! ```
//!
//! A full queue blocks its producer. Closing happens front to back: when a
//! stage's input is drained and closed, its workers exit and drop their
//! senders, closing the next queue. The recorder always drains its queue, so outcomes
//! produced before a cancellation are still written to the ledger.

mod backup;
mod restore;
mod stage;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn, Instrument};

use crate::batch::clamp_batch_size;
use crate::config::PipelineConfig;
use crate::error::{BackupError, Result};
use crate::ledger::{ItemOutcome, OperationLedger, RunHandle};
use crate::retry::RetryPolicy;
use crate::summary::Summary;

pub use backup::BackupPipeline;
pub use restore::{
    group_by_table, select_snapshots, RestorePipeline, RestoreRequest, SnapshotWindow,
};

/// Pool sizes, batch size and retry policy of a run.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub discovery_workers: usize,
    pub copy_workers: usize,
    pub batch_size: usize,
    pub retry: RetryPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl PipelineSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            discovery_workers: config.get_discovery_workers().max(1),
            copy_workers: config.get_copy_workers().max(1),
            batch_size: clamp_batch_size(config.get_batch_size()),
            retry: config.retry_policy(),
        }
    }
}

/// What a pipeline run produced.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub handle: RunHandle,
    /// Containers that passed discovery (backup only).
    pub containers: Vec<String>,
    /// Tables that passed discovery, or restored snapshot tables.
    pub tables: Vec<String>,
    pub outcomes: Vec<ItemOutcome>,
    pub summary: Summary,
    pub completed_at: DateTime<Utc>,
    /// Stopped by the caller's cancellation token; the run was not finished.
    pub cancelled: bool,
    /// The ledger marked the run finished.
    pub finished: bool,
}

/// Spawn the terminal stage: collect outcomes and write them to the ledger
/// every `batch_size` items and once more when the queue closes.
fn spawn_recorder(
    ledger: OperationLedger,
    handle: RunHandle,
    batch_size: usize,
    outcomes: async_channel::Receiver<ItemOutcome>,
) -> JoinHandle<Vec<ItemOutcome>> {
    tokio::spawn(
        async move {
            let mut all = Vec::new();
            let mut pending = Vec::with_capacity(batch_size);

            while let Ok(outcome) = outcomes.recv().await {
                pending.push(outcome);
                if pending.len() >= batch_size {
                    ledger.record_outcomes(&handle, &pending).await;
                    all.append(&mut pending);
                }
            }
            if !pending.is_empty() {
                ledger.record_outcomes(&handle, &pending).await;
                all.append(&mut pending);
            }
            debug!("Recorder drained {} outcomes", all.len());
            all
        }
        .in_current_span(),
    )
}

async fn join_recorder(recorder: JoinHandle<Vec<ItemOutcome>>) -> Result<Vec<ItemOutcome>> {
    recorder
        .await
        .map_err(|e| BackupError::Ledger(format!("outcome recorder failed: {}", e)))
}

/// Close out a run: finish it in the ledger unless it was cancelled.
async fn complete_run(
    ledger: &OperationLedger,
    handle: RunHandle,
    containers: Vec<String>,
    tables: Vec<String>,
    outcomes: Vec<ItemOutcome>,
    cancelled: bool,
) -> RunOutput {
    let summary = Summary::from_outcomes(&outcomes);

    let finished = if cancelled {
        warn!(
            "Run {} cancelled after {} items; leaving it unfinished",
            handle.run_id,
            summary.total()
        );
        false
    } else {
        match ledger.finish_run(&handle, &summary).await {
            Ok(finished) => finished,
            Err(e) => {
                error!("Could not finish run {}: {}", handle.run_id, e);
                false
            }
        }
    };

    RunOutput {
        handle,
        containers,
        tables,
        outcomes,
        summary,
        completed_at: Utc::now(),
        cancelled,
        finished,
    }
}
