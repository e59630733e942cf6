//! Run orchestration: connects the accounts and drives one pipeline per call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::ledger::{Direction, ItemOutcome, OperationLedger, RunMode};
use crate::pipeline::{BackupPipeline, PipelineSettings, RestorePipeline, RestoreRequest, RunOutput};
use crate::store::StorageAccount;
use crate::summary::Summary;

/// Final status of a run that got past its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled,
}

/// A faulted item and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultedItem {
    pub source: String,
    pub diagnostic: String,
}

/// Result of a backup or restore run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Ledger run identifier.
    pub run_id: String,

    pub direction: Direction,

    pub mode: RunMode,

    pub status: RunStatus,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run completed.
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Containers backed up.
    pub containers: Vec<String>,

    /// Tables backed up or restored.
    pub tables: Vec<String>,

    pub summary: Summary,

    /// Whether the ledger holds the finished run.
    pub finished: bool,

    pub faulted_items: Vec<FaultedItem>,

    pub outcomes: Vec<ItemOutcome>,
}

impl RunReport {
    fn from_output(output: RunOutput) -> Self {
        let started_at = output.handle.started_at;
        let duration = output.completed_at - started_at;
        let faulted_items = output
            .outcomes
            .iter()
            .filter_map(|o| {
                o.diagnostic().map(|d| FaultedItem {
                    source: o.source.clone(),
                    diagnostic: d.to_string(),
                })
            })
            .collect();

        Self {
            run_id: output.handle.run_id,
            direction: output.handle.direction,
            mode: output.handle.mode,
            status: if output.cancelled {
                RunStatus::Cancelled
            } else {
                RunStatus::Completed
            },
            started_at,
            completed_at: output.completed_at,
            duration_seconds: duration.num_milliseconds() as f64 / 1000.0,
            containers: output.containers,
            tables: output.tables,
            summary: output.summary,
            finished: output.finished,
            faulted_items,
            outcomes: output.outcomes,
        }
    }

    /// Convert to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Owns the connected accounts and the operation ledger.
pub struct Orchestrator {
    config: Config,
    production: StorageAccount,
    backup: StorageAccount,
    ledger: OperationLedger,
    settings: PipelineSettings,
}

impl Orchestrator {
    /// Validate the configuration, connect every account and create the
    /// ledger tables.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let production = StorageAccount::connect(&config.production).await?;
        let backup = StorageAccount::connect(&config.backup).await?;
        let operational = match &config.operational {
            Some(connection) => StorageAccount::connect(connection).await?,
            None => backup.clone(),
        };
        Self::from_accounts(config, production, backup, operational).await
    }

    /// Build from already connected accounts.
    pub async fn from_accounts(
        config: Config,
        production: StorageAccount,
        backup: StorageAccount,
        operational: StorageAccount,
    ) -> Result<Self> {
        let settings = PipelineSettings::from_config(&config.pipeline);
        let ledger =
            OperationLedger::new(operational.records.clone()).with_batch_size(settings.batch_size);
        ledger.init().await?;

        info!(
            "Connected: production={}, backup={}, operational={}",
            production.name, backup.name, operational.name
        );

        Ok(Self {
            config,
            production,
            backup,
            ledger,
            settings,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn production_account(&self) -> &StorageAccount {
        &self.production
    }

    pub fn backup_account(&self) -> &StorageAccount {
        &self.backup
    }

    pub fn ledger(&self) -> &OperationLedger {
        &self.ledger
    }

    /// Back up production into the backup account.
    pub async fn backup(&self, cancel: CancellationToken) -> Result<RunReport> {
        let pipeline = BackupPipeline::new(
            self.production.clone(),
            self.backup.clone(),
            self.ledger.clone(),
            self.settings,
        )
        .with_selection(
            self.config.pipeline.get_containers(),
            self.config.pipeline.get_tables(),
        );

        let output = pipeline.run(cancel).await?;
        Ok(RunReport::from_output(output))
    }

    /// Restore archived tables from the backup account into production.
    pub async fn restore(
        &self,
        request: &RestoreRequest,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let pipeline = RestorePipeline::new(
            self.backup.clone(),
            self.production.clone(),
            self.ledger.clone(),
            self.settings,
        );

        let output = pipeline.run(request, cancel).await?;
        Ok(RunReport::from_output(output))
    }
}
