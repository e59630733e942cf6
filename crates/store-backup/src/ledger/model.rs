//! Run and outcome types persisted by the ledger.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{PropertyValue, Record};
use crate::error::{BackupError, Result};
use crate::summary::Summary;

/// Whether a run copies production into backup or back again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Backup,
    Restore,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Backup => "backup",
            Direction::Restore => "restore",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full copies everything; incremental skips what the previous finished
/// run already covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    Full,
    Incremental,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Full => "Full",
            RunMode::Incremental => "Incremental",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "Full" => Ok(RunMode::Full),
            "Incremental" => Ok(RunMode::Incremental),
            other => Err(BackupError::Ledger(format!("unknown run mode '{}'", other))),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Column names in the run table.
const COL_ACTIVITY: &str = "ActivityType";
const COL_MODE: &str = "OperationType";
const COL_SOURCE: &str = "SourceAccount";
const COL_DESTINATION: &str = "DestinationAccount";
const COL_START: &str = "StartTime";
const COL_END: &str = "EndTime";
const COL_COPIED: &str = "Copied";
const COL_SKIPPED: &str = "Skipped";
const COL_FAULTED: &str = "Faulted";

/// One row of the run table.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub partition_key: String,
    pub run_id: String,
    pub direction: Direction,
    pub mode: RunMode,
    pub source: String,
    pub destination: String,
    pub start_time: DateTime<Utc>,
    /// Unset until the run finishes.
    pub end_time: Option<DateTime<Utc>>,
    pub summary: Summary,
}

impl RunRecord {
    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn to_record(&self) -> Record {
        let mut record = Record::new(&self.partition_key, &self.run_id)
            .with(COL_ACTIVITY, self.direction.as_str())
            .with(COL_MODE, self.mode.as_str())
            .with(COL_SOURCE, self.source.as_str())
            .with(COL_DESTINATION, self.destination.as_str())
            .with(COL_START, self.start_time);

        if let Some(end) = self.end_time {
            record.set(COL_END, end);
            record.set(COL_COPIED, self.summary.copied as i64);
            record.set(COL_SKIPPED, self.summary.skipped as i64);
            record.set(COL_FAULTED, self.summary.faulted as i64);
        }
        record
    }

    pub fn from_record(record: &Record) -> Result<Self> {
        let text = |name: &str| -> Result<String> {
            record
                .get(name)
                .and_then(PropertyValue::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    BackupError::Ledger(format!(
                        "run {} has no {} column",
                        record.row_key, name
                    ))
                })
        };
        let count = |name: &str| -> u64 {
            record
                .get(name)
                .and_then(PropertyValue::as_i64)
                .map(|v| v.max(0) as u64)
                .unwrap_or(0)
        };

        let direction = match text(COL_ACTIVITY)?.as_str() {
            "backup" => Direction::Backup,
            "restore" => Direction::Restore,
            other => {
                return Err(BackupError::Ledger(format!(
                    "run {} has unknown activity '{}'",
                    record.row_key, other
                )))
            }
        };
        let start_time = record
            .get(COL_START)
            .and_then(PropertyValue::as_datetime)
            .ok_or_else(|| BackupError::Ledger(format!("run {} has no start time", record.row_key)))?;

        Ok(Self {
            partition_key: record.partition_key.clone(),
            run_id: record.row_key.clone(),
            direction,
            mode: RunMode::parse(&text(COL_MODE)?)?,
            source: text(COL_SOURCE)?,
            destination: text(COL_DESTINATION)?,
            start_time,
            end_time: record.get(COL_END).and_then(PropertyValue::as_datetime),
            summary: Summary {
                copied: count(COL_COPIED),
                skipped: count(COL_SKIPPED),
                faulted: count(COL_FAULTED),
            },
        })
    }
}

/// Handle to a started run, passed to the pipeline stages.
#[derive(Debug, Clone, PartialEq)]
pub struct RunHandle {
    pub run_id: String,
    pub direction: Direction,
    pub partition_key: String,
    pub mode: RunMode,
    /// Start time of the previous finished run, set only in incremental mode.
    pub previous_run: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
}

/// Per-item result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemStatus {
    Completed,
    Skipped,
    Faulted { diagnostic: String },
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Completed => "Completed",
            ItemStatus::Skipped => "Skipped",
            ItemStatus::Faulted { .. } => "Faulted",
        }
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self, ItemStatus::Faulted { .. })
    }
}

/// Outcome of copying or restoring one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(flatten)]
    pub status: ItemStatus,
}

impl ItemOutcome {
    pub fn completed(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: None,
            status: ItemStatus::Completed,
        }
    }

    pub fn skipped(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: None,
            status: ItemStatus::Skipped,
        }
    }

    pub fn faulted(source: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: None,
            status: ItemStatus::Faulted {
                diagnostic: diagnostic.into(),
            },
        }
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn diagnostic(&self) -> Option<&str> {
        match &self.status {
            ItemStatus::Faulted { diagnostic } => Some(diagnostic),
            _ => None,
        }
    }
}
