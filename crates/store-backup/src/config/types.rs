//! Configuration type definitions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::MAX_BATCH_SIZE;
use crate::filter::Selection;
use crate::retry::RetryPolicy;

/// Root configuration structure.
///
/// Both account connection strings may be left out of a file and supplied
/// on the command line instead; [`Config::validate`] requires them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Connection string of the production account.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub production: String,

    /// Connection string of the backup account.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backup: String,

    /// Connection string of the account holding the operation ledger.
    /// Defaults to the backup account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operational: Option<String>,

    /// Pipeline tuning.
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Configuration with default pipeline settings.
    pub fn new(production: impl Into<String>, backup: impl Into<String>) -> Self {
        Self {
            production: production.into(),
            backup: backup.into(),
            operational: None,
            pipeline: PipelineConfig::default(),
        }
    }

    /// Connection string for the operation ledger.
    pub fn operational_connection(&self) -> &str {
        self.operational.as_deref().unwrap_or(&self.backup)
    }
}

/// Pipeline behavior configuration.
/// Unset fields fall back to the defaults of the `get_*` accessors.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    /// Workers listing container contents (default: 10).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_workers: Option<usize>,

    /// Workers copying or restoring items (default: 20).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_workers: Option<usize>,

    /// Rows per batch commit, at most 100 (default: 100).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// First retry delay in milliseconds (default: 5000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_base_delay_ms: Option<u64>,

    /// Calls per retried operation, first call included (default: 5).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_max_attempts: Option<u32>,

    /// Containers to back up, comma-separated; `*` for all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub containers: Option<String>,

    /// Tables to back up or restore, comma-separated; `*` for all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tables: Option<String>,
}

impl PipelineConfig {
    pub fn get_discovery_workers(&self) -> usize {
        self.discovery_workers.unwrap_or(10)
    }

    pub fn get_copy_workers(&self) -> usize {
        self.copy_workers.unwrap_or(20)
    }

    pub fn get_batch_size(&self) -> usize {
        self.batch_size.unwrap_or(MAX_BATCH_SIZE)
    }

    pub fn get_retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms.unwrap_or(5000))
    }

    pub fn get_retry_max_attempts(&self) -> u32 {
        self.retry_max_attempts.unwrap_or(5)
    }

    pub fn get_containers(&self) -> Selection {
        self.containers
            .as_deref()
            .map(Selection::parse)
            .unwrap_or_default()
    }

    pub fn get_tables(&self) -> Selection {
        self.tables.as_deref().map(Selection::parse).unwrap_or_default()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.get_retry_base_delay(), self.get_retry_max_attempts())
    }
}
