//! # store-backup
//!
//! Backup and restore engine for storage accounts that hold both blob
//! containers and record tables.
//!
//! A backup run copies every selected container and table from a production
//! account into a backup account and archives each table as a JSON-lines
//! snapshot. A restore run replays the table snapshots taken inside a time
//! window back into production. Both directions feature:
//!
//! - **Pipelined transfers** through bounded worker pools
//! - **Incremental runs** keyed off the last finished backup
//! - **Operation ledger** of every run and every item outcome
//! - **Retries** with exponential backoff for transient store faults
//!
//! ## Example
//!
//! ```rust,no_run
//! use store_backup::{Config, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> store_backup::Result<()> {
//!     let config = Config::load("backup.yaml")?;
//!     let orchestrator = Orchestrator::new(config).await?;
//!     let report = orchestrator.backup(CancellationToken::new()).await?;
//!     println!("Copied {} items", report.summary.copied);
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod codec;
pub mod config;
pub mod core;
pub mod error;
pub mod filter;
pub mod ledger;
pub mod orchestrator;
pub mod pipeline;
pub mod retry;
pub mod store;
pub mod summary;

// Re-exports for convenient access
pub use batch::{BatchReport, BatchWriter};
pub use config::{Config, PipelineConfig};
pub use crate::core::{ObjectRef, ObjectStore, PropertyValue, Record, RecordStore};
pub use error::{BackupError, Result};
pub use filter::Selection;
pub use ledger::{Direction, ItemOutcome, ItemStatus, OperationLedger, RunMode};
pub use orchestrator::{FaultedItem, Orchestrator, RunReport, RunStatus};
pub use pipeline::{RestoreRequest, SnapshotWindow};
pub use retry::RetryPolicy;
pub use store::{ConnectionString, LocalStore, MemoryStore, StorageAccount};
pub use summary::Summary;
