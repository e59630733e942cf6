//! Configuration validation.

use super::Config;
use crate::core::MAX_BATCH_SIZE;
use crate::error::{BackupError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    if config.production.trim().is_empty() {
        return Err(BackupError::Config("production connection string is required".into()));
    }
    if config.backup.trim().is_empty() {
        return Err(BackupError::Config("backup connection string is required".into()));
    }
    if let Some(operational) = &config.operational {
        if operational.trim().is_empty() {
            return Err(BackupError::Config(
                "operational connection string must not be empty when set".into(),
            ));
        }
    }

    // Cannot back up onto the same account
    if config.production.trim() == config.backup.trim() {
        return Err(BackupError::Config(
            "production and backup cannot be the same account".into(),
        ));
    }

    let pipeline = &config.pipeline;
    if let Some(0) = pipeline.discovery_workers {
        return Err(BackupError::Config(
            "pipeline.discovery_workers must be at least 1".into(),
        ));
    }
    if let Some(0) = pipeline.copy_workers {
        return Err(BackupError::Config(
            "pipeline.copy_workers must be at least 1".into(),
        ));
    }
    if let Some(size) = pipeline.batch_size {
        if size == 0 || size > MAX_BATCH_SIZE {
            return Err(BackupError::Config(format!(
                "pipeline.batch_size must be between 1 and {}, got {}",
                MAX_BATCH_SIZE, size
            )));
        }
    }
    if let Some(0) = pipeline.retry_max_attempts {
        return Err(BackupError::Config(
            "pipeline.retry_max_attempts must be at least 1".into(),
        ));
    }

    Ok(())
}
