//! Error types for the backup library.

use thiserror::Error;

/// Exit code for configuration and usage errors.
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for store, enumeration and retry failures.
pub const EXIT_STORE_ERROR: u8 = 3;
/// Exit code for operation ledger failures.
pub const EXIT_LEDGER_ERROR: u8 = 4;
/// Exit code for record serialization failures.
pub const EXIT_SERIALIZATION_ERROR: u8 = 5;
/// Exit code for IO errors.
pub const EXIT_IO_ERROR: u8 = 7;
/// Exit code when the run was cancelled by a signal.
pub const EXIT_CANCELLED: u8 = 130;

/// Main error type for backup and restore operations.
#[derive(Error, Debug)]
pub enum BackupError {
    /// Configuration or usage error (missing window, bad connection string, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A remote store call failed.
    #[error("Store error during {operation}: {message}")]
    Store {
        operation: String,
        message: String,
        transient: bool,
    },

    /// The requested container, object, table or row does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A batch commit was rejected by the record store.
    #[error("Batch rejected for table {table}: {message}")]
    BatchRejected { table: String, message: String },

    /// A retried call kept failing.
    #[error("{operation} failed after {attempts} attempts")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<BackupError>,
    },

    /// Listing containers, tables or items failed; the run cannot proceed.
    #[error("Enumeration of {target} failed")]
    Enumeration {
        target: String,
        #[source]
        source: Box<BackupError>,
    },

    /// Operation ledger could not be read or written.
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// A serialized record line could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error (local store, config file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Run was cancelled (SIGINT, etc.)
    #[error("Run cancelled")]
    Cancelled,
}

impl BackupError {
    /// Create a transient store error (eligible for retry).
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        BackupError::Store {
            operation: operation.into(),
            message: message.into(),
            transient: true,
        }
    }

    /// Create a permanent store error (never retried).
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        BackupError::Store {
            operation: operation.into(),
            message: message.into(),
            transient: false,
        }
    }

    /// Create a batch rejection error.
    pub fn batch_rejected(table: impl Into<String>, message: impl Into<String>) -> Self {
        BackupError::BatchRejected {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Wrap a listing failure as a run-level enumeration error.
    pub fn enumeration(target: impl Into<String>, source: BackupError) -> Self {
        BackupError::Enumeration {
            target: target.into(),
            source: Box::new(source),
        }
    }

    /// Whether the retry policy may try the failed call again.
    pub fn is_transient(&self) -> bool {
        match self {
            BackupError::Store { transient, .. } => *transient,
            BackupError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            BackupError::Config(_) | BackupError::Yaml(_) => EXIT_CONFIG_ERROR,
            BackupError::Store { .. }
            | BackupError::NotFound(_)
            | BackupError::BatchRejected { .. }
            | BackupError::RetriesExhausted { .. }
            | BackupError::Enumeration { .. } => EXIT_STORE_ERROR,
            BackupError::Ledger(_) => EXIT_LEDGER_ERROR,
            BackupError::Serialization(_) | BackupError::Json(_) => EXIT_SERIALIZATION_ERROR,
            BackupError::Io(_) => EXIT_IO_ERROR,
            BackupError::Cancelled => EXIT_CANCELLED,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for backup operations.
pub type Result<T> = std::result::Result<T, BackupError>;
