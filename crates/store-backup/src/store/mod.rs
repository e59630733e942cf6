//! Concrete store clients and account connection.
//!
//! An account is reached through a connection string of `Key=Value;` pairs:
//!
//! - `UseMemoryStorage=true`: a fresh in-process [`MemoryStore`]
//! - `Root=<dir>`: a [`LocalStore`] rooted at `<dir>`
//!
//! `AccountName` names the account (used in ledger partition keys). An
//! `AccountKey` is accepted and kept out of debug output.

pub mod local;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::core::{ObjectStore, RecordStore};
use crate::error::{BackupError, Result};

pub use local::LocalStore;
pub use memory::{BatchEntry, FaultPoint, MemoryStore};

const KEY_ACCOUNT_NAME: &str = "accountname";
const KEY_ACCOUNT_KEY: &str = "accountkey";
const KEY_ROOT: &str = "root";
const KEY_MEMORY: &str = "usememorystorage";

const DEFAULT_MEMORY_ACCOUNT: &str = "memory";
const DEFAULT_LOCAL_ACCOUNT: &str = "local";

/// Parsed connection string. Keys are case-insensitive.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    values: BTreeMap<String, String>,
}

impl ConnectionString {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut values = BTreeMap::new();
        for part in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                BackupError::Config(format!(
                    "connection string segment '{}' is not Key=Value",
                    part
                ))
            })?;
            let key = key.trim().to_lowercase();
            if key.is_empty() {
                return Err(BackupError::Config(
                    "connection string has an empty key".into(),
                ));
            }
            values.insert(key, value.trim().to_string());
        }

        if values.is_empty() {
            return Err(BackupError::Config("connection string is empty".into()));
        }
        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(&key.to_lowercase()).map(String::as_str)
    }

    pub fn account_name(&self) -> Option<&str> {
        self.get(KEY_ACCOUNT_NAME)
    }

    pub fn use_memory(&self) -> bool {
        self.get(KEY_MEMORY)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    pub fn root(&self) -> Option<PathBuf> {
        self.get(KEY_ROOT).map(PathBuf::from)
    }
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in &self.values {
            if key == KEY_ACCOUNT_KEY {
                map.entry(key, &"[REDACTED]");
            } else {
                map.entry(key, value);
            }
        }
        map.finish()
    }
}

/// A named account exposing both store kinds.
#[derive(Clone)]
pub struct StorageAccount {
    pub name: String,
    pub objects: Arc<dyn ObjectStore>,
    pub records: Arc<dyn RecordStore>,
}

impl fmt::Debug for StorageAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageAccount")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl StorageAccount {
    /// Wrap one store that implements both traits.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: ObjectStore + RecordStore + 'static,
    {
        Self {
            name: ObjectStore::account_name(store.as_ref()).to_string(),
            objects: store.clone(),
            records: store,
        }
    }

    /// Connect to the account described by `connection_string`.
    pub async fn connect(connection_string: &str) -> Result<Self> {
        let parsed = ConnectionString::parse(connection_string)?;

        if parsed.use_memory() {
            let name = parsed.account_name().unwrap_or(DEFAULT_MEMORY_ACCOUNT);
            return Ok(Self::from_store(Arc::new(MemoryStore::new(name))));
        }

        if let Some(root) = parsed.root() {
            let name = parsed.account_name().unwrap_or(DEFAULT_LOCAL_ACCOUNT);
            let store = LocalStore::open(name, root).await?;
            return Ok(Self::from_store(Arc::new(store)));
        }

        Err(BackupError::Config(format!(
            "no supported store in connection string {:?}",
            parsed
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        let cs = ConnectionString::parse("AccountName=prod; ROOT=/data/prod;").unwrap();
        assert_eq!(cs.account_name(), Some("prod"));
        assert_eq!(cs.root(), Some(PathBuf::from("/data/prod")));
        assert!(!cs.use_memory());
    }

    #[test]
    fn test_account_key_redacted() {
        let cs = ConnectionString::parse("AccountName=prod;AccountKey=c2VjcmV0").unwrap();
        let debug = format!("{:?}", cs);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("c2VjcmV0"));
    }

    #[test]
    fn test_bad_strings_rejected() {
        assert!(ConnectionString::parse("").is_err());
        assert!(ConnectionString::parse("justtext").is_err());
        assert!(ConnectionString::parse("=x").is_err());
    }

    #[tokio::test]
    async fn test_connect_memory_and_local() {
        let memory = StorageAccount::connect("UseMemoryStorage=true;AccountName=prod")
            .await
            .unwrap();
        assert_eq!(memory.name, "prod");

        let dir = tempfile::tempdir().unwrap();
        let local = StorageAccount::connect(&format!("Root={}", dir.path().display()))
            .await
            .unwrap();
        assert_eq!(local.name, "local");
        assert!(local.records.list_tables().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_without_backend_fails() {
        let err = StorageAccount::connect("AccountName=prod;AccountKey=secret")
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));
        assert!(!err.to_string().contains("secret"));
    }
}
