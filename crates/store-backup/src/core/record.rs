//! Schema-less records keyed by partition and row key.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::value::PropertyValue;
use crate::error::{BackupError, Result};

pub const PARTITION_KEY: &str = "PartitionKey";
pub const ROW_KEY: &str = "RowKey";
pub const TIMESTAMP: &str = "Timestamp";

/// Suffix of the per-property type discriminator in serialized lines.
pub const TYPE_SUFFIX: &str = "@type";

pub(crate) fn is_reserved(name: &str) -> bool {
    name == PARTITION_KEY || name == ROW_KEY || name == TIMESTAMP
}

/// Reject property names that would collide with a key field or a type
/// discriminator once serialized.
pub fn check_property_name(name: &str) -> Result<()> {
    if is_reserved(name) {
        return Err(BackupError::Serialization(format!(
            "property name '{}' is reserved",
            name
        )));
    }
    if name.ends_with(TYPE_SUFFIX) {
        return Err(BackupError::Serialization(format!(
            "property name '{}' must not end in '{}'",
            name, TYPE_SUFFIX
        )));
    }
    Ok(())
}

/// One row of a record table.
///
/// The partition key is the grouping key: a record store only accepts
/// batches whose rows all share it.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub partition_key: String,
    pub row_key: String,
    /// Last-modified time assigned by the store.
    pub timestamp: Option<DateTime<Utc>>,
    pub properties: BTreeMap<String, PropertyValue>,
}

impl Record {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            timestamp: None,
            properties: BTreeMap::new(),
        }
    }

    /// Builder-style property setter.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// Merge another version of the same row into this one (InsertOrMerge).
    ///
    /// Properties present in `other` overwrite ours; properties only we hold
    /// are kept.
    pub fn merge_from(&mut self, other: Record) {
        if other.timestamp.is_some() {
            self.timestamp = other.timestamp;
        }
        self.properties.extend(other.properties);
    }

    /// Check every property name with [`check_property_name`].
    pub fn check_property_names(&self) -> Result<()> {
        self.properties
            .keys()
            .map(String::as_str)
            .try_for_each(check_property_name)
    }
}
