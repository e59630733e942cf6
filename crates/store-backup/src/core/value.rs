//! Typed property values for schema-less records.
//!
//! Records carry arbitrary named properties. Each value keeps its original
//! type through backup and restore, so the variant is stored explicitly as a
//! [`PropertyKind`] discriminator next to the value when serialized.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BackupError;

/// Discriminator naming the type of a [`PropertyValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyKind {
    String,
    Int32,
    Int64,
    Double,
    Boolean,
    DateTime,
    Guid,
    Binary,
}

impl PropertyKind {
    /// Name used in the serialized discriminator.
    pub fn as_str(self) -> &'static str {
        match self {
            PropertyKind::String => "String",
            PropertyKind::Int32 => "Int32",
            PropertyKind::Int64 => "Int64",
            PropertyKind::Double => "Double",
            PropertyKind::Boolean => "Boolean",
            PropertyKind::DateTime => "DateTime",
            PropertyKind::Guid => "Guid",
            PropertyKind::Binary => "Binary",
        }
    }
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PropertyKind {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "String" => Ok(PropertyKind::String),
            "Int32" => Ok(PropertyKind::Int32),
            "Int64" => Ok(PropertyKind::Int64),
            "Double" => Ok(PropertyKind::Double),
            "Boolean" => Ok(PropertyKind::Boolean),
            "DateTime" => Ok(PropertyKind::DateTime),
            "Guid" => Ok(PropertyKind::Guid),
            "Binary" => Ok(PropertyKind::Binary),
            other => Err(BackupError::Serialization(format!(
                "unknown property type '{}'",
                other
            ))),
        }
    }
}

/// A single typed property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    String(String),
    Int32(i32),
    Int64(i64),
    Double(f64),
    Boolean(bool),
    DateTime(DateTime<Utc>),
    Guid(Uuid),
    Binary(Vec<u8>),
}

impl PropertyValue {
    /// The discriminator for this value.
    #[must_use]
    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyValue::String(_) => PropertyKind::String,
            PropertyValue::Int32(_) => PropertyKind::Int32,
            PropertyValue::Int64(_) => PropertyKind::Int64,
            PropertyValue::Double(_) => PropertyKind::Double,
            PropertyValue::Boolean(_) => PropertyKind::Boolean,
            PropertyValue::DateTime(_) => PropertyKind::DateTime,
            PropertyValue::Guid(_) => PropertyKind::Guid,
            PropertyValue::Binary(_) => PropertyKind::Binary,
        }
    }

    /// Borrow the string payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Widen any integer payload to i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Int32(v) => Some(i64::from(*v)),
            PropertyValue::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            PropertyValue::DateTime(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Int32(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int64(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Double(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Boolean(v)
    }
}

impl From<DateTime<Utc>> for PropertyValue {
    fn from(v: DateTime<Utc>) -> Self {
        PropertyValue::DateTime(v)
    }
}

impl From<Uuid> for PropertyValue {
    fn from(v: Uuid) -> Self {
        PropertyValue::Guid(v)
    }
}

impl From<Vec<u8>> for PropertyValue {
    fn from(v: Vec<u8>) -> Self {
        PropertyValue::Binary(v)
    }
}
