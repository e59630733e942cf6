//! Core types shared by the stores and the pipelines.
//!
//! - [`value`]: typed property values ([`PropertyValue`], [`PropertyKind`])
//! - [`record`]: schema-less table rows ([`Record`])
//! - [`object`]: blob references ([`ObjectRef`], [`ListOptions`])
//! - [`traits`]: the [`ObjectStore`] and [`RecordStore`] seams

pub mod object;
pub mod record;
pub mod traits;
pub mod value;

pub use object::{ListOptions, ObjectRef};
pub use record::{check_property_name, Record, PARTITION_KEY, ROW_KEY, TIMESTAMP, TYPE_SUFFIX};
pub use traits::{validate_batch, ObjectReader, ObjectStore, RecordStore, MAX_BATCH_SIZE};
pub use value::{PropertyKind, PropertyValue};
