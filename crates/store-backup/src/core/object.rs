//! Object (blob) references.

use chrono::{DateTime, SecondsFormat, Utc};

/// A listed object, optionally a point-in-time snapshot of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub container: String,
    pub name: String,
    /// Capture time when this reference is a snapshot.
    pub snapshot: Option<DateTime<Utc>>,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
}

impl ObjectRef {
    pub fn new(container: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            name: name.into(),
            snapshot: None,
            last_modified: Utc::now(),
            size: 0,
        }
    }

    pub fn is_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Identifier used in outcomes: `container/name`, with `@time` for snapshots.
    pub fn identifier(&self) -> String {
        match self.snapshot {
            Some(at) => format!(
                "{}/{}@{}",
                self.container,
                self.name,
                at.to_rfc3339_opts(SecondsFormat::Micros, true)
            ),
            None => format!("{}/{}", self.container, self.name),
        }
    }
}

/// Options for [`ObjectStore::list_objects`](super::ObjectStore::list_objects).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Include snapshots alongside current versions.
    pub include_snapshots: bool,
    /// List every object regardless of `/` separators in names.
    pub flat: bool,
}

impl ListOptions {
    /// Current versions only, flat.
    pub fn current() -> Self {
        Self {
            include_snapshots: false,
            flat: true,
        }
    }

    /// Everything including snapshots, flat.
    pub fn all_versions() -> Self {
        Self {
            include_snapshots: true,
            flat: true,
        }
    }
}
