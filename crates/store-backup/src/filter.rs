//! Container/table name classification and user name selections.

use std::collections::BTreeSet;

/// Container holding serialized table archives and their snapshots.
pub const TABLE_BACKUP_CONTAINER: &str = "tablebackup";

/// Names starting with any of these are system-internal.
const EXCLUDED_PREFIXES: &[&str] = &[
    "wad",
    "azure",
    "cacheclusterconfigs",
    "arm-templates",
    "deploymentlog",
    "datadownloads",
    "downloads",
    "staged-dash-files",
    "stagedfiles",
    TABLE_BACKUP_CONTAINER,
];

/// Names containing any of these are system-internal.
const EXCLUDED_SUBSTRINGS: &[&str] = &["stageartifacts"];

/// Whether a container or table name is system-internal and must not be
/// backed up. Case-insensitive.
pub fn is_excluded(name: &str) -> bool {
    let name = name.to_lowercase();
    let prefix_hit = EXCLUDED_PREFIXES
        .iter()
        .fold(false, |hit, prefix| hit | name.starts_with(prefix));
    let substring_hit = EXCLUDED_SUBSTRINGS
        .iter()
        .fold(false, |hit, part| hit | name.contains(part));
    prefix_hit | substring_hit
}

/// Inverse of [`is_excluded`].
pub fn is_included(name: &str) -> bool {
    !is_excluded(name)
}

/// User-supplied name selection: `*` for everything or an explicit list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Selection {
    #[default]
    All,
    Names(BTreeSet<String>),
}

impl Selection {
    /// Parse a comma-separated list such as `"orders, customers"`.
    ///
    /// Whitespace is ignored; an empty string or any `*` entry selects
    /// everything.
    pub fn parse(list: &str) -> Self {
        let names: BTreeSet<String> = list
            .split(',')
            .map(|n| n.chars().filter(|c| !c.is_whitespace()).collect::<String>())
            .filter(|n| !n.is_empty())
            .collect();

        if names.is_empty() || names.contains("*") {
            Selection::All
        } else {
            Selection::Names(names)
        }
    }

    /// Exact, case-sensitive match.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Selection::All => true,
            Selection::Names(names) => names.contains(name),
        }
    }
}
