//! Key derivation for the run and detail tables.
//!
//! Run ids are `MAX_TICKS - ticks(now)` zero-padded to 19 digits, where a
//! tick is 100 ns since 0001-01-01T00:00:00Z. Ascending key order is then
//! newest-first, so the latest run of a partition is its first row.

use chrono::{DateTime, Utc};

use crate::error::{BackupError, Result};

use super::model::Direction;

/// Ticks at 9999-12-31T23:59:59.9999999Z.
pub const MAX_TICKS: i64 = 3_155_378_975_999_999_999;

/// Ticks at 1970-01-01T00:00:00Z.
pub const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

const TICKS_PER_SECOND: i64 = 10_000_000;
const NANOS_PER_TICK: i64 = 100;

/// 100 ns ticks since 0001-01-01T00:00:00Z.
pub fn ticks(at: DateTime<Utc>) -> i64 {
    UNIX_EPOCH_TICKS
        + at.timestamp() * TICKS_PER_SECOND
        + i64::from(at.timestamp_subsec_nanos()) / NANOS_PER_TICK
}

/// Reverse-chronological, fixed-width run id for `at`.
pub fn run_id_for(at: DateTime<Utc>) -> String {
    format!("{:019}", MAX_TICKS - ticks(at))
}

/// Recover the start time encoded in a run id.
pub fn run_time_from_id(run_id: &str) -> Result<DateTime<Utc>> {
    let reversed: i64 = run_id
        .parse()
        .map_err(|_| BackupError::Ledger(format!("invalid run id '{}'", run_id)))?;
    let since_epoch = MAX_TICKS - reversed - UNIX_EPOCH_TICKS;
    let secs = since_epoch.div_euclid(TICKS_PER_SECOND);
    let nanos = since_epoch.rem_euclid(TICKS_PER_SECOND) * NANOS_PER_TICK;
    DateTime::from_timestamp(secs, nanos as u32)
        .ok_or_else(|| BackupError::Ledger(format!("run id '{}' is out of range", run_id)))
}

/// `"{direction}_{source}_{destination}"`
pub fn run_partition_key(direction: Direction, source: &str, destination: &str) -> String {
    format!("{}_{}_{}", direction.as_str(), source, destination)
}

/// `"{run partition}_{run id}"`
pub fn detail_partition_key(run_partition: &str, run_id: &str) -> String {
    format!("{}_{}", run_partition, run_id)
}

/// Make an item identifier usable as a row key: every whitespace run and
/// every `/`, `\`, `#` or `?` becomes `_`.
pub fn sanitize_key(identifier: &str) -> String {
    let mut out = String::with_capacity(identifier.len());
    let mut in_whitespace = false;
    for c in identifier.chars() {
        if c.is_whitespace() {
            if !in_whitespace {
                out.push('_');
            }
            in_whitespace = true;
            continue;
        }
        in_whitespace = false;
        match c {
            '/' | '\\' | '#' | '?' => out.push('_'),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    #[test]
    fn test_known_tick_values() {
        let epoch = Utc.timestamp_opt(0, 0).unwrap();
        assert_eq!(ticks(epoch), UNIX_EPOCH_TICKS);
        assert_eq!(run_id_for(epoch), "2534023007999999999");
        assert_eq!(run_id_for(epoch).len(), 19);
    }

    #[test]
    fn test_run_id_roundtrip() {
        let at = Utc.with_ymd_and_hms(2024, 5, 17, 8, 15, 30).unwrap() + Duration::microseconds(123_456);
        assert_eq!(run_time_from_id(&run_id_for(at)).unwrap(), at);
        assert!(run_time_from_id("not-a-number").is_err());
    }

    #[test]
    fn test_partition_keys() {
        let run = run_partition_key(Direction::Backup, "prod", "bak");
        assert_eq!(run, "backup_prod_bak");
        assert_eq!(detail_partition_key(&run, "42"), "backup_prod_bak_42");
        assert_eq!(
            run_partition_key(Direction::Restore, "bak", "prod"),
            "restore_bak_prod"
        );
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("images/2024/cat.png"), "images_2024_cat.png");
        assert_eq!(sanitize_key("a  b\t\tc"), "a_b_c");
        assert_eq!(sanitize_key(r"x\y#z?w"), "x_y_z_w");
        assert_eq!(sanitize_key("plain"), "plain");
    }

    proptest! {
        #[test]
        fn prop_later_time_sorts_first(
            base in 0i64..4_000_000_000,
            delta_micros in 1i64..1_000_000_000,
        ) {
            let earlier = Utc.timestamp_opt(base, 0).unwrap();
            let later = earlier + Duration::microseconds(delta_micros);
            let (a, b) = (run_id_for(earlier), run_id_for(later));
            prop_assert_eq!(a.len(), 19);
            prop_assert_eq!(b.len(), 19);
            prop_assert!(b < a);
        }
    }
}
