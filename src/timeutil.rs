//! Conversion between wall-time and the seconds/ms/us/day epoch units that
//! tables declare, in a named IANA timezone. Kept deliberately small: this
//! is component A in the system overview (~3% of the core) and every other
//! subsystem treats absolute time as an opaque `DateTime<Utc>`.

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// The epoch unit a table's timestamps are declared in.
#[derive(Clone, Copy, Eq, PartialEq, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpochUnit {
    Seconds,
    Millis,
    Micros,
    /// Whole days since the epoch, used only for day-index rollover
    /// comparisons (see [`to_day_index`]).
    Days,
}

/// Converts an integer epoch value in `unit`, interpreted in `tz`, to an
/// absolute UTC timestamp. `value` usually comes straight off the wire
/// (spec §6: `replay`'s `from`/`to`), so out-of-range input is reported to
/// the caller rather than panicking.
pub fn from_epoch(value: i64, unit: EpochUnit, tz: Tz) -> Option<DateTime<Utc>> {
    let naive_utc = match unit {
        EpochUnit::Seconds => DateTime::from_timestamp(value, 0),
        EpochUnit::Millis => DateTime::from_timestamp_millis(value),
        EpochUnit::Micros => DateTime::from_timestamp_micros(value),
        EpochUnit::Days => DateTime::from_timestamp(value.checked_mul(86_400)?, 0),
    }?;
    // The stored instant is already absolute (UTC); `tz` only matters when
    // translating back to a day index or a calendar epoch unit.
    let _ = tz;
    Some(naive_utc)
}

/// Converts an absolute timestamp to an integer epoch in `unit`, relative to
/// the given timezone's local calendar (only [`EpochUnit::Days`] is
/// timezone-sensitive; the others are tz-invariant since they count elapsed
/// time since the Unix epoch).
pub fn to_epoch(ts: DateTime<Utc>, unit: EpochUnit, tz: Tz) -> i64 {
    match unit {
        EpochUnit::Seconds => ts.timestamp(),
        EpochUnit::Millis => ts.timestamp_millis(),
        EpochUnit::Micros => ts.timestamp_micros(),
        EpochUnit::Days => to_day_index(ts, tz),
    }
}

/// Returns the day index (days since the Unix epoch) of `ts` as observed in
/// `tz`'s local calendar. Used by [`crate::session::ClientSession`] to
/// detect day rollover for end-of-day metrics reports.
pub fn to_day_index(ts: DateTime<Utc>, tz: Tz) -> i64 {
    let local = tz.from_utc_datetime(&ts.naive_utc());
    local.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp().div_euclid(86_400)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::New_York;

    #[test]
    fn round_trips_millis() {
        let ts = from_epoch(1_700_000_000_000, EpochUnit::Millis, Tz::UTC).unwrap();
        assert_eq!(to_epoch(ts, EpochUnit::Millis, Tz::UTC), 1_700_000_000_000);
    }

    #[test]
    fn day_index_follows_local_timezone() {
        // 2023-11-14T04:30:00Z is still 2023-11-13 in New York (UTC-5).
        let ts = from_epoch(1_699_936_200, EpochUnit::Seconds, Tz::UTC).unwrap();
        let utc_day = to_day_index(ts, Tz::UTC);
        let ny_day = to_day_index(ts, New_York);
        assert_eq!(utc_day - ny_day, 1);
    }

    #[test]
    fn from_epoch_rejects_out_of_range_values() {
        assert!(from_epoch(i64::MAX, EpochUnit::Days, Tz::UTC).is_none());
    }
}
