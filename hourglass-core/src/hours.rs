//! Hour-window planning.
//!
//! The ledger tracks ingestion at the granularity of UTC hour-starts. These
//! helpers compute which hour-starts a lookback window covers and how claimed
//! hours group into multi-hour report windows. Everything here is pure; the
//! callers own all I/O.

use chrono::{DateTime, Duration, Timelike, Utc};

/// Floor a timestamp to the start of its UTC hour.
pub fn floor_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .expect("zeroing sub-hour fields cannot overflow")
}

/// The ordered hour-starts covering `[floor(end) - (lookback_hours - 1)h .. floor(end)]`.
///
/// Oldest first, most-recent-last. A non-positive lookback yields an empty
/// plan rather than an error; callers that want to reject it do so up front.
pub fn required_hours(end: DateTime<Utc>, lookback_hours: i64) -> Vec<DateTime<Utc>> {
    if lookback_hours <= 0 {
        return Vec::new();
    }

    let newest = floor_to_hour(end);
    (0..lookback_hours)
        .rev()
        .map(|offset| newest - Duration::hours(offset))
        .collect()
}

/// Group sorted hour-starts into runs of consecutive hours, each at most
/// `max_len` long.
///
/// A burst report can only cover a contiguous span, so a gap in the input
/// always starts a new window. With `max_len` of 1 (burst disabled) every
/// hour becomes its own window.
pub fn contiguous_windows(hours: &[DateTime<Utc>], max_len: usize) -> Vec<Vec<DateTime<Utc>>> {
    let max_len = max_len.max(1);
    let mut windows: Vec<Vec<DateTime<Utc>>> = Vec::new();

    for &hour in hours {
        match windows.last_mut() {
            Some(window)
                if window.len() < max_len
                    && *window.last().expect("windows are never empty") + Duration::hours(1)
                        == hour =>
            {
                window.push(hour);
            }
            _ => windows.push(vec![hour]),
        }
    }

    windows
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, h, 0, 0).unwrap()
    }

    #[test]
    fn test_floor_to_hour_zeroes_subhour_fields() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 10, 14, 37, 22).unwrap()
            + Duration::microseconds(123_456);
        assert_eq!(floor_to_hour(ts), hour(14));
    }

    #[test]
    fn test_floor_to_hour_is_idempotent() {
        assert_eq!(floor_to_hour(hour(9)), hour(9));
    }

    #[test]
    fn test_required_hours_covers_window_oldest_first() {
        let end = Utc.with_ymd_and_hms(2024, 3, 10, 14, 45, 0).unwrap();
        let hours = required_hours(end, 3);
        assert_eq!(hours, vec![hour(12), hour(13), hour(14)]);
    }

    #[test]
    fn test_required_hours_single_hour() {
        let end = Utc.with_ymd_and_hms(2024, 3, 10, 14, 45, 0).unwrap();
        assert_eq!(required_hours(end, 1), vec![hour(14)]);
    }

    #[test]
    fn test_required_hours_crosses_day_boundary() {
        let end = Utc.with_ymd_and_hms(2024, 3, 10, 1, 30, 0).unwrap();
        let hours = required_hours(end, 4);
        assert_eq!(hours.len(), 4);
        assert_eq!(
            hours[0],
            Utc.with_ymd_and_hms(2024, 3, 9, 22, 0, 0).unwrap()
        );
        assert_eq!(hours[3], hour(1));
    }

    #[test]
    fn test_required_hours_non_positive_lookback_is_empty() {
        let end = Utc.with_ymd_and_hms(2024, 3, 10, 14, 0, 0).unwrap();
        assert!(required_hours(end, 0).is_empty());
        assert!(required_hours(end, -5).is_empty());
    }

    #[test]
    fn test_contiguous_windows_splits_on_gap() {
        let hours = vec![hour(1), hour(2), hour(4), hour(5), hour(6)];
        let windows = contiguous_windows(&hours, 10);
        assert_eq!(
            windows,
            vec![vec![hour(1), hour(2)], vec![hour(4), hour(5), hour(6)]]
        );
    }

    #[test]
    fn test_contiguous_windows_respects_max_len() {
        let hours = vec![hour(1), hour(2), hour(3), hour(4), hour(5)];
        let windows = contiguous_windows(&hours, 2);
        assert_eq!(
            windows,
            vec![
                vec![hour(1), hour(2)],
                vec![hour(3), hour(4)],
                vec![hour(5)]
            ]
        );
    }

    #[test]
    fn test_contiguous_windows_max_len_one_yields_singletons() {
        let hours = vec![hour(1), hour(2), hour(3)];
        let windows = contiguous_windows(&hours, 1);
        assert_eq!(windows.len(), 3);
        assert!(windows.iter().all(|w| w.len() == 1));
    }

    #[test]
    fn test_contiguous_windows_empty_input() {
        assert!(contiguous_windows(&[], 3).is_empty());
    }
}
