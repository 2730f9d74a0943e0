//! Time Utilities Module
//!
//! Conversions between the `{seconds, nanos}` wire timestamp used by invalidation
//! messages and the nanosecond versions stored in the cache index. Database commit
//! timestamps and invalidation timestamps must land on the same nanosecond epoch
//! for version comparison to be meaningful.

use crate::cache_types::Version;
use crate::{ProxyError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const NANOS_PER_SECOND: u64 = 1_000_000_000;
const NANOS_PER_MILLI: u64 = 1_000_000;
const MILLIS_PER_SECOND: u64 = 1_000;

/// Wire timestamp: whole seconds since the epoch plus a nanosecond remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    #[serde(default)]
    pub nanos: i32,
}

fn check_timestamp(ts: &Timestamp) -> Result<(u64, u64)> {
    if ts.seconds < 0 {
        return Err(ProxyError::InvalidRequest(format!(
            "Timestamp seconds must not be negative: {}",
            ts.seconds
        )));
    }
    if ts.nanos < 0 || ts.nanos as u64 >= NANOS_PER_SECOND {
        return Err(ProxyError::InvalidRequest(format!(
            "Timestamp nanos out of range: {}",
            ts.nanos
        )));
    }
    Ok((ts.seconds as u64, ts.nanos as u64))
}

/// `seconds * 1e9 + nanos`, rejecting negative fields and overflow.
pub fn timestamp_to_nanos(ts: &Timestamp) -> Result<Version> {
    let (seconds, nanos) = check_timestamp(ts)?;
    seconds
        .checked_mul(NANOS_PER_SECOND)
        .and_then(|n| n.checked_add(nanos))
        .ok_or_else(|| {
            ProxyError::InvalidRequest(format!("Timestamp overflows nanoseconds: {:?}", ts))
        })
}

pub fn timestamp_to_millis(ts: &Timestamp) -> Result<u64> {
    let (seconds, nanos) = check_timestamp(ts)?;
    seconds
        .checked_mul(MILLIS_PER_SECOND)
        .and_then(|m| m.checked_add(nanos / NANOS_PER_MILLI))
        .ok_or_else(|| {
            ProxyError::InvalidRequest(format!("Timestamp overflows milliseconds: {:?}", ts))
        })
}

pub fn nanos_to_timestamp(nanos: Version) -> Timestamp {
    Timestamp {
        seconds: (nanos / NANOS_PER_SECOND) as i64,
        nanos: (nanos % NANOS_PER_SECOND) as i32,
    }
}

pub fn millis_to_timestamp(millis: u64) -> Timestamp {
    Timestamp {
        seconds: (millis / MILLIS_PER_SECOND) as i64,
        nanos: ((millis % MILLIS_PER_SECOND) * NANOS_PER_MILLI) as i32,
    }
}

/// Converts a database commit time to a version on the invalidation epoch.
pub fn datetime_to_nanos(time: &DateTime<Utc>) -> Result<Version> {
    timestamp_to_nanos(&Timestamp {
        seconds: time.timestamp(),
        nanos: time.timestamp_subsec_nanos() as i32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_timestamp_to_nanos() {
        let ts = Timestamp {
            seconds: 1_700_000_000,
            nanos: 123_456_789,
        };
        assert_eq!(timestamp_to_nanos(&ts).unwrap(), 1_700_000_000_123_456_789);
    }

    #[test]
    fn test_timestamp_to_millis() {
        let ts = Timestamp {
            seconds: 12,
            nanos: 345_000_000,
        };
        assert_eq!(timestamp_to_millis(&ts).unwrap(), 12_345);
    }

    #[test]
    fn test_millis_to_timestamp() {
        let ts = millis_to_timestamp(1_700_000_000_123);
        assert_eq!(ts.seconds, 1_700_000_000);
        assert_eq!(ts.nanos, 123_000_000);
    }

    #[test]
    fn test_negative_fields_rejected() {
        assert!(timestamp_to_nanos(&Timestamp { seconds: -1, nanos: 0 }).is_err());
        assert!(timestamp_to_nanos(&Timestamp { seconds: 1, nanos: -5 }).is_err());
        assert!(timestamp_to_nanos(&Timestamp {
            seconds: 1,
            nanos: 1_000_000_000
        })
        .is_err());
    }

    #[test]
    fn test_overflow_rejected() {
        let ts = Timestamp {
            seconds: i64::MAX,
            nanos: 0,
        };
        assert!(timestamp_to_nanos(&ts).is_err());
    }

    #[test]
    fn test_datetime_to_nanos() {
        let time = Utc.timestamp_opt(1_600_000_000, 42).unwrap();
        assert_eq!(datetime_to_nanos(&time).unwrap(), 1_600_000_000_000_000_042);
    }

    #[test]
    fn test_wire_format_nanos_defaults_to_zero() {
        let ts: Timestamp = serde_json::from_str(r#"{"seconds": 5}"#).unwrap();
        assert_eq!(timestamp_to_nanos(&ts).unwrap(), 5 * NANOS_PER_SECOND);
    }

    #[quickcheck]
    fn prop_nanos_timestamp_conversion_is_lossless(nanos: u64) -> bool {
        // Keep within i64 seconds range
        let nanos = nanos >> 1;
        timestamp_to_nanos(&nanos_to_timestamp(nanos)).ok() == Some(nanos)
    }
}
