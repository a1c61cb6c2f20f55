use serde::{Deserialize, Serialize};

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// A point in time with nanosecond precision. `nanos` is always in `0..1e9`, so the derived
/// ordering (seconds first) is chronological.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    /// Builds a timestamp, carrying out-of-range nanoseconds into seconds.
    pub fn new(seconds: i64, nanos: i32) -> Self {
        let nanos = i64::from(nanos);
        Self {
            seconds: seconds + nanos.div_euclid(NANOS_PER_SECOND),
            nanos: nanos.rem_euclid(NANOS_PER_SECOND) as i32,
        }
    }

    pub fn now() -> Self {
        let now = chrono::Utc::now();
        Self::new(now.timestamp(), now.timestamp_subsec_nanos() as i32)
    }

    pub fn from_millis(millis: i64) -> Self {
        Self::new(millis.div_euclid(1_000), (millis.rem_euclid(1_000) * 1_000_000) as i32)
    }

    pub fn to_micros(&self) -> i64 {
        self.seconds * 1_000_000 + i64::from(self.nanos / 1_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carries_nanoseconds() {
        assert_eq!(Timestamp::new(1, 1_500_000_000), Timestamp { seconds: 2, nanos: 500_000_000 });
        assert_eq!(Timestamp::new(1, -1), Timestamp { seconds: 0, nanos: 999_999_999 });
        assert!(Timestamp::new(0, 999_999_999) < Timestamp::new(1, 0));
    }

    #[test]
    fn millis_and_micros() {
        let timestamp = Timestamp::from_millis(-1_500);
        assert_eq!(timestamp, Timestamp::new(-2, 500_000_000));
        assert_eq!(timestamp.to_micros(), -1_500_000);
    }
}
