//! Capture timestamps

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Capture time of a sample, measured from the source clock's epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Stamp(Duration);

impl Stamp {
    pub const ZERO: Stamp = Stamp(Duration::ZERO);

    pub fn new(since_epoch: Duration) -> Self {
        Self(since_epoch)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Duration::try_from_secs_f64(secs).map(Self).unwrap_or(Self::ZERO)
    }

    pub fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0.as_secs_f64()
    }

    /// Absolute distance between two stamps
    pub fn abs_diff(&self, other: Stamp) -> Duration {
        if self.0 >= other.0 {
            self.0 - other.0
        } else {
            other.0 - self.0
        }
    }
}

impl From<Duration> for Stamp {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abs_diff_is_symmetric() {
        let a = Stamp::from_millis(100);
        let b = Stamp::from_millis(130);
        assert_eq!(a.abs_diff(b), Duration::from_millis(30));
        assert_eq!(b.abs_diff(a), Duration::from_millis(30));
        assert_eq!(a.abs_diff(a), Duration::ZERO);
    }

    #[test]
    fn test_from_secs_rejects_garbage() {
        assert_eq!(Stamp::from_secs_f64(f64::NAN), Stamp::ZERO);
        assert_eq!(Stamp::from_secs_f64(-1.0), Stamp::ZERO);
        assert!((Stamp::from_secs_f64(1.5).as_secs_f64() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_ordering() {
        assert!(Stamp::from_millis(1) < Stamp::from_millis(2));
    }
}
