//! Durations in wire form.

use serde::{Deserialize, Serialize};

/// A duration as carried in remote execution messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct ProtoDuration {
    /// Whole seconds
    pub seconds: i64,
    /// Sub-second nanoseconds
    pub nanos: i32,
}

impl ProtoDuration {
    /// Create a new duration
    #[must_use]
    pub const fn new(seconds: i64, nanos: i32) -> Self {
        Self { seconds, nanos }
    }

    /// Duration from whole seconds
    #[must_use]
    pub const fn from_secs(seconds: i64) -> Self {
        Self { seconds, nanos: 0 }
    }

    /// Whole-second wire form of a std duration; sub-second precision is dropped
    #[must_use]
    pub fn from_std_secs(duration: std::time::Duration) -> Self {
        Self::from_secs(i64::try_from(duration.as_secs()).unwrap_or(i64::MAX))
    }

    /// Check for zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.seconds == 0 && self.nanos == 0
    }

    /// Convert to a std duration, clamping negatives to zero
    #[must_use]
    pub fn to_std(&self) -> std::time::Duration {
        let seconds = u64::try_from(self.seconds).unwrap_or(0);
        let nanos = u32::try_from(self.nanos).unwrap_or(0);
        std::time::Duration::new(seconds, nanos)
    }
}

impl std::fmt::Display for ProtoDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:09}s", self.seconds, self.nanos)
    }
}
