//! Per-invoker and per-call options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Options for [`Invoker`](super::Invoker) calls.
///
/// Deserializes from `{"timeout": <milliseconds>}`; zero or a negative
/// number disables the timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokeOptions {
    /// How long a call may stay unanswered. `Duration::ZERO` waits forever.
    #[serde(with = "millis")]
    pub timeout: Duration,
}

impl InvokeOptions {
    /// Options with the default 3000 ms timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Options with no timeout at all.
    pub fn no_timeout() -> Self {
        Self {
            timeout: Duration::ZERO,
        }
    }

    /// Zero or negative disables the timeout.
    pub fn from_millis(ms: i64) -> Self {
        Self {
            timeout: millis::to_duration(ms),
        }
    }

    /// Replace the timeout. `Duration::ZERO` disables it.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether calls made with these options can time out.
    #[inline]
    pub fn has_timeout(&self) -> bool {
        !self.timeout.is_zero()
    }
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn to_duration(ms: i64) -> Duration {
        u64::try_from(ms).map_or(Duration::ZERO, Duration::from_millis)
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        i64::deserialize(deserializer).map(to_duration)
    }
}
