//! Absolute timestamps with microsecond resolution and an injectable clock.
//!
//! Expiration times are stored as [`AbsoluteTime`], microseconds since the
//! Unix epoch. [`AbsoluteTime::FOREVER`] marks content that never expires.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A point in time, in microseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AbsoluteTime(u64);

impl AbsoluteTime {
    /// The epoch itself; every real expiration is after it.
    pub const ZERO: Self = Self(0);

    /// The end of time; content with this expiration never ages out.
    pub const FOREVER: Self = Self(u64::MAX);

    /// Wraps a raw microsecond count.
    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Raw microseconds since the epoch.
    #[must_use]
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Reads the system clock.
    #[must_use]
    pub fn now() -> Self {
        SystemClock.now()
    }

    /// Adds `delta`, clamping at [`AbsoluteTime::FOREVER`].
    #[must_use]
    pub fn saturating_add(self, delta: Duration) -> Self {
        let micros = u64::try_from(delta.as_micros()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(micros))
    }

    /// Subtracts `delta`, clamping at [`AbsoluteTime::ZERO`].
    #[must_use]
    pub fn saturating_sub(self, delta: Duration) -> Self {
        let micros = u64::try_from(delta.as_micros()).unwrap_or(u64::MAX);
        Self(self.0.saturating_sub(micros))
    }

    /// Whether this time lies strictly before `now`.
    #[must_use]
    pub fn is_before(self, now: Self) -> bool {
        self < now
    }
}

impl fmt::Display for AbsoluteTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::FOREVER {
            f.write_str("forever")
        } else {
            write!(f, "{}us", self.0)
        }
    }
}

/// Abstraction over the system clock for dependency injection.
///
/// Lets tests pin "now" when exercising expiration-driven selection.
pub trait ClockSource: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> AbsoluteTime;
}

/// Clock source that reads the real system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now(&self) -> AbsoluteTime {
        // Microsecond timestamps fit in u64 for the next half-million years.
        #[allow(clippy::cast_possible_truncation)]
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        AbsoluteTime(micros)
    }
}

/// Clock fixed at a single instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub AbsoluteTime);

impl ClockSource for FixedClock {
    fn now(&self) -> AbsoluteTime {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forever_is_after_everything() {
        assert!(AbsoluteTime::now() < AbsoluteTime::FOREVER);
        assert!(AbsoluteTime::ZERO < AbsoluteTime::now());
    }

    #[test]
    fn saturating_arithmetic_clamps() {
        let t = AbsoluteTime::from_micros(10);
        assert_eq!(t.saturating_sub(Duration::from_secs(1)), AbsoluteTime::ZERO);
        assert_eq!(
            AbsoluteTime::FOREVER.saturating_add(Duration::from_secs(1)),
            AbsoluteTime::FOREVER
        );
        assert_eq!(
            t.saturating_add(Duration::from_micros(5)),
            AbsoluteTime::from_micros(15)
        );
    }

    #[test]
    fn is_before_is_strict() {
        let t = AbsoluteTime::from_micros(100);
        assert!(t.is_before(AbsoluteTime::from_micros(101)));
        assert!(!t.is_before(t));
    }

    #[test]
    fn fixed_clock_returns_its_instant() {
        let clock = FixedClock(AbsoluteTime::from_micros(42));
        assert_eq!(clock.now().as_micros(), 42);
    }

    #[test]
    fn display_names_forever() {
        assert_eq!(AbsoluteTime::FOREVER.to_string(), "forever");
        assert_eq!(AbsoluteTime::from_micros(7).to_string(), "7us");
    }
}
