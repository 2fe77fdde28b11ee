//! Units of time and timestamp normalisation.
//!
//! Every timestamp is stored in nanoseconds. Values arrive tagged with the unit
//! their producer used, or untagged, in which case the unit is guessed from the
//! magnitude of the value.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Largest timestamp the time-series engine accepts, in nanoseconds.
pub const MAX_TIMESTAMP_NS: u64 = 48 << 56;

/// Upper bounds used by [`guess_time_unit`]. Below `2 << 30` a value is read as
/// seconds, below `2 << 40` as milliseconds, below `2 << 51` as microseconds.
pub const SECONDS_BOUND: u64 = 2 << 30;
pub const MILLISECONDS_BOUND: u64 = 2 << 40;
pub const MICROSECONDS_BOUND: u64 = 2 << 51;

/// Unit a timestamp is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UnitOfTime {
    Seconds,
    Milliseconds,
    Microseconds,
    Nanoseconds,
}

impl UnitOfTime {
    /// Number of nanoseconds in one tick of this unit.
    pub fn nanos(self) -> u64 {
        match self {
            UnitOfTime::Seconds => 1_000_000_000,
            UnitOfTime::Milliseconds => 1_000_000,
            UnitOfTime::Microseconds => 1_000,
            UnitOfTime::Nanoseconds => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UnitOfTime::Seconds => "s",
            UnitOfTime::Milliseconds => "ms",
            UnitOfTime::Microseconds => "us",
            UnitOfTime::Nanoseconds => "ns",
        }
    }
}

impl fmt::Display for UnitOfTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitOfTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "s" => Ok(UnitOfTime::Seconds),
            "ms" => Ok(UnitOfTime::Milliseconds),
            "us" | "µs" => Ok(UnitOfTime::Microseconds),
            "ns" => Ok(UnitOfTime::Nanoseconds),
            other => Err(format!("unknown unit of time '{}'", other)),
        }
    }
}

impl Serialize for UnitOfTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for UnitOfTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Converts `time` from one unit to another.
///
/// Converting to a coarser unit truncates. Returns `None` when the result does
/// not fit in a `u64`.
pub fn convert_time(time: u64, from: UnitOfTime, to: UnitOfTime) -> Option<u64> {
    let (from_ns, to_ns) = (from.nanos(), to.nanos());
    if from_ns >= to_ns {
        time.checked_mul(from_ns / to_ns)
    } else {
        Some(time / (to_ns / from_ns))
    }
}

/// Converts `time` to nanoseconds.
pub fn to_nanoseconds(time: u64, unit: UnitOfTime) -> Option<u64> {
    convert_time(time, unit, UnitOfTime::Nanoseconds)
}

/// Guesses the unit of an untagged timestamp from its magnitude.
///
/// Present-day values in each of the four units land in their own band, and
/// stay there for the next decade or so.
pub fn guess_time_unit(time: u64) -> UnitOfTime {
    if time < SECONDS_BOUND {
        UnitOfTime::Seconds
    } else if time < MILLISECONDS_BOUND {
        UnitOfTime::Milliseconds
    } else if time < MICROSECONDS_BOUND {
        UnitOfTime::Microseconds
    } else {
        UnitOfTime::Nanoseconds
    }
}

/// Normalises an untagged timestamp to nanoseconds using [`guess_time_unit`].
pub fn guess_to_nanoseconds(time: u64) -> u64 {
    // A guessed unit never overflows: each band times its multiplier stays below u64::MAX.
    to_nanoseconds(time, guess_time_unit(time)).unwrap_or(u64::MAX)
}
