// =============================================================================
// Timeframe — bar interval parsing and conversion
// =============================================================================

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Unit letter of a timeframe string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeframeUnit {
    Minute,
    Hour,
    Day,
}

/// A bar interval such as `5m`, `1h` or `1d`: a unit letter with a positive
/// integer multiplier.
///
/// Two numeric views exist: milliseconds (live buffer timestamps) and a
/// "minutes" key used for canonical file naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeframe {
    pub value: u32,
    pub unit: TimeframeUnit,
}

impl Timeframe {
    /// Interval length in milliseconds.
    pub fn to_ms(&self) -> i64 {
        self.minutes() * 60 * 1000
    }

    /// Interval length in seconds (the on-disk timestamp unit).
    pub fn to_secs(&self) -> i64 {
        self.minutes() * 60
    }

    /// Interval length in whole minutes.
    pub fn minutes(&self) -> i64 {
        let value = self.value as i64;
        match self.unit {
            TimeframeUnit::Minute => value,
            TimeframeUnit::Hour => value * 60,
            TimeframeUnit::Day => value * 24 * 60,
        }
    }

    /// Numeric minutes key used in canonical file names (`5m` -> "5",
    /// `1h` -> "60", `1d` -> "1440").
    pub fn minutes_key(&self) -> String {
        self.minutes().to_string()
    }

    /// True for the one-minute timeframe, which gets a shorter default
    /// history window on cold start.
    pub fn is_one_minute(&self) -> bool {
        self.minutes() == 1
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() < 2 {
            bail!("timeframe too short: {s:?}");
        }
        let (value_str, unit_str) = s.split_at(s.len() - 1);
        let value: u32 = value_str
            .parse()
            .with_context(|| format!("invalid timeframe multiplier in {s:?}"))?;
        if value == 0 {
            bail!("timeframe multiplier must be positive: {s:?}");
        }
        let unit = match unit_str {
            "m" => TimeframeUnit::Minute,
            "h" => TimeframeUnit::Hour,
            "d" => TimeframeUnit::Day,
            other => bail!("unknown timeframe unit {other:?} in {s:?}"),
        };
        Ok(Self { value, unit })
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.unit {
            TimeframeUnit::Minute => "m",
            TimeframeUnit::Hour => "h",
            TimeframeUnit::Day => "d",
        };
        write!(f, "{}{}", self.value, unit)
    }
}
