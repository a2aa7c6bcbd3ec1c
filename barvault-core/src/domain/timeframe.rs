//! Bar timeframes, named the way the market-data API names them.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Interval covered by one bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Timeframe {
    #[default]
    Minute1,
    Minute5,
    Minute15,
    Minute30,
    Hour1,
    Day1,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown timeframe '{0}' (expected one of 1Min, 5Min, 15Min, 30Min, 1Hour, 1Day)")]
pub struct TimeframeError(pub String);

impl Timeframe {
    pub const ALL: [Timeframe; 6] = [
        Timeframe::Minute1,
        Timeframe::Minute5,
        Timeframe::Minute15,
        Timeframe::Minute30,
        Timeframe::Hour1,
        Timeframe::Day1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Minute1 => "1Min",
            Timeframe::Minute5 => "5Min",
            Timeframe::Minute15 => "15Min",
            Timeframe::Minute30 => "30Min",
            Timeframe::Hour1 => "1Hour",
            Timeframe::Day1 => "1Day",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Timeframe::Minute1 => Duration::minutes(1),
            Timeframe::Minute5 => Duration::minutes(5),
            Timeframe::Minute15 => Duration::minutes(15),
            Timeframe::Minute30 => Duration::minutes(30),
            Timeframe::Hour1 => Duration::hours(1),
            Timeframe::Day1 => Duration::days(1),
        }
    }

    /// Whether `ts` sits on a bar boundary for this timeframe.
    ///
    /// Daily bars are stamped at exchange-local midnight, which moves with
    /// daylight saving, so they are never rejected on alignment.
    pub fn is_aligned(&self, ts: DateTime<Utc>) -> bool {
        if ts.second() != 0 || ts.nanosecond() != 0 {
            return matches!(self, Timeframe::Day1);
        }
        match self {
            Timeframe::Minute1 => true,
            Timeframe::Minute5 => ts.minute() % 5 == 0,
            Timeframe::Minute15 => ts.minute() % 15 == 0,
            Timeframe::Minute30 => ts.minute() % 30 == 0,
            Timeframe::Hour1 => ts.minute() == 0,
            Timeframe::Day1 => true,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = TimeframeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::ALL
            .iter()
            .copied()
            .find(|tf| tf.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| TimeframeError(s.to_string()))
    }
}

impl Serialize for Timeframe {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Timeframe {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
