/// timeframe.rs — Symbolic bar durations
///
/// A timeframe is the canonical bar length ("1m", "1h", "1d", ...) used to
/// key stored series and to align fetch windows. Internally everything is
/// millisecond arithmetic on `duration_ms()`.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::QuotesError;

const MS_PER_SEC: i64 = 1_000;
const MS_PER_MIN: i64 = 60 * MS_PER_SEC;
const MS_PER_HOUR: i64 = 60 * MS_PER_MIN;
const MS_PER_DAY: i64 = 24 * MS_PER_HOUR;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeframe {
    S1,
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H8,
    H12,
    D1,
    D3,
    W1,
    /// Calendar month, fixed at 30 days for alignment purposes.
    Mn1,
}

impl Timeframe {
    /// Canonical duration of one bar in milliseconds.
    pub fn duration_ms(self) -> i64 {
        match self {
            Timeframe::S1 => MS_PER_SEC,
            Timeframe::M1 => MS_PER_MIN,
            Timeframe::M3 => 3 * MS_PER_MIN,
            Timeframe::M5 => 5 * MS_PER_MIN,
            Timeframe::M15 => 15 * MS_PER_MIN,
            Timeframe::M30 => 30 * MS_PER_MIN,
            Timeframe::H1 => MS_PER_HOUR,
            Timeframe::H2 => 2 * MS_PER_HOUR,
            Timeframe::H4 => 4 * MS_PER_HOUR,
            Timeframe::H6 => 6 * MS_PER_HOUR,
            Timeframe::H8 => 8 * MS_PER_HOUR,
            Timeframe::H12 => 12 * MS_PER_HOUR,
            Timeframe::D1 => MS_PER_DAY,
            Timeframe::D3 => 3 * MS_PER_DAY,
            Timeframe::W1 => 7 * MS_PER_DAY,
            Timeframe::Mn1 => 30 * MS_PER_DAY,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::S1 => "1s",
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::H6 => "6h",
            Timeframe::H8 => "8h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1d",
            Timeframe::D3 => "3d",
            Timeframe::W1 => "1w",
            Timeframe::Mn1 => "1M",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = QuotesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tf = match s {
            "1s" => Timeframe::S1,
            "1m" => Timeframe::M1,
            "3m" => Timeframe::M3,
            "5m" => Timeframe::M5,
            "15m" => Timeframe::M15,
            "30m" => Timeframe::M30,
            "1h" => Timeframe::H1,
            "2h" => Timeframe::H2,
            "4h" => Timeframe::H4,
            "6h" => Timeframe::H6,
            "8h" => Timeframe::H8,
            "12h" => Timeframe::H12,
            "1d" => Timeframe::D1,
            "3d" => Timeframe::D3,
            "1w" => Timeframe::W1,
            "1M" => Timeframe::Mn1,
            other => return Err(QuotesError::BadTimeframe(other.to_owned())),
        };
        Ok(tf)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        for s in ["1s", "1m", "5m", "1h", "4h", "1d", "1w", "1M"] {
            let tf: Timeframe = s.parse().unwrap();
            assert_eq!(tf.to_string(), s);
        }
    }

    #[test]
    fn durations() {
        assert_eq!(Timeframe::M1.duration_ms(), 60_000);
        assert_eq!(Timeframe::H1.duration_ms(), 3_600_000);
        assert_eq!(Timeframe::D1.duration_ms(), 86_400_000);
        assert_eq!(Timeframe::Mn1.duration_ms(), 30 * 86_400_000);
    }

    #[test]
    fn unknown_timeframe_is_rejected() {
        assert!("7m".parse::<Timeframe>().is_err());
        assert!("".parse::<Timeframe>().is_err());
    }
}
