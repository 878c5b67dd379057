use chrono::{DateTime, Datelike, Duration, Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::AdvisoryError;

/// How far back price history is requested for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Period {
    Days(u32),
    Weeks(u32),
    Months(u32),
    Years(u32),
    YearToDate,
    Max,
}

impl Default for Period {
    fn default() -> Self {
        Period::Months(6)
    }
}

impl Period {
    /// First instant covered by this period when looking back from `now`.
    pub fn start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Period::Days(n) => now - Duration::days(n as i64),
            Period::Weeks(n) => now - Duration::weeks(n as i64),
            Period::Months(n) => now.checked_sub_months(Months::new(n)).unwrap_or_default(),
            Period::Years(n) => now
                .checked_sub_months(Months::new(n.saturating_mul(12)))
                .unwrap_or_default(),
            Period::YearToDate => Utc
                .with_ymd_and_hms(now.year(), 1, 1, 0, 0, 0)
                .single()
                .unwrap_or(now),
            Period::Max => DateTime::<Utc>::default(),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::Days(n) => write!(f, "{n}d"),
            Period::Weeks(n) => write!(f, "{n}wk"),
            Period::Months(n) => write!(f, "{n}mo"),
            Period::Years(n) => write!(f, "{n}y"),
            Period::YearToDate => f.write_str("ytd"),
            Period::Max => f.write_str("max"),
        }
    }
}

impl FromStr for Period {
    type Err = AdvisoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "ytd" => return Ok(Period::YearToDate),
            "max" => return Ok(Period::Max),
            _ => {}
        }

        let (count, unit) = split_count(&s, &["mo", "wk", "d", "y"])
            .ok_or_else(|| AdvisoryError::InvalidInput(format!("invalid period '{s}'")))?;

        Ok(match unit {
            "d" => Period::Days(count),
            "wk" => Period::Weeks(count),
            "mo" => Period::Months(count),
            _ => Period::Years(count),
        })
    }
}

impl TryFrom<String> for Period {
    type Error = AdvisoryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Period> for String {
    fn from(value: Period) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntervalUnit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl IntervalUnit {
    fn suffix(&self) -> &'static str {
        match self {
            IntervalUnit::Minute => "m",
            IntervalUnit::Hour => "h",
            IntervalUnit::Day => "d",
            IntervalUnit::Week => "wk",
            IntervalUnit::Month => "mo",
        }
    }

    /// Timespan keyword used by aggregate bar APIs.
    pub fn timespan(&self) -> &'static str {
        match self {
            IntervalUnit::Minute => "minute",
            IntervalUnit::Hour => "hour",
            IntervalUnit::Day => "day",
            IntervalUnit::Week => "week",
            IntervalUnit::Month => "month",
        }
    }
}

/// Width of a single bar, e.g. `1d` or `15m`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Interval {
    pub multiplier: u32,
    pub unit: IntervalUnit,
}

impl Default for Interval {
    fn default() -> Self {
        Interval {
            multiplier: 1,
            unit: IntervalUnit::Day,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.multiplier, self.unit.suffix())
    }
}

impl FromStr for Interval {
    type Err = AdvisoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        let (multiplier, unit) = split_count(&s, &["mo", "wk", "m", "h", "d"])
            .ok_or_else(|| AdvisoryError::InvalidInput(format!("invalid interval '{s}'")))?;

        let unit = match unit {
            "m" => IntervalUnit::Minute,
            "h" => IntervalUnit::Hour,
            "d" => IntervalUnit::Day,
            "wk" => IntervalUnit::Week,
            _ => IntervalUnit::Month,
        };
        Ok(Interval { multiplier, unit })
    }
}

impl TryFrom<String> for Interval {
    type Error = AdvisoryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Interval> for String {
    fn from(value: Interval) -> Self {
        value.to_string()
    }
}

/// Splits "12mo" into (12, "mo"). Suffixes are tried in order, so longer
/// suffixes sharing a prefix must come first.
fn split_count<'a>(s: &str, suffixes: &[&'a str]) -> Option<(u32, &'a str)> {
    for suffix in suffixes {
        if let Some(number) = s.strip_suffix(suffix) {
            if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            let count: u32 = number.parse().ok()?;
            if count == 0 {
                return None;
            }
            return Some((count, suffix));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_period() {
        assert_eq!("6mo".parse::<Period>().unwrap(), Period::Months(6));
        assert_eq!("5d".parse::<Period>().unwrap(), Period::Days(5));
        assert_eq!("2wk".parse::<Period>().unwrap(), Period::Weeks(2));
        assert_eq!("1Y".parse::<Period>().unwrap(), Period::Years(1));
        assert_eq!("ytd".parse::<Period>().unwrap(), Period::YearToDate);
        assert_eq!("max".parse::<Period>().unwrap(), Period::Max);
        assert!("0d".parse::<Period>().is_err());
        assert!("mo".parse::<Period>().is_err());
        assert!("6x".parse::<Period>().is_err());
    }

    #[test]
    fn test_parse_interval_prefers_month_over_minute() {
        let month: Interval = "1mo".parse().unwrap();
        assert_eq!(month.unit, IntervalUnit::Month);

        let minutes: Interval = "15m".parse().unwrap();
        assert_eq!(minutes.multiplier, 15);
        assert_eq!(minutes.unit, IntervalUnit::Minute);
        assert_eq!(minutes.unit.timespan(), "minute");
    }

    #[test]
    fn test_display_matches_parse_input() {
        for text in ["6mo", "1y", "ytd", "3d"] {
            assert_eq!(text.parse::<Period>().unwrap().to_string(), text);
        }
        for text in ["1d", "4h", "1wk"] {
            assert_eq!(text.parse::<Interval>().unwrap().to_string(), text);
        }
    }

    #[test]
    fn test_period_start() {
        let now = Utc.with_ymd_and_hms(2024, 8, 15, 12, 0, 0).unwrap();
        assert_eq!(
            Period::Months(6).start(now),
            Utc.with_ymd_and_hms(2024, 2, 15, 12, 0, 0).unwrap()
        );
        assert_eq!(
            Period::YearToDate.start(now),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(Period::Days(10).start(now), now - Duration::days(10));
    }

    #[test]
    fn test_serde_uses_string_form() {
        let json = serde_json::to_string(&Period::Months(6)).unwrap();
        assert_eq!(json, "\"6mo\"");
        let interval: Interval = serde_json::from_str("\"1h\"").unwrap();
        assert_eq!(interval.unit, IntervalUnit::Hour);
    }
}
