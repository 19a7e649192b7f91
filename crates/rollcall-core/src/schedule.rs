//! Timetable lookup: which activity is in session at a given minute.

use chrono::{NaiveTime, Timelike};
use std::fmt;
use thiserror::Error;

const TIME_FORMAT: &str = "%H:%M";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TimetableError {
    #[error("invalid interval {0:?}: expected \"HH:MM-HH:MM\"")]
    MalformedInterval(String),
    #[error("invalid time {0:?}: expected zero-padded 24-hour \"HH:MM\"")]
    MalformedTime(String),
    #[error("interval {0:?} ends before it starts (intervals cannot wrap past midnight)")]
    InvertedInterval(String),
}

/// Parse a zero-padded 24-hour "HH:MM" string.
pub fn parse_clock_time(s: &str) -> Result<NaiveTime, TimetableError> {
    // chrono accepts "9:30"; the timetable format does not.
    if s.len() != 5 {
        return Err(TimetableError::MalformedTime(s.to_string()));
    }
    NaiveTime::parse_from_str(s, TIME_FORMAT).map_err(|_| TimetableError::MalformedTime(s.to_string()))
}

/// Drop seconds and sub-seconds so lookups compare at minute resolution.
pub fn truncate_to_minute(t: NaiveTime) -> NaiveTime {
    NaiveTime::from_hms_opt(t.hour(), t.minute(), 0).unwrap_or(t)
}

/// One scheduled activity, both bounds inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimetableEntry {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub activity: String,
}

impl TimetableEntry {
    /// Parse a `"HH:MM-HH:MM"` key.
    pub fn parse(interval: &str, activity: impl Into<String>) -> Result<Self, TimetableError> {
        let (start, end) = interval
            .split_once('-')
            .ok_or_else(|| TimetableError::MalformedInterval(interval.to_string()))?;
        let start = parse_clock_time(start.trim())?;
        let end = parse_clock_time(end.trim())?;
        if start > end {
            return Err(TimetableError::InvertedInterval(interval.to_string()));
        }
        Ok(Self {
            start,
            end,
            activity: activity.into(),
        })
    }

    pub fn contains(&self, now: NaiveTime) -> bool {
        let now = truncate_to_minute(now);
        self.start <= now && now <= self.end
    }
}

impl fmt::Display for TimetableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{} {}",
            self.start.format(TIME_FORMAT),
            self.end.format(TIME_FORMAT),
            self.activity
        )
    }
}

/// Static interval table, ordered by start time.
///
/// Overlapping intervals resolve to the one that starts first; equal starts
/// keep their input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timetable {
    entries: Vec<TimetableEntry>,
}

impl Timetable {
    pub fn new(mut entries: Vec<TimetableEntry>) -> Self {
        entries.sort_by_key(|e| e.start);
        Self { entries }
    }

    /// Build from `("HH:MM-HH:MM", activity)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, TimetableError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let entries = pairs
            .into_iter()
            .map(|(interval, activity)| TimetableEntry::parse(interval.as_ref(), activity))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(entries))
    }

    /// Activity in session at `now`, or `None` when nothing is scheduled.
    pub fn lookup(&self, now: NaiveTime) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.contains(now))
            .map(|e| e.activity.as_str())
    }

    pub fn entries(&self) -> &[TimetableEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Timetable {
    fn default() -> Self {
        Self::from_pairs([
            ("09:00-10:00", "Software Construction"),
            ("10:00-11:00", "DBMS"),
            ("11:00-12:00", "AI"),
            ("13:00-14:00", "Web Development"),
            ("14:00-15:00", "Operating Systems"),
            ("22:00-23:59", "Testing Period"),
        ])
        .unwrap_or_else(|_| Self::new(Vec::new()))
    }
}

/// Source of the current wall-clock time.
pub trait Clock {
    fn now(&self) -> NaiveTime;
}

/// Local wall-clock time.
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> NaiveTime {
        chrono::Local::now().time()
    }
}

/// Clock pinned to a single instant.
#[cfg(test)]
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveTime);

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> NaiveTime {
        self.0
    }
}
