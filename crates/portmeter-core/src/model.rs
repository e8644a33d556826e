//! Data model for traffic streams and their persisted rollups
//!
//! A traffic *stream* is one (port, rule) pair. Each stream owns one
//! [`DailyRecord`] per calendar day and one [`MonthlyRecord`] per closed month.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// A monitored network port (the traffic-scoped entity)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Port(pub u16);

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Port {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let port: u16 = s
            .trim()
            .parse()
            .map_err(|_| Error::invalid_input(format!("Invalid port: '{}'", s)))?;
        if port == 0 {
            return Err(Error::invalid_input("Port 0 cannot be monitored"));
        }
        Ok(Port(port))
    }
}

/// Traffic direction of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Inbound traffic (matched on destination port)
    Input,
    /// Outbound traffic (matched on source port)
    Output,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Input => "input",
            Direction::Output => "output",
        }
    }
}

/// Transport protocol of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// A direction + protocol combination for which a counter is tracked
///
/// The textual form is `<direction>_<protocol>`, e.g. `input_tcp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Rule {
    pub direction: Direction,
    pub protocol: Protocol,
}

impl Rule {
    pub const fn new(direction: Direction, protocol: Protocol) -> Self {
        Self { direction, protocol }
    }

    /// Every direction × protocol combination
    pub fn all() -> Vec<Rule> {
        let mut rules = Vec::with_capacity(4);
        for direction in [Direction::Input, Direction::Output] {
            for protocol in [Protocol::Tcp, Protocol::Udp] {
                rules.push(Rule::new(direction, protocol));
            }
        }
        rules
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.direction.as_str(), self.protocol.as_str())
    }
}

impl FromStr for Rule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (direction, protocol) = s
            .trim()
            .split_once('_')
            .ok_or_else(|| Error::invalid_input(format!("Invalid rule: '{}'", s)))?;

        let direction = match direction.to_ascii_lowercase().as_str() {
            "input" => Direction::Input,
            "output" => Direction::Output,
            other => {
                return Err(Error::invalid_input(format!(
                    "Invalid rule direction '{}' in '{}'",
                    other, s
                )));
            }
        };
        let protocol = match protocol.to_ascii_lowercase().as_str() {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            other => {
                return Err(Error::invalid_input(format!(
                    "Invalid rule protocol '{}' in '{}'",
                    other, s
                )));
            }
        };

        Ok(Rule::new(direction, protocol))
    }
}

impl From<Rule> for String {
    fn from(rule: Rule) -> Self {
        rule.to_string()
    }
}

impl TryFrom<String> for Rule {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One traffic stream: a port observed through one rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamKey {
    pub port: Port,
    pub rule: Rule,
}

impl StreamKey {
    pub fn new(port: Port, rule: Rule) -> Self {
        Self { port, rule }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port {} {}", self.port, self.rule)
    }
}

/// A calendar month, written `YYYY-MM`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    /// Create a month, rejecting month numbers outside 1..=12
    pub fn new(year: i32, month: u32) -> crate::Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(Error::invalid_input(format!("Invalid month number: {}", month)));
        }
        Ok(Self { year, month })
    }

    /// The month a date falls in
    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }

    /// The month immediately before this one
    pub fn previous(&self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::invalid_input(format!("Invalid month '{}', expected YYYY-MM", s));
        let (year, month) = s.trim().split_once('-').ok_or_else(invalid)?;
        let year = year.parse().map_err(|_| invalid())?;
        let month = month.parse().map_err(|_| invalid())?;
        YearMonth::new(year, month)
    }
}

impl From<YearMonth> for String {
    fn from(month: YearMonth) -> Self {
        month.to_string()
    }
}

impl TryFrom<String> for YearMonth {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Per-day accumulated traffic for one stream
///
/// `base` is the raw counter seen when the day's record was created,
/// `accumulated` starts at `base` and only ever grows by reconciled deltas,
/// so `accumulated - base` is the day's net traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyRecord {
    pub port: Port,
    pub rule: Rule,
    pub date: NaiveDate,
    pub base: u64,
    pub accumulated: u64,
    pub last_raw: u64,
    pub last_update: DateTime<Utc>,
}

impl DailyRecord {
    /// Anchor a new day at the raw reading `raw`
    pub fn anchored(stream: StreamKey, date: NaiveDate, raw: u64, now: DateTime<Utc>) -> Self {
        Self {
            port: stream.port,
            rule: stream.rule,
            date,
            base: raw,
            accumulated: raw,
            last_raw: raw,
            last_update: now,
        }
    }

    pub fn stream(&self) -> StreamKey {
        StreamKey::new(self.port, self.rule)
    }

    /// The day's net traffic
    pub fn net(&self) -> u64 {
        self.accumulated.saturating_sub(self.base)
    }
}

/// Per-month total for one stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyRecord {
    pub port: Port,
    pub rule: Rule,
    pub month: YearMonth,
    pub total: u64,
    pub last_update: DateTime<Utc>,
}

impl MonthlyRecord {
    pub fn stream(&self) -> StreamKey {
        StreamKey::new(self.port, self.rule)
    }
}

/// One row of a month's summed daily net traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonthlyTotal {
    pub port: Port,
    pub rule: Rule,
    pub total: u64,
}
