use std::fmt::{self, Display};
use std::str::FromStr;

use jiff::{civil::Date, Zoned};
use thiserror::Error;

/// Date format accepted on the command line and passed to the stage tools.
pub const DATE_FORMAT: &str = "%Y/%m/%d";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum InputError {
    #[error("Not a valid date or valid date format: {0}")]
    InvalidDate(String),
    #[error("Not a valid hour format: {0}")]
    InvalidHour(String),
    #[error("Start day {start} is after end day {end}")]
    StartAfterEnd { start: String, end: String },
}

/// Parse a `YYYY/MM/DD` string into a calendar date.  Impossible dates such
/// as `2018/02/30` are rejected.
pub fn parse_date(s: &str) -> Result<Date, InputError> {
    if s.matches('/').count() != 2 {
        return Err(InputError::InvalidDate(s.to_string()));
    }
    Date::strptime(DATE_FORMAT, s).map_err(|_| InputError::InvalidDate(s.to_string()))
}

/// Hour of the processing run, stored in the 1..=24 convention used by the
/// station network (hour 24 is midnight at the end of the day).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Hour(u8);

impl Hour {
    pub fn new(hour: u8) -> Result<Hour, InputError> {
        if (1..=24).contains(&hour) {
            Ok(Hour(hour))
        } else {
            Err(InputError::InvalidHour(hour.to_string()))
        }
    }

    /// The hour following the given system hour (0..=23).
    pub fn after_system_hour(system_hour: i8) -> Hour {
        Hour((system_hour.clamp(0, 23) + 1) as u8)
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    /// Hour used in file names, 0..=23.  Hour 24 wraps to 00.
    pub fn zero_based(&self) -> u8 {
        self.0 % 24
    }
}

impl FromStr for Hour {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hour = s
            .trim()
            .parse::<u8>()
            .map_err(|_| InputError::InvalidHour(s.to_string()))?;
        Hour::new(hour).map_err(|_| InputError::InvalidHour(s.to_string()))
    }
}

impl Display for Hour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: Date,
    pub end: Date,
    pub hour: Hour,
}

impl TimeWindow {
    pub fn new(start: Date, end: Date, hour: Hour) -> Result<TimeWindow, InputError> {
        if start > end {
            return Err(InputError::StartAfterEnd {
                start: start.strftime(DATE_FORMAT).to_string(),
                end: end.strftime(DATE_FORMAT).to_string(),
            });
        }
        Ok(TimeWindow { start, end, hour })
    }

    /// Build the window from optional command line values.  Missing values
    /// default to yesterday, today and the hour after the current one, all
    /// relative to `now`.
    pub fn resolve(
        start: Option<Date>,
        end: Option<Date>,
        hour: Option<Hour>,
        now: &Zoned,
    ) -> Result<TimeWindow, InputError> {
        let today = now.date();
        let start = match start {
            Some(d) => d,
            None => today
                .yesterday()
                .map_err(|_| InputError::InvalidDate(today.to_string()))?,
        };
        let end = end.unwrap_or(today);
        let hour = hour.unwrap_or_else(|| Hour::after_system_hour(now.hour()));
        TimeWindow::new(start, end, hour)
    }

    pub fn start_str(&self) -> String {
        self.start.strftime(DATE_FORMAT).to_string()
    }

    pub fn end_str(&self) -> String {
        self.end.strftime(DATE_FORMAT).to_string()
    }

    /// End day digits followed by the two-digit zero-based hour, e.g.
    /// `2019010200`.
    pub fn time_marker(&self) -> String {
        format!(
            "{}{:02}",
            self.end.strftime("%Y%m%d"),
            self.hour.zero_based()
        )
    }
}
