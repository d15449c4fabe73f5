//! Shift times and the policy that turns configured times into the segments
//! entered for one row.

use crate::AutomationError;
use chrono::{NaiveTime, Timelike};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

static TIME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([01]\d|2[0-3]):[0-5]\d$").expect("valid time pattern"));

const LAST_MINUTE_OF_DAY: i64 = 23 * 60 + 59;

/// Strict `HH:MM`, 24-hour clock.
pub fn is_valid_time(value: &str) -> bool {
    TIME_PATTERN.is_match(value)
}

/// A wall-clock time of day with minute precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeValue(NaiveTime);

impl TimeValue {
    pub fn from_hm(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(Self)
    }

    pub fn minute_of_day(&self) -> i64 {
        i64::from(self.0.hour() * 60 + self.0.minute())
    }

    fn from_minute_of_day(minutes: i64) -> Self {
        let clamped = minutes.clamp(0, LAST_MINUTE_OF_DAY) as u32;
        Self(NaiveTime::from_hms_opt(clamped / 60, clamped % 60, 0).unwrap_or(NaiveTime::MIN))
    }

    /// Shifted by `minutes`, clamped to `00:00..=23:59`.
    pub fn offset_minutes(&self, minutes: i64) -> Self {
        Self::from_minute_of_day(self.minute_of_day() + minutes)
    }

    /// Zero-padded hour, as typed into the hours box.
    pub fn hours(&self) -> String {
        format!("{:02}", self.0.hour())
    }

    /// Zero-padded minute, as typed into the minutes box.
    pub fn minutes(&self) -> String {
        format!("{:02}", self.0.minute())
    }
}

impl FromStr for TimeValue {
    type Err = AutomationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if !is_valid_time(value) {
            return Err(AutomationError::InvalidArgument(format!(
                "'{value}' is not a valid HH:MM time"
            )));
        }
        NaiveTime::parse_from_str(value, "%H:%M")
            .map(Self)
            .map_err(|e| AutomationError::InvalidArgument(format!("'{value}': {e}")))
    }
}

impl TryFrom<String> for TimeValue {
    type Error = AutomationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeValue> for String {
    fn from(value: TimeValue) -> Self {
        value.to_string()
    }
}

impl fmt::Display for TimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hours(), self.minutes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakWindow {
    pub start: TimeValue,
    pub duration_minutes: u32,
}

/// One clock-in/clock-out pair entered for a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub clock_in: TimeValue,
    pub clock_out: TimeValue,
}

/// Validated run parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShiftSettings {
    pub clock_in: TimeValue,
    pub clock_out: TimeValue,
    /// `±n` minute jitter applied independently to clock-in and clock-out
    pub randomize_minutes: Option<u32>,
    pub break_window: Option<BreakWindow>,
}

impl ShiftSettings {
    pub fn new(clock_in: TimeValue, clock_out: TimeValue) -> Self {
        Self {
            clock_in,
            clock_out,
            randomize_minutes: None,
            break_window: None,
        }
    }

    pub fn with_randomize(mut self, minutes: u32) -> Self {
        self.randomize_minutes = Some(minutes);
        self
    }

    pub fn with_break(mut self, start: TimeValue, duration_minutes: u32) -> Self {
        self.break_window = Some(BreakWindow {
            start,
            duration_minutes,
        });
        self
    }

    fn shift_bounds<R: Rng + ?Sized>(&self, rng: &mut R) -> (TimeValue, TimeValue) {
        let spread = match self.randomize_minutes {
            Some(n) if n > 0 => i64::from(n),
            _ => return (self.clock_in, self.clock_out),
        };
        let clock_in = self.clock_in.offset_minutes(rng.gen_range(-spread..=spread));
        let clock_out = self.clock_out.offset_minutes(rng.gen_range(-spread..=spread));
        if clock_out > clock_in {
            (clock_in, clock_out)
        } else {
            (self.clock_in, self.clock_out)
        }
    }

    /// Segments to enter for one row, in order. Called once per row so each
    /// row draws its own jitter.
    pub fn plan<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<Segment> {
        let (clock_in, clock_out) = self.shift_bounds(rng);
        let whole = Segment {
            clock_in,
            clock_out,
        };

        let window = match self.break_window {
            Some(window) if window.duration_minutes > 0 => window,
            _ => return vec![whole],
        };

        if window.start <= clock_in || window.start >= clock_out {
            warn!(
                break_start = %window.start,
                %clock_in,
                %clock_out,
                "Break starts outside the shift; entering a single segment"
            );
            return vec![whole];
        }

        let mut segments = vec![Segment {
            clock_in,
            clock_out: window.start,
        }];
        let resumed = window
            .start
            .offset_minutes(i64::from(window.duration_minutes));
        if resumed < clock_out {
            segments.push(Segment {
                clock_in: resumed,
                clock_out,
            });
        }
        segments
    }
}
