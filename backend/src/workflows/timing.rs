// Workflow Timing - Clock, wait durations and working-hours clamping

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Longest wait a step may ask for: five 365-day years
pub const MAX_WAIT_SECS: i64 = 5 * 365 * 24 * 60 * 60;

/// Source of "now" for the engine; injected so waits can be tested deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WaitUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl WaitUnit {
    /// Length of one unit in seconds
    pub fn seconds(self) -> i64 {
        match self {
            WaitUnit::Minutes => 60,
            WaitUnit::Hours => 60 * 60,
            WaitUnit::Days => 24 * 60 * 60,
            WaitUnit::Weeks => 7 * 24 * 60 * 60,
        }
    }

    pub fn duration(self, amount: u32) -> Duration {
        Duration::seconds(self.seconds() * i64::from(amount))
    }
}

/// Daily window in which time-constrained steps may run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkingHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub days: Vec<Weekday>,
}

impl WorkingHours {
    pub fn weekdays(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            start,
            end,
            days: vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
        }
    }

    pub fn is_well_formed(&self) -> bool {
        self.start < self.end && !self.days.is_empty()
    }

    /// Earliest instant at or after `at` that falls inside the window.
    ///
    /// Returns `at` unchanged when it is already inside, and also when the
    /// window is malformed (activation rejects those).
    pub fn clamp_forward(&self, at: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
        if !self.is_well_formed() {
            return at;
        }
        let local = at.with_timezone(&offset).naive_local();

        for day_offset in 0..=7 {
            let date = local.date() + Duration::days(day_offset);
            if !self.days.contains(&date.weekday()) {
                continue;
            }
            let opens = date.and_time(self.start);
            let closes = date.and_time(self.end);
            if day_offset == 0 {
                if local < opens {
                    return local_to_utc(opens, offset);
                }
                if local < closes {
                    return at;
                }
                continue;
            }
            return local_to_utc(opens, offset);
        }
        at
    }
}

fn local_to_utc(local: NaiveDateTime, offset: FixedOffset) -> DateTime<Utc> {
    let utc = local - Duration::seconds(i64::from(offset.local_minus_utc()));
    DateTime::<Utc>::from_naive_utc_and_offset(utc, Utc)
}

/// Parse a workflow timezone setting: `UTC`, `Z`, or a fixed offset like `+05:30`.
///
/// Named zones such as `America/New_York` are not accepted. A fixed offset
/// does not follow daylight-saving changes, so working-hours windows and
/// date-trigger run times shift by the DST delta for part of the year.
pub fn parse_timezone(value: &str) -> Option<FixedOffset> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("utc") || value == "Z" {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match value.chars().next()? {
        '+' => (1, &value[1..]),
        '-' => (-1, &value[1..]),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 14 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}
