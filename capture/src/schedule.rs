//! Daily capture window
//!
//! A window is a wall-clock range `[start, end)` that recurs every day. When
//! `start > end` the window wraps past midnight (17:00-09:00 covers the night).

use chrono::{Local, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

/// Current wall-clock time source
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveTime;
}

/// Local system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveTime {
        Local::now().time()
    }
}

/// True if `enabled` is false, or `now` is within `[start, end)`.
///
/// An enabled window with `start == end` is empty.
pub fn in_schedule_window(enabled: bool, start: NaiveTime, end: NaiveTime, now: NaiveTime) -> bool {
    if !enabled {
        return true;
    }
    if start > end {
        now >= start || now < end
    } else {
        start <= now && now < end
    }
}

/// Same check over "HH:MM" strings. Unparseable times leave capture enabled.
pub fn in_schedule_window_str(enabled: bool, start: &str, end: &str, now: NaiveTime) -> bool {
    if !enabled {
        return true;
    }
    match (parse_hhmm(start), parse_hhmm(end)) {
        (Some(start), Some(end)) => in_schedule_window(true, start, end, now),
        _ => {
            tracing::warn!(
                "Invalid schedule window '{}'-'{}', capturing regardless",
                start,
                end
            );
            true
        }
    }
}

pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    let (h, m) = s.trim().split_once(':')?;
    NaiveTime::from_hms_opt(h.parse().ok()?, m.parse().ok()?, 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleWindow {
    pub enabled: bool,
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl Default for ScheduleWindow {
    fn default() -> Self {
        Self {
            enabled: false,
            start: NaiveTime::from_hms_opt(17, 0, 0).unwrap_or(NaiveTime::MIN),
            end: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

impl ScheduleWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            enabled: true,
            start,
            end,
        }
    }

    pub fn always() -> Self {
        Self::default()
    }

    pub fn contains(&self, now: NaiveTime) -> bool {
        in_schedule_window(self.enabled, self.start, self.end, now)
    }
}

impl std::fmt::Display for ScheduleWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.enabled {
            write!(
                f,
                "{:02}:{:02}-{:02}:{:02}",
                self.start.hour(),
                self.start.minute(),
                self.end.hour(),
                self.end.minute()
            )
        } else {
            f.write_str("always")
        }
    }
}

mod hhmm {
    use chrono::{NaiveTime, Timelike};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{:02}:{:02}", t.hour(), t.minute()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let s = String::deserialize(d)?;
        super::parse_hhmm(&s).ok_or_else(|| de::Error::custom(format!("invalid HH:MM time '{}'", s)))
    }
}
