//! 12/24-hour start-time conversion

use chrono::{NaiveTime, Timelike};

/// Parse a start time in either clock format
///
/// Accepts `17:30`, `05:00`, `5:00 PM`, `5:00pm`, `5:00P`, `17:30:00`.
pub fn parse_time(value: &str) -> Option<NaiveTime> {
    let cleaned = value.trim();
    let upper = cleaned.to_ascii_uppercase();

    let (clock, meridiem) = if let Some(rest) = upper.strip_suffix("AM") {
        (rest, Some(false))
    } else if let Some(rest) = upper.strip_suffix("PM") {
        (rest, Some(true))
    } else if let Some(rest) = upper.strip_suffix('A') {
        (rest, Some(false))
    } else if let Some(rest) = upper.strip_suffix('P') {
        (rest, Some(true))
    } else {
        (upper.as_str(), None)
    };

    let mut parts = clock.trim().split(':');
    let mut hour: u32 = parts.next()?.trim().parse().ok()?;
    let minute: u32 = match parts.next() {
        Some(m) => m.trim().parse().ok()?,
        None => 0,
    };
    let second: u32 = match parts.next() {
        Some(s) => s.trim().parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() {
        return None;
    }

    if let Some(pm) = meridiem {
        if !(1..=12).contains(&hour) {
            return None;
        }
        hour = match (hour, pm) {
            (12, false) => 0,
            (12, true) => 12,
            (h, true) => h + 12,
            (h, false) => h,
        };
    }

    NaiveTime::from_hms_opt(hour, minute, second)
}

/// Render a time for a system using the given clock
///
/// 12-hour output is `5:00 PM`, 24-hour output is `17:00`.
pub fn format_time(time: NaiveTime, use_12h: bool) -> String {
    if use_12h {
        time.format("%-I:%M %p").to_string()
    } else {
        time.format("%H:%M").to_string()
    }
}

/// Convert a start-time value to the system's clock format
///
/// Returns `None` when the value is not a recognisable time.
pub fn convert(value: &str, use_12h: bool) -> Option<String> {
    parse_time(value).map(|t| format_time(t, use_12h))
}

/// Minutes since midnight
pub fn minutes_of_day(value: &str) -> Option<u32> {
    parse_time(value).map(|t| t.hour() * 60 + t.minute())
}
