//! Entity classifier
//!
//! Maps a raw entity identifier to the [`FunctionalKey`] naming what the
//! control does, independent of device-specific naming. The rules are an
//! ordered table tried against the domain-stripped, lower-cased tail; the
//! first match wins. Tails no rule matches are returned unchanged.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// What a control does, e.g. `zone_3`, `schedule_start_time_1`, `start_stop`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionalKey(String);

impl FunctionalKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split `zone_N<rest>` into `(N, rest)`
    fn zone_parts(&self) -> Option<(u32, &str)> {
        let tail = self.0.strip_prefix("zone_")?;
        let digits = tail.find(|c: char| !c.is_ascii_digit()).unwrap_or(tail.len());
        if digits == 0 {
            return None;
        }
        let n = tail[..digits].parse().ok()?;
        Some((n, &tail[digits..]))
    }

    /// Zone number for any `zone_N*` key
    pub fn zone_index(&self) -> Option<u32> {
        self.zone_parts().map(|(n, _)| n)
    }

    /// `zone_N`: the zone's on/off control
    pub fn is_zone(&self) -> bool {
        matches!(self.zone_parts(), Some((_, "")))
    }

    /// `zone_N_duration`
    pub fn is_zone_duration(&self) -> bool {
        matches!(self.zone_parts(), Some((_, "_duration")))
    }

    /// `zone_N_enable`
    pub fn is_zone_enable(&self) -> bool {
        matches!(self.zone_parts(), Some((_, "_enable")))
    }

    /// `zone_N_mode`
    pub fn is_zone_mode(&self) -> bool {
        matches!(self.zone_parts(), Some((_, "_mode")))
    }

    /// `schedule_start_time_N`
    pub fn is_start_time(&self) -> bool {
        self.0
            .strip_prefix("schedule_start_time_")
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
    }

    /// `schedule_<weekday>`
    pub fn is_day_schedule(&self) -> bool {
        self.0
            .strip_prefix("schedule_")
            .is_some_and(|day| WEEKDAYS.contains(&day))
    }
}

impl fmt::Display for FunctionalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for FunctionalKey {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for FunctionalKey {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Canonical keys the broker itself reacts to
pub mod keys {
    pub const START_STOP: &str = "start_stop";
    pub const STATUS: &str = "status";
    pub const ZONE_COUNT: &str = "zone_count";
    pub const USE_12H: &str = "use_12h";
    pub const PUMP_MASTER_VALVE: &str = "pump_master_valve";
    pub const SYNC_NEEDED: &str = "sync_needed";
    pub const SCHEDULE_ENABLE: &str = "schedule_enable";
}

const WEEKDAYS: &[&str] = &[
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

/// Named suffixes and the key each one canonicalises to, longest first
///
/// A suffix matches the whole tail or a `_`-separated end of it.
const VOCABULARY: &[(&str, &str)] = &[
    ("rain_sensor_enabled", "rain_sensor"),
    ("rain_delay_enabled", "rain_delay_enabled"),
    ("use_12_hour_format", keys::USE_12H),
    ("master_valve_pump", keys::PUMP_MASTER_VALVE),
    ("pump_master_valve", keys::PUMP_MASTER_VALVE),
    ("rain_delay_active", "rain_delay_active"),
    ("start_stop_resume", keys::START_STOP),
    ("progress_percent", "progress"),
    ("schedule_enabled", keys::SCHEDULE_ENABLE),
    ("enable_schedule", keys::SCHEDULE_ENABLE),
    ("main_start_stop", keys::START_STOP),
    ("rain_delay_days", "rain_delay_days"),
    ("schedule_enable", keys::SCHEDULE_ENABLE),
    ("12_hour_format", keys::USE_12H),
    ("detected_zones", keys::ZONE_COUNT),
    ("remaining_time", "time_remaining"),
    ("time_remaining", "time_remaining"),
    ("repeat_cycles", "repeat_cycles"),
    ("auto_advance", "auto_advance"),
    ("current_zone", "current_zone"),
    ("pump_master", keys::PUMP_MASTER_VALVE),
    ("rain_sensor", "rain_sensor"),
    ("sync_needed", keys::SYNC_NEEDED),
    ("needs_sync", keys::SYNC_NEEDED),
    ("rain_delay", "rain_delay"),
    ("start_stop", keys::START_STOP),
    ("zone_count", keys::ZONE_COUNT),
    ("next_zone", "next_zone"),
    ("progress", "progress"),
    ("use_12h", keys::USE_12H),
    ("status", keys::STATUS),
];

/// How a rule turns its match into a key
#[derive(Debug, Clone, Copy)]
enum Template {
    /// `{prefix}{N}{suffix}` from the first non-empty numeric capture
    Indexed(&'static str, &'static str),
    /// `schedule_{day}` from the captured weekday
    Weekday,
}

/// One classification rule
#[derive(Debug)]
pub struct Rule {
    name: &'static str,
    pattern: Regex,
    template: Template,
    /// Skip the match when the text before it ends with this
    unless_preceded_by: Option<&'static str>,
}

impl Rule {
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn apply(&self, tail: &str) -> Option<FunctionalKey> {
        let caps = self.pattern.captures(tail)?;
        let whole = caps.get(0)?;
        if let Some(prefix) = self.unless_preceded_by {
            if tail[..whole.start()].ends_with(prefix) {
                return None;
            }
        }
        let value = caps.iter().skip(1).flatten().next()?.as_str();

        match self.template {
            Template::Indexed(prefix, suffix) => {
                let n: u32 = value.parse().ok()?;
                Some(FunctionalKey(format!("{prefix}{n}{suffix}")))
            }
            Template::Weekday => Some(FunctionalKey(format!("schedule_{value}"))),
        }
    }
}

fn rule(
    name: &'static str,
    pattern: &str,
    template: Template,
    unless_preceded_by: Option<&'static str>,
) -> Rule {
    Rule {
        name,
        // Patterns are literals in this file; a typo is a programming error
        pattern: Regex::new(pattern).unwrap_or_else(|e| panic!("bad rule '{name}': {e}")),
        template,
        unless_preceded_by,
    }
}

/// The ordered rule table, most specific first
pub fn rules() -> &'static [Rule] {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES.get_or_init(|| {
        vec![
            rule(
                "schedule_start_time",
                r"(?:^|_)(?:schedule_)?start_time_?(\d+)$",
                Template::Indexed("schedule_start_time_", ""),
                None,
            ),
            rule(
                "zone_duration",
                r"(?:^|_)zone_?(\d+)_(?:run_)?duration$|(?:^|_)duration_zone_?(\d+)$",
                Template::Indexed("zone_", "_duration"),
                None,
            ),
            rule(
                "zone",
                r"(?:^|_)zone_?(\d+)$",
                Template::Indexed("zone_", ""),
                Some("enable"),
            ),
            rule(
                "zone_enable",
                r"(?:^|_)enable_zone_?(\d+)$|(?:^|_)zone_?(\d+)_enabled?$",
                Template::Indexed("zone_", "_enable"),
                None,
            ),
            rule(
                "zone_mode",
                r"(?:^|_)zone_?(\d+)_mode$",
                Template::Indexed("zone_", "_mode"),
                None,
            ),
            rule(
                "weekday_schedule",
                r"(?:^|_)(monday|tuesday|wednesday|thursday|friday|saturday|sunday)(?:_(?:schedule|enabled?))?$",
                Template::Weekday,
                None,
            ),
        ]
    })
}

/// Classify an entity identifier (`domain.object_id` or a bare tail)
pub fn classify(raw: &str) -> FunctionalKey {
    let tail = match raw.split_once('.') {
        Some((_, tail)) => tail,
        None => raw,
    };
    classify_tail(&tail.to_ascii_lowercase())
}

/// Classify a domain-stripped, lower-cased tail
pub fn classify_tail(tail: &str) -> FunctionalKey {
    for rule in rules() {
        if let Some(key) = rule.apply(tail) {
            return key;
        }
    }

    for (suffix, key) in VOCABULARY {
        if tail == *suffix
            || tail
                .strip_suffix(suffix)
                .is_some_and(|head| head.ends_with('_'))
        {
            return FunctionalKey::new(*key);
        }
    }

    FunctionalKey::new(tail)
}
