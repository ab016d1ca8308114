//! Domain write semantics
//!
//! Each hub domain is written through its own service. The broker only ever
//! needs to know which family a target domain belongs to; the payload shape
//! follows from that.

/// Domains that only report state and cannot be written
pub static READONLY_DOMAINS: &[&str] = &[
    "sensor",
    "binary_sensor",
    "weather",
    "device_tracker",
    "sun",
    "zone",
    "person",
    "calendar",
    "image",
    "event",
    "update",
];

/// Check if a domain is read-only
pub fn is_readonly_domain(domain: &str) -> bool {
    READONLY_DOMAINS.contains(&domain)
}

/// How a target domain is written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    /// `turn_on` / `turn_off`
    Toggle,
    /// `open_valve` / `close_valve`
    Valve,
    /// `set_value` with a numeric `value`
    Number,
    /// `set_value` with a string `value`
    Text,
    /// `select_option` with an `option`
    Select,
    /// `press`, payload ignored
    Press,
    /// Cannot be written
    ReadOnly,
}

impl WriteKind {
    /// Classify a domain by how it is written
    pub fn for_domain(domain: &str) -> Self {
        match domain {
            "switch" | "input_boolean" | "light" | "fan" => Self::Toggle,
            "valve" => Self::Valve,
            "number" | "input_number" => Self::Number,
            "text" | "input_text" => Self::Text,
            "select" | "input_select" => Self::Select,
            "button" | "input_button" => Self::Press,
            _ => Self::ReadOnly,
        }
    }

    /// Whether entities of this kind accept writes
    pub fn is_writable(self) -> bool {
        self != Self::ReadOnly
    }

    /// Service name for this kind, given whether the value is "active"
    pub fn service(self, active: bool) -> Option<&'static str> {
        match (self, active) {
            (Self::Toggle, true) => Some("turn_on"),
            (Self::Toggle, false) => Some("turn_off"),
            (Self::Valve, true) => Some("open_valve"),
            (Self::Valve, false) => Some("close_valve"),
            (Self::Number | Self::Text, _) => Some("set_value"),
            (Self::Select, _) => Some("select_option"),
            (Self::Press, _) => Some("press"),
            (Self::ReadOnly, _) => None,
        }
    }
}
