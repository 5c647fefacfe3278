//! Input-symbol table
//!
//! Name/code lookups for the kernel event-code space (`EV_KEY`, `EV_REL`,
//! `EV_ABS`), plus layout-specific aliases harvested from the host keyboard
//! layout (`xmodmap.json`). Lookups are case-insensitive.

use std::collections::HashMap;
use std::str::FromStr;

use evdev::Key;
use serde::{Deserialize, Serialize};

/// Reserved output symbol that maps a combination to nothing.
pub const DISABLE_NAME: &str = "disable";

/// The event types the engine routes. Serialized as the raw kernel type id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum EventKind {
    Syn,
    Key,
    Rel,
    Abs,
    Msc,
    Led,
    Ff,
}

impl EventKind {
    pub fn raw(self) -> u16 {
        match self {
            EventKind::Syn => 0x00,
            EventKind::Key => 0x01,
            EventKind::Rel => 0x02,
            EventKind::Abs => 0x03,
            EventKind::Msc => 0x04,
            EventKind::Led => 0x11,
            EventKind::Ff => 0x15,
        }
    }

    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0x00 => Some(EventKind::Syn),
            0x01 => Some(EventKind::Key),
            0x02 => Some(EventKind::Rel),
            0x03 => Some(EventKind::Abs),
            0x04 => Some(EventKind::Msc),
            0x11 => Some(EventKind::Led),
            0x15 => Some(EventKind::Ff),
            _ => None,
        }
    }

    /// Short name as used in preset files and macro `event()` calls.
    pub fn name(self) -> &'static str {
        match self {
            EventKind::Syn => "EV_SYN",
            EventKind::Key => "EV_KEY",
            EventKind::Rel => "EV_REL",
            EventKind::Abs => "EV_ABS",
            EventKind::Msc => "EV_MSC",
            EventKind::Led => "EV_LED",
            EventKind::Ff => "EV_FF",
        }
    }

    pub fn parse_name(name: &str) -> Option<Self> {
        match name.to_uppercase().as_str() {
            "EV_SYN" | "SYN" => Some(EventKind::Syn),
            "EV_KEY" | "KEY" => Some(EventKind::Key),
            "EV_REL" | "REL" => Some(EventKind::Rel),
            "EV_ABS" | "ABS" => Some(EventKind::Abs),
            "EV_MSC" | "MSC" => Some(EventKind::Msc),
            "EV_LED" | "LED" => Some(EventKind::Led),
            "EV_FF" | "FF" => Some(EventKind::Ff),
            _ => None,
        }
    }
}

impl From<EventKind> for u16 {
    fn from(kind: EventKind) -> u16 {
        kind.raw()
    }
}

impl TryFrom<u16> for EventKind {
    type Error = String;

    fn try_from(raw: u16) -> Result<Self, Self::Error> {
        EventKind::from_raw(raw).ok_or_else(|| format!("unknown event type {raw}"))
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// EV_REL axis names, `linux/input-event-codes.h` order.
const REL_NAMES: &[(&str, u16)] = &[
    ("REL_X", 0x00),
    ("REL_Y", 0x01),
    ("REL_Z", 0x02),
    ("REL_RX", 0x03),
    ("REL_RY", 0x04),
    ("REL_RZ", 0x05),
    ("REL_HWHEEL", 0x06),
    ("REL_DIAL", 0x07),
    ("REL_WHEEL", 0x08),
    ("REL_MISC", 0x09),
    ("REL_WHEEL_HI_RES", 0x0b),
    ("REL_HWHEEL_HI_RES", 0x0c),
];

/// EV_ABS axis names, without the multitouch range.
const ABS_NAMES: &[(&str, u16)] = &[
    ("ABS_X", 0x00),
    ("ABS_Y", 0x01),
    ("ABS_Z", 0x02),
    ("ABS_RX", 0x03),
    ("ABS_RY", 0x04),
    ("ABS_RZ", 0x05),
    ("ABS_THROTTLE", 0x06),
    ("ABS_RUDDER", 0x07),
    ("ABS_WHEEL", 0x08),
    ("ABS_GAS", 0x09),
    ("ABS_BRAKE", 0x0a),
    ("ABS_HAT0X", 0x10),
    ("ABS_HAT0Y", 0x11),
    ("ABS_HAT1X", 0x12),
    ("ABS_HAT1Y", 0x13),
    ("ABS_HAT2X", 0x14),
    ("ABS_HAT2Y", 0x15),
    ("ABS_HAT3X", 0x16),
    ("ABS_HAT3Y", 0x17),
    ("ABS_PRESSURE", 0x18),
    ("ABS_DISTANCE", 0x19),
    ("ABS_TILT_X", 0x1a),
    ("ABS_TILT_Y", 0x1b),
    ("ABS_TOOL_WIDTH", 0x1c),
    ("ABS_VOLUME", 0x20),
    ("ABS_MISC", 0x28),
];

/// Highest EV_KEY code the table harvests names for.
const KEY_CODE_MAX: u16 = 0x2e7;

/// Name/code lookups for keys and axes.
///
/// Built once at engine startup and carried by reference in the injection
/// context. The key table is harvested from the evdev constant names so it
/// matches whatever the kernel headers the crate was built against define;
/// `apply_overrides` layers the host layout's xmodmap names on top.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    key_by_name: HashMap<String, u16>,
    name_by_key: HashMap<u16, String>,
    rel_by_name: HashMap<String, u16>,
    name_by_rel: HashMap<u16, String>,
    abs_by_name: HashMap<String, u16>,
    name_by_abs: HashMap<u16, String>,
}

impl SymbolTable {
    pub fn new() -> Self {
        let mut key_by_name = HashMap::new();
        let mut name_by_key = HashMap::new();

        for code in 1..=KEY_CODE_MAX {
            let name = format!("{:?}", Key::new(code));
            if !name.starts_with("KEY_") && !name.starts_with("BTN_") {
                continue;
            }
            key_by_name.insert(name.to_lowercase(), code);
            name_by_key.entry(code).or_insert(name.clone());

            // "KEY_A" is also reachable as "a", "KEY_1" as "1"
            if let Some(short) = name.strip_prefix("KEY_") {
                if short.len() == 1 {
                    key_by_name.insert(short.to_lowercase(), code);
                }
            }
        }

        let mut rel_by_name = HashMap::new();
        let mut name_by_rel = HashMap::new();
        for &(name, code) in REL_NAMES {
            rel_by_name.insert(name.to_lowercase(), code);
            name_by_rel.insert(code, name.to_string());
        }

        let mut abs_by_name = HashMap::new();
        let mut name_by_abs = HashMap::new();
        for &(name, code) in ABS_NAMES {
            abs_by_name.insert(name.to_lowercase(), code);
            name_by_abs.insert(code, name.to_string());
        }

        Self {
            key_by_name,
            name_by_key,
            rel_by_name,
            name_by_rel,
            abs_by_name,
            name_by_abs,
        }
    }

    /// Layer layout-specific aliases on top of the kernel names.
    ///
    /// Existing kernel names are never displaced as the canonical
    /// code-to-name direction; overrides only add lookup aliases.
    pub fn apply_overrides(&mut self, overrides: &HashMap<String, u16>) {
        for (name, &code) in overrides {
            self.key_by_name.insert(name.to_lowercase(), code);
        }
    }

    /// Look up a key code by name. `"a"`, `"KEY_A"` and `"key_a"` all work.
    pub fn key(&self, name: &str) -> Option<u16> {
        let lower = name.to_lowercase();
        if let Some(&code) = self.key_by_name.get(&lower) {
            return Some(code);
        }

        // escape hatch for raw kernel names the harvest may have missed
        if lower.starts_with("key_") || lower.starts_with("btn_") {
            if let Ok(key) = Key::from_str(&name.to_uppercase()) {
                return Some(key.code());
            }
        }

        None
    }

    pub fn key_name(&self, code: u16) -> Option<&str> {
        self.name_by_key.get(&code).map(String::as_str)
    }

    pub fn rel(&self, name: &str) -> Option<u16> {
        self.rel_by_name.get(&name.to_lowercase()).copied()
    }

    pub fn abs(&self, name: &str) -> Option<u16> {
        self.abs_by_name.get(&name.to_lowercase()).copied()
    }

    /// Look up a code by name within one event type.
    pub fn code(&self, kind: EventKind, name: &str) -> Option<u16> {
        match kind {
            EventKind::Key => self.key(name),
            EventKind::Rel => self.rel(name),
            EventKind::Abs => self.abs(name),
            _ => None,
        }
    }

    /// Human-readable name for a `(type, code)` pair, falling back to the
    /// numeric code for unnamed entries.
    pub fn name(&self, kind: EventKind, code: u16) -> String {
        let known = match kind {
            EventKind::Key => self.name_by_key.get(&code),
            EventKind::Rel => self.name_by_rel.get(&code),
            EventKind::Abs => self.name_by_abs.get(&code),
            _ => None,
        };
        match known {
            Some(name) => name.clone(),
            None => format!("{} {}", kind.name(), code),
        }
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looks_up_keys_case_insensitively() {
        let table = SymbolTable::new();
        assert_eq!(table.key("KEY_A"), Some(Key::KEY_A.code()));
        assert_eq!(table.key("key_a"), Some(Key::KEY_A.code()));
        assert_eq!(table.key("a"), Some(Key::KEY_A.code()));
        assert_eq!(table.key("A"), Some(Key::KEY_A.code()));
    }

    #[test]
    fn looks_up_buttons() {
        let table = SymbolTable::new();
        assert_eq!(table.key("BTN_LEFT"), Some(Key::BTN_LEFT.code()));
        assert_eq!(table.key("btn_south"), Some(Key::BTN_SOUTH.code()));
    }

    #[test]
    fn unknown_names_are_none() {
        let table = SymbolTable::new();
        assert_eq!(table.key("KEY_DOES_NOT_EXIST"), None);
        assert_eq!(table.key("qwertz"), None);
    }

    #[test]
    fn rel_and_abs_axes() {
        let table = SymbolTable::new();
        assert_eq!(table.rel("REL_X"), Some(0));
        assert_eq!(table.rel("rel_wheel"), Some(0x08));
        assert_eq!(table.abs("ABS_HAT0X"), Some(0x10));
        assert_eq!(table.code(EventKind::Abs, "ABS_Y"), Some(1));
    }

    #[test]
    fn names_round_trip() {
        let table = SymbolTable::new();
        let code = table.key("key_esc").unwrap();
        assert_eq!(table.key_name(code), Some("KEY_ESC"));
        assert_eq!(table.name(EventKind::Rel, 0x08), "REL_WHEEL");
        assert_eq!(table.name(EventKind::Rel, 0xff), "EV_REL 255");
    }

    #[test]
    fn overrides_add_aliases() {
        let mut table = SymbolTable::new();
        let mut overrides = HashMap::new();
        overrides.insert("odiaeresis".to_string(), Key::KEY_SEMICOLON.code());
        table.apply_overrides(&overrides);
        assert_eq!(table.key("odiaeresis"), Some(Key::KEY_SEMICOLON.code()));
        // canonical reverse lookup is untouched
        assert_eq!(table.key_name(Key::KEY_SEMICOLON.code()), Some("KEY_SEMICOLON"));
    }

    #[test]
    fn event_kind_serde_uses_raw_ids() {
        let json = serde_json::to_string(&EventKind::Key).unwrap();
        assert_eq!(json, "1");
        let kind: EventKind = serde_json::from_str("3").unwrap();
        assert_eq!(kind, EventKind::Abs);
        assert!(serde_json::from_str::<EventKind>("99").is_err());
    }
}
