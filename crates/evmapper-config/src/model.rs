//! Preset and mapping data model
//!
//! The on-disk shape is stable: a preset file is an ordered JSON array of
//! mapping records, each with an `input_combination` array of input configs
//! plus the output and shaping fields. Optional fields carry the documented
//! defaults and are omitted when default on write.

use serde::{Deserialize, Serialize};

use crate::keys::{EventKind, SymbolTable};

/// One condition inside an input combination.
///
/// `analog_threshold` selects between the three regimes of an analog input:
/// absent or zero means the config *is* the analog axis of the combination;
/// for `EV_ABS` it is a percentage of the normalized axis range in
/// `[-100, 100]`; for `EV_REL` it is a raw speed with the sign giving the
/// direction. It is ignored for `EV_KEY`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub code: u16,
    /// Binds the config to one sub-device of the group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analog_threshold: Option<i32>,
}

impl InputConfig {
    pub fn key(code: u16) -> Self {
        Self {
            kind: EventKind::Key,
            code,
            origin_hash: None,
            analog_threshold: None,
        }
    }

    /// Whether this config feeds an analog axis rather than acting as a
    /// (possibly thresholded) button condition.
    pub fn defines_analog_input(&self) -> bool {
        matches!(self.kind, EventKind::Abs | EventKind::Rel)
            && self.analog_threshold.unwrap_or(0) == 0
    }

    /// Identity used to match incoming events against this config.
    pub fn match_key(&self) -> InputMatchKey {
        InputMatchKey {
            kind: self.kind,
            code: self.code,
            origin_hash: self.origin_hash.clone(),
        }
    }
}

/// Routing identity of an input config: type, code, and the optional
/// sub-device binding. Two configs with the same match key respond to the
/// same events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputMatchKey {
    pub kind: EventKind,
    pub code: u16,
    pub origin_hash: Option<String>,
}

impl InputMatchKey {
    /// Whether an event `(kind, code)` from `origin` satisfies this key.
    pub fn matches(&self, kind: EventKind, code: u16, origin: &str) -> bool {
        self.kind == kind
            && self.code == code
            && self
                .origin_hash
                .as_deref()
                .map(|wanted| wanted == origin)
                .unwrap_or(true)
    }
}

/// Ordered list of input configs that must all be satisfied at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputCombination(pub Vec<InputConfig>);

impl InputCombination {
    pub fn new(configs: Vec<InputConfig>) -> Self {
        Self(configs)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, InputConfig> {
        self.0.iter()
    }

    /// The analog-axis config, if the combination has one.
    pub fn analog_input(&self) -> Option<&InputConfig> {
        self.0.iter().find(|config| config.defines_analog_input())
    }

    /// All configs acting as button conditions (keys and thresholded axes).
    pub fn key_inputs(&self) -> impl Iterator<Item = &InputConfig> {
        self.0.iter().filter(|config| !config.defines_analog_input())
    }

    /// Identity of the combination as a multiset of its configs. Two
    /// combinations with the same configs in a different order are the same
    /// mapping slot.
    pub fn identity(&self) -> Vec<InputConfig> {
        let mut configs = self.0.clone();
        configs.sort_by_key(|config| {
            (
                config.kind,
                config.code,
                config.origin_hash.clone(),
                config.analog_threshold,
            )
        });
        configs
    }

    /// Render "LEFTCTRL + A"-style names for logs and listings.
    pub fn beautify(&self, symbols: &SymbolTable) -> String {
        self.0
            .iter()
            .map(|config| {
                let name = symbols.name(config.kind, config.code);
                let name = name
                    .strip_prefix("KEY_")
                    .or_else(|| name.strip_prefix("BTN_"))
                    .map(str::to_string)
                    .unwrap_or(name);
                match config.analog_threshold {
                    Some(threshold) if threshold != 0 => format!("{name} {threshold:+}"),
                    _ => name,
                }
            })
            .collect::<Vec<_>>()
            .join(" + ")
    }
}

/// The fixed set of virtual devices a mapping can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetDevice {
    #[serde(rename = "keyboard")]
    Keyboard,
    #[serde(rename = "mouse")]
    Mouse,
    #[serde(rename = "gamepad")]
    Gamepad,
    #[serde(rename = "stylus")]
    Stylus,
    #[serde(rename = "keyboard + mouse")]
    KeyboardMouse,
}

impl TargetDevice {
    pub const ALL: [TargetDevice; 5] = [
        TargetDevice::Keyboard,
        TargetDevice::Mouse,
        TargetDevice::Gamepad,
        TargetDevice::Stylus,
        TargetDevice::KeyboardMouse,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TargetDevice::Keyboard => "keyboard",
            TargetDevice::Mouse => "mouse",
            TargetDevice::Gamepad => "gamepad",
            TargetDevice::Stylus => "stylus",
            TargetDevice::KeyboardMouse => "keyboard + mouse",
        }
    }
}

impl std::fmt::Display for TargetDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn default_true() -> bool {
    true
}

fn default_deadzone() -> f64 {
    0.1
}

fn default_gain() -> f64 {
    1.0
}

fn default_rel_rate() -> u16 {
    60
}

fn default_rel_to_abs_input_cutoff() -> f64 {
    2.0
}

fn default_release_timeout() -> f64 {
    0.05
}

/// One `input_combination -> output` rule.
///
/// Exactly one of `output_symbol` (key name or macro text) or the
/// `output_type`/`output_code` pair must be present; validation enforces
/// this together with the shaping-parameter ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    pub input_combination: InputCombination,
    pub target_uinput: TargetDevice,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_type: Option<EventKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_code: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// On trigger, emit synthetic releases for the non-final combination
    /// keys on the forwarded device.
    #[serde(default = "default_true")]
    pub release_combination_keys: bool,

    /// Sleep inserted around the edges of `key()` macro steps, in ms.
    #[serde(default)]
    pub macro_key_sleep_ms: u64,

    // analog shaping
    #[serde(default = "default_deadzone")]
    pub deadzone: f64,
    #[serde(default = "default_gain")]
    pub gain: f64,
    #[serde(default)]
    pub expo: f64,

    /// Frequency in Hz at which EV_REL output ticks are generated.
    #[serde(default = "default_rel_rate")]
    pub rel_rate: u16,

    /// The relative speed treated as full axis deflection when mapping a
    /// relative input onto an absolute axis.
    #[serde(default = "default_rel_to_abs_input_cutoff")]
    pub rel_to_abs_input_cutoff: f64,

    /// Seconds without input after which a relative axis counts as centered.
    #[serde(default = "default_release_timeout")]
    pub release_timeout: f64,
}

impl Mapping {
    /// A plain key-to-key mapping with default shaping.
    pub fn key_to_key(combination: InputCombination, target: TargetDevice, code: u16) -> Self {
        Self {
            input_combination: combination,
            target_uinput: target,
            output_symbol: None,
            output_type: Some(EventKind::Key),
            output_code: Some(code),
            name: None,
            release_combination_keys: true,
            macro_key_sleep_ms: 0,
            deadzone: default_deadzone(),
            gain: default_gain(),
            expo: 0.0,
            rel_rate: default_rel_rate(),
            rel_to_abs_input_cutoff: default_rel_to_abs_input_cutoff(),
            release_timeout: default_release_timeout(),
        }
    }

    pub fn with_symbol(combination: InputCombination, target: TargetDevice, symbol: &str) -> Self {
        Self {
            output_symbol: Some(symbol.to_string()),
            output_type: None,
            output_code: None,
            ..Self::key_to_key(combination, target, 0)
        }
    }

    /// Whether the mapping drives an output axis rather than a key or macro.
    pub fn is_axis_mapping(&self) -> bool {
        matches!(self.output_type, Some(EventKind::Abs) | Some(EventKind::Rel))
    }

    /// Display name for logs and the IPC listing.
    pub fn format_name(&self, symbols: &SymbolTable) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.input_combination.beautify(symbols),
        }
    }
}

/// A named, ordered list of mappings belonging to one device group.
///
/// Loaded from `presets/<group>/<name>.json`; the file holds only the
/// mapping array, name and group come from the path.
#[derive(Debug, Clone, PartialEq)]
pub struct Preset {
    pub name: String,
    pub group_key: String,
    pub mappings: Vec<Mapping>,
}

impl Preset {
    pub fn new(name: impl Into<String>, group_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group_key: group_key.into(),
            mappings: Vec::new(),
        }
    }
}
