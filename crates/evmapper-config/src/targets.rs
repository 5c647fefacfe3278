//! Capability declarations for the virtual output devices
//!
//! Each named target advertises a fixed capability set sized to cover its
//! role. The daemon opens one uinput per target from these declarations at
//! startup; validation rejects mapping outputs a target does not advertise.

use crate::keys::EventKind;
use crate::model::TargetDevice;

/// Axis range advertised for regular absolute axes on virtual outputs.
pub const ABS_RANGE: (i32, i32) = (-32768, 32767);
/// Axis range for hat-switch axes.
pub const HAT_RANGE: (i32, i32) = (-1, 1);

const BTN_MISC_FIRST: u16 = 0x100; // BTN_0
const BTN_MOUSE_FIRST: u16 = 0x110; // BTN_LEFT
const BTN_MOUSE_LAST: u16 = 0x117; // BTN_TASK
const BTN_GAMEPAD_FIRST: u16 = 0x130; // BTN_SOUTH
const BTN_GAMEPAD_LAST: u16 = 0x13e; // BTN_THUMBR
const KEY_EXTENDED_FIRST: u16 = 0x160; // KEY_OK
const KEY_MAX: u16 = 0x2e7;

const BTN_TOOL_PEN: u16 = 0x140;
const BTN_TOOL_RUBBER: u16 = 0x141;
const BTN_TOOL_BRUSH: u16 = 0x142;
const BTN_TOUCH: u16 = 0x14a;
const BTN_STYLUS: u16 = 0x14b;
const BTN_STYLUS2: u16 = 0x14c;

const ABS_PRESSURE: u16 = 0x18;
const ABS_DISTANCE: u16 = 0x19;
const ABS_TILT_X: u16 = 0x1a;
const ABS_TILT_Y: u16 = 0x1b;

/// The capability set one virtual output advertises.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub keys: Vec<u16>,
    pub rel: Vec<u16>,
    pub abs: Vec<u16>,
}

impl Capabilities {
    pub fn supports(&self, kind: EventKind, code: u16) -> bool {
        match kind {
            EventKind::Key => self.keys.contains(&code),
            EventKind::Rel => self.rel.contains(&code),
            EventKind::Abs => self.abs.contains(&code),
            // every output follows writes with SYN_REPORT
            EventKind::Syn => true,
            _ => false,
        }
    }
}

/// Whether an absolute axis code is a hat switch.
pub fn is_hat_axis(code: u16) -> bool {
    (0x10..=0x17).contains(&code)
}

/// The `[min, max]` an output target declares for an absolute axis.
pub fn abs_range(code: u16) -> (i32, i32) {
    if is_hat_axis(code) {
        HAT_RANGE
    } else {
        ABS_RANGE
    }
}

fn keyboard_keys() -> Vec<u16> {
    // the full KEY space minus the button blocks
    (1..BTN_MISC_FIRST)
        .chain(KEY_EXTENDED_FIRST..=KEY_MAX)
        .collect()
}

fn mouse_keys() -> Vec<u16> {
    (BTN_MOUSE_FIRST..=BTN_MOUSE_LAST).collect()
}

fn mouse_rel() -> Vec<u16> {
    // REL_X..REL_MISC plus the hi-res wheel pair
    (0x00..=0x09).chain([0x0b, 0x0c]).collect()
}

/// The fixed capability set for a named target.
pub fn capabilities(target: TargetDevice) -> Capabilities {
    match target {
        TargetDevice::Keyboard => Capabilities {
            keys: keyboard_keys(),
            ..Default::default()
        },
        TargetDevice::Mouse => Capabilities {
            keys: mouse_keys(),
            rel: mouse_rel(),
            ..Default::default()
        },
        TargetDevice::Gamepad => Capabilities {
            keys: (BTN_GAMEPAD_FIRST..=BTN_GAMEPAD_LAST).collect(),
            abs: (0x00..=0x05).chain(0x10..=0x11).collect(),
            ..Default::default()
        },
        TargetDevice::Stylus => Capabilities {
            keys: vec![
                BTN_TOOL_PEN,
                BTN_TOOL_RUBBER,
                BTN_TOOL_BRUSH,
                BTN_TOUCH,
                BTN_STYLUS,
                BTN_STYLUS2,
            ],
            abs: vec![0x00, 0x01, ABS_PRESSURE, ABS_DISTANCE, ABS_TILT_X, ABS_TILT_Y],
            ..Default::default()
        },
        TargetDevice::KeyboardMouse => {
            let mut keys = keyboard_keys();
            keys.extend(mouse_keys());
            Capabilities {
                keys,
                rel: mouse_rel(),
                ..Default::default()
            }
        }
    }
}
