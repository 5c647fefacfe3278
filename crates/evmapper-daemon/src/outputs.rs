//! Virtual output devices
//!
//! A fixed set of named uinputs (`keyboard`, `mouse`, `gamepad`, `stylus`,
//! `keyboard + mouse`) is opened once per daemon lifetime, each advertising
//! the capability set declared in `evmapper-config`. Injections additionally
//! own a per-injection "forwarded" device that clones the capabilities of
//! the grabbed sub-devices so unconsumed events stay emittable.
//!
//! Writes are serialized per device and followed by a SYN_REPORT. A failed
//! write is retried a couple of times, then that single emission is dropped.
//!
//! The recording backend stands in for `/dev/uinput` in tests and anywhere
//! events only need to be observed, mirroring how the reference service
//! swaps in a fake uinput for its frontend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{AbsInfo, AbsoluteAxisType, AttributeSet, EventType, InputEvent, Key, RelativeAxisType, UinputAbsSetup};
use evmapper_config::targets::{self, Capabilities};
use evmapper_config::{EventKind, TargetDevice};

/// Prefix of every virtual device name. The inventory skips devices carrying
/// it so the daemon never grabs its own outputs.
pub const DEV_NAME: &str = "evmapper";

const WRITE_RETRIES: usize = 3;

/// A plain `(type, code, value)` event as routed through the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub code: u16,
    pub value: i32,
}

impl Event {
    pub fn new(kind: EventKind, code: u16, value: i32) -> Self {
        Self { kind, code, value }
    }

    pub fn key(code: u16, value: i32) -> Self {
        Self::new(EventKind::Key, code, value)
    }

    pub fn is_press(&self) -> bool {
        self.kind == EventKind::Key && self.value == 1
    }

    pub fn is_release(&self) -> bool {
        self.kind == EventKind::Key && self.value == 0
    }

    pub fn to_input_event(self) -> InputEvent {
        InputEvent::new(EventType(self.kind.raw()), self.code, self.value)
    }

    pub fn from_input_event(event: &InputEvent) -> Option<Self> {
        let kind = EventKind::from_raw(event.event_type().0)?;
        Some(Self::new(kind, event.code(), event.value()))
    }
}

enum Sink {
    Uinput(Mutex<VirtualDevice>),
    /// Test backend: appends written events instead of emitting them.
    Recording(Mutex<Vec<Event>>),
}

/// One virtual device with a fixed capability declaration.
pub struct VirtualOutput {
    name: String,
    capabilities: Capabilities,
    sink: Sink,
}

impl VirtualOutput {
    fn open(name: String, capabilities: Capabilities) -> Result<Self> {
        let mut builder = VirtualDeviceBuilder::new()
            .with_context(|| format!("failed to open /dev/uinput for \"{name}\""))?
            .name(&name);

        if !capabilities.keys.is_empty() {
            let mut keys = AttributeSet::<Key>::new();
            for &code in &capabilities.keys {
                keys.insert(Key::new(code));
            }
            builder = builder.with_keys(&keys)?;
        }

        if !capabilities.rel.is_empty() {
            let mut axes = AttributeSet::<RelativeAxisType>::new();
            for &code in &capabilities.rel {
                axes.insert(RelativeAxisType(code));
            }
            builder = builder.with_relative_axes(&axes)?;
        }

        for &code in &capabilities.abs {
            let (min, max) = targets::abs_range(code);
            let setup = UinputAbsSetup::new(
                AbsoluteAxisType(code),
                AbsInfo::new(0, min, max, 0, 0, 0),
            );
            builder = builder.with_absolute_axis(&setup)?;
        }

        let device = builder
            .build()
            .with_context(|| format!("failed to create uinput device \"{name}\""))?;

        tracing::debug!("created uinput device \"{name}\"");

        Ok(Self {
            name,
            capabilities,
            sink: Sink::Uinput(Mutex::new(device)),
        })
    }

    fn recording(name: String, capabilities: Capabilities) -> Self {
        Self {
            name,
            capabilities,
            sink: Sink::Recording(Mutex::new(Vec::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this device advertises `(kind, code)`.
    pub fn can_emit(&self, kind: EventKind, code: u16) -> bool {
        self.capabilities.supports(kind, code)
    }

    /// Write one event followed by a SYN_REPORT.
    ///
    /// Transient uinput failures are retried up to a small bound; after that
    /// this single emission is dropped with a warning.
    pub fn write(&self, event: Event) {
        match &self.sink {
            Sink::Recording(log) => {
                log.lock().expect("recording sink poisoned").push(event);
            }
            Sink::Uinput(device) => {
                let events = [
                    event.to_input_event(),
                    InputEvent::new(EventType::SYNCHRONIZATION, 0, 0),
                ];
                let mut device = device.lock().expect("uinput sink poisoned");
                for attempt in 1..=WRITE_RETRIES {
                    match device.emit(&events) {
                        Ok(()) => return,
                        Err(error) if attempt < WRITE_RETRIES => {
                            tracing::debug!(
                                "transient write failure on \"{}\" (attempt {attempt}): {error}",
                                self.name
                            );
                        }
                        Err(error) => {
                            tracing::warn!(
                                "dropping event {:?} for \"{}\": {error}",
                                event,
                                self.name
                            );
                        }
                    }
                }
            }
        }
    }

    /// Events captured by the recording backend, in write order.
    pub fn recorded(&self) -> Vec<Event> {
        match &self.sink {
            Sink::Recording(log) => log.lock().expect("recording sink poisoned").clone(),
            Sink::Uinput(_) => Vec::new(),
        }
    }
}

/// The fixed set of named virtual outputs, created once per daemon.
pub struct OutputRegistry {
    outputs: HashMap<TargetDevice, Arc<VirtualOutput>>,
    recording: bool,
}

impl OutputRegistry {
    /// Open every named target as a real uinput device.
    pub fn open() -> Result<Self> {
        let mut outputs = HashMap::new();
        for target in TargetDevice::ALL {
            let name = format!("{DEV_NAME} {target}");
            let output = VirtualOutput::open(name, targets::capabilities(target))?;
            outputs.insert(target, Arc::new(output));
        }
        Ok(Self {
            outputs,
            recording: false,
        })
    }

    /// A registry backed by recording sinks, for tests.
    pub fn recording() -> Self {
        let mut outputs = HashMap::new();
        for target in TargetDevice::ALL {
            let name = format!("{DEV_NAME} {target}");
            let output = VirtualOutput::recording(name, targets::capabilities(target));
            outputs.insert(target, Arc::new(output));
        }
        Self {
            outputs,
            recording: true,
        }
    }

    pub fn get(&self, target: TargetDevice) -> Arc<VirtualOutput> {
        Arc::clone(&self.outputs[&target])
    }

    /// Write to a named target, dropping events the target cannot emit.
    pub fn write(&self, target: TargetDevice, event: Event) {
        let output = &self.outputs[&target];
        if event.kind != EventKind::Syn && !output.can_emit(event.kind, event.code) {
            tracing::warn!(
                "\"{}\" does not advertise {} {}, dropping event",
                output.name(),
                event.kind,
                event.code
            );
            return;
        }
        output.write(event);
    }

    /// Create the per-injection forwarded device from the capabilities of
    /// the grabbed sub-devices.
    pub fn create_forward(&self, group_name: &str, capabilities: Capabilities) -> Result<Arc<VirtualOutput>> {
        let name = format!("{DEV_NAME} {group_name} forwarded");
        let output = if self.recording {
            VirtualOutput::recording(name, capabilities)
        } else {
            VirtualOutput::open(name, capabilities)?
        };
        Ok(Arc::new(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_registry_captures_writes() {
        let registry = OutputRegistry::recording();
        registry.write(TargetDevice::Keyboard, Event::key(30, 1));
        registry.write(TargetDevice::Keyboard, Event::key(30, 0));

        let keyboard = registry.get(TargetDevice::Keyboard);
        assert_eq!(
            keyboard.recorded(),
            vec![Event::key(30, 1), Event::key(30, 0)]
        );
        // other outputs are untouched
        assert!(registry.get(TargetDevice::Mouse).recorded().is_empty());
    }

    #[test]
    fn unadvertised_events_are_dropped() {
        let registry = OutputRegistry::recording();
        // keyboard has no relative axes
        registry.write(TargetDevice::Keyboard, Event::new(EventKind::Rel, 0, 5));
        assert!(registry.get(TargetDevice::Keyboard).recorded().is_empty());
    }

    #[test]
    fn event_converts_to_evdev_and_back() {
        let event = Event::new(EventKind::Abs, 3, -128);
        let raw = event.to_input_event();
        assert_eq!(Event::from_input_event(&raw), Some(event));
    }
}
