//! Per-injection context and the process-wide shared variable store

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use evmapper_config::{CompiledPreset, SymbolTable};

use crate::outputs::{OutputRegistry, VirtualOutput};

/// A value in the shared variable store.
#[derive(Debug, Clone, PartialEq)]
pub enum VarValue {
    Int(i64),
    Str(String),
}

/// Process-wide variable store, readable and writable by macros running in
/// any injection. Mutations are serialized by the lock; readers observe the
/// last completed write. Initialized empty at daemon start.
#[derive(Debug, Clone, Default)]
pub struct SharedVars {
    values: Arc<Mutex<HashMap<String, VarValue>>>,
}

impl SharedVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<VarValue> {
        self.values.lock().expect("variable store poisoned").get(name).cloned()
    }

    pub fn set(&self, name: &str, value: VarValue) {
        self.values
            .lock()
            .expect("variable store poisoned")
            .insert(name.to_string(), value);
    }

    /// Atomic increment. A missing variable counts from 0; a string value
    /// is replaced by the increment.
    pub fn add(&self, name: &str, amount: i64) {
        let mut values = self.values.lock().expect("variable store poisoned");
        let current = match values.get(name) {
            Some(VarValue::Int(n)) => *n,
            _ => 0,
        };
        values.insert(name.to_string(), VarValue::Int(current + amount));
    }
}

/// Kernel LED state, sampled from the grabbed devices at injection start and
/// tracked from EV_LED events thereafter.
#[derive(Debug, Default)]
pub struct LedState {
    pub capslock: AtomicBool,
    pub numlock: AtomicBool,
}

pub const LED_NUML: u16 = 0x00;
pub const LED_CAPSL: u16 = 0x01;

impl LedState {
    pub fn update(&self, code: u16, on: bool) {
        match code {
            LED_NUML => self.numlock.store(on, Ordering::Relaxed),
            LED_CAPSL => self.capslock.store(on, Ordering::Relaxed),
            _ => {}
        }
    }
}

/// The immutable bundle a running injection carries: validated preset,
/// symbol table, virtual output handles, forwarded device, the shared
/// variable store and a little per-injection runtime state.
pub struct Context {
    pub preset: CompiledPreset,
    pub symbols: Arc<SymbolTable>,
    pub outputs: Arc<OutputRegistry>,
    /// Receives everything the injection chose not to consume.
    pub forward: Arc<VirtualOutput>,
    pub vars: SharedVars,
    /// `(origin_hash, abs code)` to the device-declared axis range.
    pub abs_ranges: HashMap<(String, u16), (i32, i32)>,
    pub leds: LedState,
    /// Total key presses seen by this injection, for `if_single`/`mod_tap`.
    pub press_counter: AtomicU64,
    /// Macro execution failures, exposed for observability.
    pub macro_errors: AtomicU64,
}

impl Context {
    pub fn new(
        preset: CompiledPreset,
        symbols: Arc<SymbolTable>,
        outputs: Arc<OutputRegistry>,
        forward: Arc<VirtualOutput>,
        vars: SharedVars,
    ) -> Self {
        Self {
            preset,
            symbols,
            outputs,
            forward,
            vars,
            abs_ranges: HashMap::new(),
            leds: LedState::default(),
            press_counter: AtomicU64::new(0),
            macro_errors: AtomicU64::new(0),
        }
    }

    /// The `[min, max]` the origin device declared for an absolute axis.
    pub fn abs_range(&self, origin: &str, code: u16) -> (i32, i32) {
        self.abs_ranges
            .get(&(origin.to_string(), code))
            .copied()
            .unwrap_or((-32768, 32767))
    }

    pub fn count_press(&self) {
        self.press_counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn presses(&self) -> u64 {
        self.press_counter.load(Ordering::Relaxed)
    }
}
